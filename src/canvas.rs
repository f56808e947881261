//! The live canvas WebSocket protocol: one long-lived connection per
//! client, bound to exactly one document after its `join` message. Client
//! messages translate into shared-session operations on the broadcast
//! fabric; failures are reported to the originating client only.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use hyper_tungstenite::{tungstenite::Message, HyperWebsocket};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as Json};
use tokio::sync::mpsc;

use crate::doc::elements::ElementInput;
use crate::error::{ApiError, ErrorCode};
use crate::fabric::{Fabric, SharedDoc};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Join {
        workspace_id: String,
        doc_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Brush {
        points: Vec<Vec<f64>>,
        #[serde(default)]
        color: Option<Json>,
        #[serde(default)]
        line_width: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    Shape {
        shape_type: String,
        xywh: Vec<f64>,
        #[serde(default)]
        fill: Option<Json>,
        #[serde(default)]
        stroke: Option<Json>,
        #[serde(default)]
        stroke_width: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    Text {
        text: String,
        xywh: Vec<f64>,
        #[serde(default)]
        font_size: Option<f64>,
        #[serde(default)]
        color: Option<Json>,
    },
    #[serde(rename_all = "camelCase")]
    Update {
        element_id: String,
        changes: JsonMap<String, Json>,
    },
    #[serde(rename_all = "camelCase")]
    Delete {
        element_id: String,
    },
    Ping,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Init {
        elements: Vec<Json>,
    },
    Add {
        element: Json,
    },
    #[serde(rename_all = "camelCase")]
    Update {
        element_id: String,
        changes: Json,
    },
    #[serde(rename_all = "camelCase")]
    Remove {
        element_id: String,
    },
    Pong,
    Error {
        message: String,
        code: ErrorCode,
    },
}

impl ServerMessage {
    fn error(err: &ApiError) -> ServerMessage {
        ServerMessage::Error {
            message: err.message.clone(),
            code: err.code,
        }
    }
}

/// Drives one canvas connection to completion. Always detaches the client
/// from the fabric on the way out, whatever ended the connection.
pub async fn serve_canvas(websocket: HyperWebsocket, fabric: Arc<Fabric>) {
    let client_id = uuid::Uuid::new_v4().to_string();

    let websocket = match websocket.await {
        Ok(websocket) => websocket,
        Err(err) => {
            log::debug!("canvas upgrade failed for {client_id}: {err}");
            return;
        }
    };
    let (mut sink, mut source) = websocket.split();

    // All outbound traffic funnels through one writer task so fabric
    // fan-out and direct replies cannot interleave mid-frame.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if sink.send(Message::text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut shared: Option<Arc<SharedDoc>> = None;

    while let Some(message) = source.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                log::debug!("canvas client {client_id} socket error: {err}");
                break;
            }
        };

        let text = match message {
            Message::Close(_) => break,
            other => match other.to_text() {
                Ok(text) if !text.is_empty() => text.to_owned(),
                _ => continue,
            },
        };

        let parsed = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(parsed) => parsed,
            Err(err) => {
                let _ = tx.send(ServerMessage::error(&ApiError::invalid(format!(
                    "malformed message: {err}"
                ))));
                continue;
            }
        };

        match handle_message(&client_id, parsed, &mut shared, &tx, &fabric).await {
            Ok(()) => {}
            Err(err) => {
                let _ = tx.send(ServerMessage::error(&err));
            }
        }
    }

    if shared.is_some() {
        fabric.leave(&client_id).await;
    }
    writer.abort();
    log::debug!("canvas client {client_id} disconnected");
}

async fn handle_message(
    client_id: &str,
    message: ClientMessage,
    shared: &mut Option<Arc<SharedDoc>>,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    fabric: &Arc<Fabric>,
) -> Result<(), ApiError> {
    if let ClientMessage::Join {
        workspace_id,
        doc_id,
    } = &message
    {
        if shared.is_some() {
            return Err(ApiError::invalid("session is already joined to a document"));
        }
        let (doc, elements) = fabric
            .join(client_id, tx.clone(), workspace_id, doc_id)
            .await?;
        *shared = Some(doc);
        let _ = tx.send(ServerMessage::Init { elements });
        return Ok(());
    }

    if matches!(message, ClientMessage::Ping) {
        let _ = tx.send(ServerMessage::Pong);
        return Ok(());
    }

    let doc = shared
        .as_ref()
        .ok_or_else(|| ApiError::invalid("join a document before sending operations"))?;

    match message {
        ClientMessage::Brush {
            points,
            color,
            line_width,
        } => {
            doc.create_element(
                client_id,
                ElementInput::Brush {
                    points,
                    color,
                    line_width,
                    extra: JsonMap::new(),
                },
            )
            .await?;
        }
        ClientMessage::Shape {
            shape_type,
            xywh,
            fill,
            stroke,
            stroke_width,
        } => {
            doc.create_element(
                client_id,
                ElementInput::Shape {
                    shape_type,
                    xywh,
                    fill_color: fill,
                    stroke_color: stroke,
                    stroke_width,
                    filled: None,
                    extra: JsonMap::new(),
                },
            )
            .await?;
        }
        ClientMessage::Text {
            text,
            xywh,
            font_size,
            color,
        } => {
            doc.create_element(
                client_id,
                ElementInput::Text {
                    text,
                    xywh,
                    font_size,
                    color,
                    extra: JsonMap::new(),
                },
            )
            .await?;
        }
        ClientMessage::Update {
            element_id,
            changes,
        } => {
            doc.update_element(client_id, &element_id, &changes).await?;
        }
        ClientMessage::Delete { element_id } => {
            doc.delete_element(client_id, &element_id).await?;
        }
        ClientMessage::Join { .. } | ClientMessage::Ping => unreachable!("handled above"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn client_messages_parse_from_wire_shapes() {
        let join: ClientMessage = serde_json::from_str(
            r#"{"type":"join","workspaceId":"W1","docId":"D1"}"#,
        )
        .unwrap();
        assert!(matches!(join, ClientMessage::Join { workspace_id, doc_id }
            if workspace_id == "W1" && doc_id == "D1"));

        let brush: ClientMessage = serde_json::from_str(
            r##"{"type":"brush","points":[[100,100,0.5],[150,100,0.7]],"color":"#ff0000","lineWidth":6}"##,
        )
        .unwrap();
        match brush {
            ClientMessage::Brush {
                points,
                color,
                line_width,
            } => {
                assert_eq!(points.len(), 2);
                assert_eq!(color, Some(json!("#ff0000")));
                assert_eq!(line_width, Some(6.0));
            }
            other => panic!("parsed as {other:?}"),
        }
    }

    #[test]
    fn server_messages_serialize_with_wire_names() {
        let init = serde_json::to_value(ServerMessage::Init {
            elements: vec![json!({"id": "e1"})],
        })
        .unwrap();
        assert_eq!(init, json!({"type": "init", "elements": [{"id": "e1"}]}));

        let update = serde_json::to_value(ServerMessage::Update {
            element_id: "e1".to_owned(),
            changes: json!({"fillColor": "#000"}),
        })
        .unwrap();
        assert_eq!(
            update,
            json!({"type": "update", "elementId": "e1", "changes": {"fillColor": "#000"}})
        );

        let error = serde_json::to_value(ServerMessage::Error {
            message: "no".to_owned(),
            code: ErrorCode::DocNotFound,
        })
        .unwrap();
        assert_eq!(
            error,
            json!({"type": "error", "message": "no", "code": "DOC_NOT_FOUND"})
        );
    }
}
