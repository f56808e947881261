//! The upstream realtime channel: socket.io (engine.io v4) over a single
//! WebSocket, reverse-engineered down to the frames this engine needs.
//!
//! Frame shapes: `0{...}` engine open, `2`/`3` ping/pong, `40` namespace
//! connect, `42<ack?>[event, payload]` events, `43<ack>[payload]` acks and
//! `41` disconnect. Emits carry a monotonically increasing ack id; the
//! reader task resolves the matching oneshot when the `43` frame arrives.
//! Inbound `space:broadcast-doc-update` events are decoded and fanned to
//! per-document subscribers; `space:update-awareness` is ignored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value as Json};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{ApiError, ErrorCode};
use crate::upstream::{LoadedDoc, SpaceChannel};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const SPACE_TYPE: &str = "workspace";

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Json>>>>;
type Subscriptions = Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>>;

/// One connected realtime channel. Cheap to share; all methods take `&self`.
pub struct SocketChannel {
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    pending: Pending,
    subscriptions: Subscriptions,
    next_ack: AtomicU64,
    ack_timeout: Duration,
    closed: Arc<AtomicBool>,
}

fn handshake_error(err: impl std::fmt::Display) -> ApiError {
    ApiError::new(
        ErrorCode::SocketHandshakeFailed,
        format!("realtime handshake failed: {err}"),
    )
}

impl SocketChannel {
    /// Opens the socket, completes the engine.io and namespace handshakes,
    /// and spawns the reader task.
    pub async fn connect(url: &str, cookie_header: &str) -> Result<Arc<SocketChannel>, ApiError> {
        let mut request = url.into_client_request().map_err(handshake_error)?;
        if !cookie_header.is_empty() {
            request.headers_mut().insert(
                COOKIE,
                HeaderValue::from_str(cookie_header).map_err(handshake_error)?,
            );
        }

        let (mut stream, _) = timeout(HANDSHAKE_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| handshake_error("timed out opening socket"))?
            .map_err(handshake_error)?;

        // engine.io open packet, then socket.io namespace connect.
        wait_for_prefix(&mut stream, '0').await?;
        stream
            .send(Message::Text("40".to_owned()))
            .await
            .map_err(handshake_error)?;
        let connected = wait_for_prefix(&mut stream, '4').await?;
        if !connected.starts_with("40") {
            return Err(handshake_error(format!(
                "namespace connect rejected: {connected}"
            )));
        }

        let (sink, source) = stream.split();
        let sink = Arc::new(tokio::sync::Mutex::new(sink));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let subscriptions: Subscriptions = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(read_loop(
            source,
            Arc::clone(&sink),
            Arc::clone(&pending),
            Arc::clone(&subscriptions),
            Arc::clone(&closed),
        ));

        log::debug!("realtime channel connected to {url}");

        Ok(Arc::new(SocketChannel {
            sink,
            pending,
            subscriptions,
            next_ack: AtomicU64::new(1),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            closed,
        }))
    }

    fn ensure_open(&self) -> Result<(), ApiError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ApiError::new(
                ErrorCode::SessionExpired,
                "realtime channel is closed",
            ));
        }
        Ok(())
    }

    /// Emits an event and awaits its structured acknowledgement. A timeout
    /// means *unknown outcome*: the emit may have been applied upstream.
    pub async fn emit_with_ack(&self, event: &str, payload: Json) -> Result<Json, ApiError> {
        self.ensure_open()?;

        let ack_id = self.next_ack.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(ack_id, tx);

        let frame = format!(
            "42{ack_id}{}",
            serde_json::to_string(&json!([event, payload])).map_err(ApiError::internal)?
        );
        log::trace!("emit {event} (ack {ack_id})");

        let sent = self
            .sink
            .lock()
            .await
            .send(Message::Text(frame))
            .await;
        if let Err(err) = sent {
            self.pending.lock().unwrap().remove(&ack_id);
            return Err(ApiError::upstream_unreachable(err));
        }

        match timeout(self.ack_timeout, rx).await {
            Ok(Ok(ack)) => unwrap_ack(ack),
            Ok(Err(_)) => Err(ApiError::new(
                ErrorCode::SessionExpired,
                format!("channel closed while waiting for {event}"),
            )),
            Err(_) => {
                self.pending.lock().unwrap().remove(&ack_id);
                Err(ApiError::timeout(event))
            }
        }
    }
}

/// Acks carry either a `data` field or a structured `error` field.
fn unwrap_ack(ack: Json) -> Result<Json, ApiError> {
    if let Some(error) = ack.get("error") {
        let name = error
            .get("name")
            .or_else(|| error.get("code"))
            .and_then(Json::as_str)
            .unwrap_or("");
        let message = error
            .get("message")
            .and_then(Json::as_str)
            .unwrap_or("upstream rejected the event")
            .to_owned();
        return Err(ApiError::new(ErrorCode::from_upstream_name(name), message));
    }
    Ok(ack.get("data").cloned().unwrap_or(ack))
}

async fn wait_for_prefix(stream: &mut WsStream, prefix: char) -> Result<String, ApiError> {
    loop {
        let message = timeout(HANDSHAKE_TIMEOUT, stream.next())
            .await
            .map_err(|_| handshake_error("timed out during handshake"))?
            .ok_or_else(|| handshake_error("socket closed during handshake"))?
            .map_err(handshake_error)?;

        match message {
            Message::Text(text) => {
                if text.starts_with(prefix) {
                    return Ok(text);
                }
                if text == "2" {
                    stream
                        .send(Message::Text("3".to_owned()))
                        .await
                        .map_err(handshake_error)?;
                }
            }
            Message::Close(_) => {
                return Err(handshake_error("socket closed during handshake"));
            }
            _ => {}
        }
    }
}

async fn read_loop(
    mut source: WsSource,
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    pending: Pending,
    subscriptions: Subscriptions,
    closed: Arc<AtomicBool>,
) {
    while let Some(message) = source.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                log::debug!("realtime channel read error: {err}");
                break;
            }
        };

        if text == "2" {
            let _ = sink.lock().await.send(Message::Text("3".to_owned())).await;
            continue;
        }
        if text == "41" {
            break;
        }

        if let Some(rest) = text.strip_prefix("43") {
            handle_ack(rest, &pending);
        } else if let Some(rest) = text.strip_prefix("42") {
            handle_event(rest, &subscriptions);
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Wake every in-flight emit; their acks will never arrive.
    pending.lock().unwrap().clear();
    subscriptions.lock().unwrap().clear();
    log::debug!("realtime channel closed");
}

fn split_ack_id(rest: &str) -> (Option<u64>, &str) {
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return (None, rest);
    }
    (digits.parse().ok(), &rest[digits.len()..])
}

fn handle_ack(rest: &str, pending: &Pending) {
    let (ack_id, payload) = split_ack_id(rest);
    let Some(ack_id) = ack_id else {
        return;
    };
    let value = serde_json::from_str::<Json>(payload)
        .ok()
        .and_then(|array| array.get(0).cloned())
        .unwrap_or(Json::Null);

    if let Some(tx) = pending.lock().unwrap().remove(&ack_id) {
        let _ = tx.send(value);
    }
}

fn handle_event(rest: &str, subscriptions: &Subscriptions) {
    // Server-initiated acks carry an id between the prefix and the array.
    let (_, payload) = split_ack_id(rest);
    let Ok(Json::Array(parts)) = serde_json::from_str::<Json>(payload) else {
        return;
    };
    let Some(event) = parts.first().and_then(Json::as_str) else {
        return;
    };

    match event {
        "space:broadcast-doc-update" => {
            let Some(body) = parts.get(1) else {
                return;
            };
            let Some(doc_id) = body.get("docId").and_then(Json::as_str) else {
                return;
            };
            let Some(update) = body
                .get("update")
                .and_then(Json::as_str)
                .and_then(|b64| BASE64.decode(b64).ok())
            else {
                return;
            };

            let mut subscriptions = subscriptions.lock().unwrap();
            if let Some(senders) = subscriptions.get_mut(doc_id) {
                senders.retain(|sender| sender.send(update.clone()).is_ok());
            }
        }
        // Cursor traffic; this engine does not track awareness.
        "space:update-awareness" => {}
        other => log::trace!("ignoring upstream event {other}"),
    }
}

#[async_trait]
impl SpaceChannel for SocketChannel {
    async fn join(&self, workspace_id: &str) -> Result<(), ApiError> {
        self.emit_with_ack(
            "space:join",
            json!({
                "spaceType": SPACE_TYPE,
                "spaceId": workspace_id,
                "clientVersion": env!("CARGO_PKG_VERSION"),
            }),
        )
        .await
        .map_err(|err| match err.code {
            ErrorCode::AccessDenied => {
                ApiError::new(ErrorCode::PermissionDenied, err.message)
            }
            _ => err,
        })?;
        Ok(())
    }

    async fn leave(&self, workspace_id: &str) -> Result<(), ApiError> {
        self.emit_with_ack(
            "space:leave",
            json!({ "spaceType": SPACE_TYPE, "spaceId": workspace_id }),
        )
        .await?;
        Ok(())
    }

    async fn load_doc(&self, workspace_id: &str, doc_id: &str) -> Result<LoadedDoc, ApiError> {
        let data = self
            .emit_with_ack(
                "space:load-doc",
                json!({
                    "spaceType": SPACE_TYPE,
                    "spaceId": workspace_id,
                    "docId": doc_id,
                }),
            )
            .await?;

        let missing = data
            .get("missing")
            .and_then(Json::as_str)
            .and_then(|b64| BASE64.decode(b64).ok())
            .ok_or_else(|| {
                ApiError::new(
                    ErrorCode::UpstreamError,
                    format!("load-doc ack for {doc_id} carried no update"),
                )
            })?;
        let state_vector = data
            .get("state")
            .and_then(Json::as_str)
            .and_then(|b64| BASE64.decode(b64).ok());
        let timestamp = data
            .get("timestamp")
            .and_then(Json::as_f64)
            .map(|ts| ts as i64);

        Ok(LoadedDoc {
            missing,
            state_vector,
            timestamp,
        })
    }

    async fn push_update(
        &self,
        workspace_id: &str,
        doc_id: &str,
        update: &[u8],
    ) -> Result<i64, ApiError> {
        let data = self
            .emit_with_ack(
                "space:push-doc-update",
                json!({
                    "spaceType": SPACE_TYPE,
                    "spaceId": workspace_id,
                    "docId": doc_id,
                    "update": BASE64.encode(update),
                }),
            )
            .await?;

        Ok(data
            .get("timestamp")
            .and_then(Json::as_f64)
            .map(|ts| ts as i64)
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()))
    }

    async fn subscribe(
        &self,
        _workspace_id: &str,
        doc_id: &str,
    ) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions
            .lock()
            .unwrap()
            .entry(doc_id.to_owned())
            .or_default()
            .push(tx);
        rx
    }

    async fn unsubscribe(&self, _workspace_id: &str, doc_id: &str) {
        self.subscriptions.lock().unwrap().remove(doc_id);
    }

    async fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Text("41".to_owned())).await;
        let _ = sink.send(Message::Close(None)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_frames_split_into_id_and_payload() {
        let (id, rest) = split_ack_id("17[{\"data\":{}}]");
        assert_eq!(id, Some(17));
        assert_eq!(rest, "[{\"data\":{}}]");

        let (id, rest) = split_ack_id("[\"event\",{}]");
        assert_eq!(id, None);
        assert_eq!(rest, "[\"event\",{}]");
    }

    #[test]
    fn acks_unwrap_data_or_map_errors() {
        let ok = unwrap_ack(serde_json::json!({ "data": { "accepted": true } })).unwrap();
        assert_eq!(ok["accepted"], true);

        let err = unwrap_ack(serde_json::json!({
            "error": { "name": "DOC_NOT_FOUND", "message": "no such doc" }
        }))
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::DocNotFound);
        assert_eq!(err.message, "no such doc");
    }

    #[test]
    fn broadcast_events_reach_subscribers() {
        let subscriptions: Subscriptions = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriptions
            .lock()
            .unwrap()
            .insert("D1".to_owned(), vec![tx]);

        let update = BASE64.encode([1u8, 2, 3]);
        let frame = format!(
            "[\"space:broadcast-doc-update\",{{\"docId\":\"D1\",\"update\":\"{update}\"}}]"
        );
        handle_event(&frame, &subscriptions);

        assert_eq!(rx.try_recv().unwrap(), vec![1, 2, 3]);
    }
}
