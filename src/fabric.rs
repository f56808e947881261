//! The broadcast fabric: joins per-client canvas sessions into shared
//! upstream document sessions.
//!
//! One entry per `(workspace, document)` key holds the shared replica, the
//! upstream subscription and the connected client set. Client mutations and
//! upstream-update application run under the same per-document lock, so
//! every replica sees a single linearisation order. The registry is
//! dependency-injected (no process-wide singleton) so tests spin up an
//! independent fabric per case.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use serde_json::Value as Json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::canvas::ServerMessage;
use crate::crdt::Replica;
use crate::doc::blocks::BlockTree;
use crate::doc::elements::{ElementInput, SurfaceElements};
use crate::error::ApiError;
use crate::session::{Connector, Session};

type DocKey = (String, String);

pub struct Fabric {
    connector: Arc<dyn Connector>,
    docs: tokio::sync::Mutex<HashMap<DocKey, Arc<SharedDoc>>>,
    /// Reverse map for O(1) cleanup when a client socket dies.
    memberships: StdMutex<HashMap<String, DocKey>>,
}

struct DocState {
    replica: Replica,
    clients: HashMap<String, mpsc::UnboundedSender<ServerMessage>>,
}

/// One shared upstream document session.
pub struct SharedDoc {
    workspace_id: String,
    doc_id: String,
    session: Arc<Session>,
    state: tokio::sync::Mutex<DocState>,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

impl Fabric {
    pub fn new(connector: Arc<dyn Connector>) -> Arc<Fabric> {
        Arc::new(Fabric {
            connector,
            docs: tokio::sync::Mutex::new(HashMap::new()),
            memberships: StdMutex::new(HashMap::new()),
        })
    }

    /// Attaches a client to a document's shared session, creating the
    /// session on first join. Returns the shared handle and the element
    /// snapshot for the client's `init` message.
    pub async fn join(
        &self,
        client_id: &str,
        sender: mpsc::UnboundedSender<ServerMessage>,
        workspace_id: &str,
        doc_id: &str,
    ) -> Result<(Arc<SharedDoc>, Vec<Json>), ApiError> {
        let key = (workspace_id.to_owned(), doc_id.to_owned());
        let mut docs = self.docs.lock().await;

        let shared = match docs.get(&key) {
            Some(shared) => Arc::clone(shared),
            None => {
                let shared = self.open_shared(workspace_id, doc_id).await?;
                docs.insert(key.clone(), Arc::clone(&shared));
                shared
            }
        };

        let elements = {
            let mut state = shared.state.lock().await;
            state
                .clients
                .insert(client_id.to_owned(), sender);
            element_snapshot(&state.replica)
                .into_values()
                .collect::<Vec<Json>>()
        };

        self.memberships
            .lock()
            .unwrap()
            .insert(client_id.to_owned(), key);

        log::debug!("canvas client {client_id} joined {workspace_id}/{doc_id}");
        Ok((shared, sorted_by_index(elements)))
    }

    async fn open_shared(
        &self,
        workspace_id: &str,
        doc_id: &str,
    ) -> Result<Arc<SharedDoc>, ApiError> {
        let session = self.connector.open().await?;
        session.join_workspace(workspace_id).await?;

        let loaded = session.channel().load_doc(workspace_id, doc_id).await?;
        let replica = Replica::from_update(&loaded.missing)?;
        let updates = session.channel().subscribe(workspace_id, doc_id).await;

        let shared = Arc::new(SharedDoc {
            workspace_id: workspace_id.to_owned(),
            doc_id: doc_id.to_owned(),
            session,
            state: tokio::sync::Mutex::new(DocState {
                replica,
                clients: HashMap::new(),
            }),
            pump: StdMutex::new(None),
        });

        let pump = tokio::spawn(pump_updates(Arc::downgrade(&shared), updates));
        *shared.pump.lock().unwrap() = Some(pump);

        log::debug!("opened shared session for {workspace_id}/{doc_id}");
        Ok(shared)
    }

    /// Detaches a client; tears the shared session down when it was the
    /// last one on its document.
    pub async fn leave(&self, client_id: &str) {
        let key = match self.memberships.lock().unwrap().remove(client_id) {
            Some(key) => key,
            None => return,
        };

        let mut docs = self.docs.lock().await;
        let Some(shared) = docs.get(&key).cloned() else {
            return;
        };

        let now_empty = {
            let mut state = shared.state.lock().await;
            state.clients.remove(client_id);
            state.clients.is_empty()
        };

        if now_empty {
            docs.remove(&key);
            drop(docs);
            shared.teardown().await;
            log::debug!("tore down shared session for {}/{}", key.0, key.1);
        }
    }

    /// Number of live shared sessions; used by tests and diagnostics.
    pub async fn shared_session_count(&self) -> usize {
        self.docs.lock().await.len()
    }
}

impl SharedDoc {
    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    async fn push(&self, state: &DocState, base: &[u8]) -> Result<(), ApiError> {
        let update = state.replica.encode_update_since(Some(base))?;
        self.session
            .channel()
            .push_update(&self.workspace_id, &self.doc_id, &update)
            .await?;
        Ok(())
    }

    /// Creates an element on behalf of `origin`: mutate the shared replica,
    /// push upstream, fan the `add` out to every other client.
    pub async fn create_element(
        &self,
        origin: &str,
        input: ElementInput,
    ) -> Result<Json, ApiError> {
        let state = self.state.lock().await;
        let base = state.replica.state_vector();

        let view = {
            let tree = BlockTree::new(&state.replica);
            let mut txn = state.replica.transact_mut();
            let elements = SurfaceElements::open_or_create(&mut txn, &tree)?;
            let (_, view) = elements.create(&mut txn, input)?;
            view
        };

        self.push(&state, &base).await?;
        broadcast_except(
            &state.clients,
            origin,
            ServerMessage::Add {
                element: view.clone(),
            },
        );
        Ok(view)
    }

    pub async fn update_element(
        &self,
        origin: &str,
        element_id: &str,
        changes: &serde_json::Map<String, Json>,
    ) -> Result<Json, ApiError> {
        let state = self.state.lock().await;
        let base = state.replica.state_vector();

        let view = {
            let tree = BlockTree::new(&state.replica);
            let mut txn = state.replica.transact_mut();
            let elements = SurfaceElements::open_or_create(&mut txn, &tree)?;
            elements.update(&mut txn, element_id, changes)?
        };

        self.push(&state, &base).await?;
        broadcast_except(
            &state.clients,
            origin,
            ServerMessage::Update {
                element_id: element_id.to_owned(),
                changes: Json::Object(changes.clone()),
            },
        );
        Ok(view)
    }

    pub async fn delete_element(&self, origin: &str, element_id: &str) -> Result<(), ApiError> {
        let state = self.state.lock().await;
        let base = state.replica.state_vector();

        {
            let tree = BlockTree::new(&state.replica);
            let mut txn = state.replica.transact_mut();
            let elements = SurfaceElements::open_or_create(&mut txn, &tree)?;
            elements.delete(&mut txn, element_id)?;
        }

        self.push(&state, &base).await?;
        broadcast_except(
            &state.clients,
            origin,
            ServerMessage::Remove {
                element_id: element_id.to_owned(),
            },
        );
        Ok(())
    }

    /// Applies an upstream update under the same lock as client mutations,
    /// then fans out the high-level difference.
    async fn apply_remote(&self, update: Vec<u8>) {
        let state = self.state.lock().await;
        let before = element_snapshot(&state.replica);
        if let Err(err) = state.replica.apply_update(&update) {
            log::warn!(
                "dropping bad upstream update for {}/{}: {err}",
                self.workspace_id,
                self.doc_id
            );
            return;
        }
        let after = element_snapshot(&state.replica);

        for event in diff_snapshots(&before, &after) {
            for sender in state.clients.values() {
                let _ = sender.send(event.clone());
            }
        }
    }

    async fn teardown(&self) {
        if let Some(pump) = self.pump.lock().unwrap().take() {
            pump.abort();
        }
        self.session
            .channel()
            .unsubscribe(&self.workspace_id, &self.doc_id)
            .await;
        self.session.disconnect().await;
    }
}

async fn pump_updates(shared: Weak<SharedDoc>, mut updates: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(update) = updates.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        shared.apply_remote(update).await;
    }
}

fn broadcast_except(
    clients: &HashMap<String, mpsc::UnboundedSender<ServerMessage>>,
    origin: &str,
    message: ServerMessage,
) {
    for (client_id, sender) in clients {
        if client_id == origin {
            continue;
        }
        let _ = sender.send(message.clone());
    }
}

/// Elements of the shared replica as id → view, for diffing around an
/// upstream update.
fn element_snapshot(replica: &Replica) -> HashMap<String, Json> {
    let tree = BlockTree::new(replica);
    let txn = replica.transact();
    let Ok(elements) = SurfaceElements::open(&txn, &tree) else {
        return HashMap::new();
    };
    elements
        .list(&txn)
        .into_iter()
        .filter_map(|view| {
            let id = view.get("id")?.as_str()?.to_owned();
            Some((id, view))
        })
        .collect()
}

fn sorted_by_index(mut elements: Vec<Json>) -> Vec<Json> {
    elements.sort_by(|a, b| {
        let ka = a.get("index").and_then(Json::as_str).unwrap_or("");
        let kb = b.get("index").and_then(Json::as_str).unwrap_or("");
        ka.cmp(kb)
    });
    elements
}

/// High-level add/update/remove events between two element snapshots.
fn diff_snapshots(
    before: &HashMap<String, Json>,
    after: &HashMap<String, Json>,
) -> Vec<ServerMessage> {
    let mut events = Vec::new();

    for (id, view) in after {
        match before.get(id) {
            None => events.push(ServerMessage::Add {
                element: view.clone(),
            }),
            Some(previous) if previous != view => {
                let changes = changed_keys(previous, view);
                events.push(ServerMessage::Update {
                    element_id: id.clone(),
                    changes,
                });
            }
            Some(_) => {}
        }
    }

    for id in before.keys() {
        if !after.contains_key(id) {
            events.push(ServerMessage::Remove {
                element_id: id.clone(),
            });
        }
    }

    events
}

/// The keys that differ between two element views; removed keys map to
/// `null`.
fn changed_keys(previous: &Json, current: &Json) -> Json {
    let mut changes = serde_json::Map::new();
    let empty = serde_json::Map::new();
    let previous = previous.as_object().unwrap_or(&empty);
    let current_map = current.as_object().cloned().unwrap_or_default();

    for (key, value) in &current_map {
        if previous.get(key) != Some(value) {
            changes.insert(key.clone(), value.clone());
        }
    }
    for key in previous.keys() {
        if !current_map.contains_key(key) {
            changes.insert(key.clone(), Json::Null);
        }
    }
    Json::Object(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn diff_reports_adds_updates_and_removes() {
        let before: HashMap<String, Json> = [
            ("a".to_owned(), json!({"id": "a", "fillColor": "#fff"})),
            ("b".to_owned(), json!({"id": "b"})),
        ]
        .into_iter()
        .collect();
        let after: HashMap<String, Json> = [
            ("a".to_owned(), json!({"id": "a", "fillColor": "#000"})),
            ("c".to_owned(), json!({"id": "c"})),
        ]
        .into_iter()
        .collect();

        let events = diff_snapshots(&before, &after);
        assert_eq!(events.len(), 3);

        let mut adds = 0;
        let mut updates = 0;
        let mut removes = 0;
        for event in events {
            match event {
                ServerMessage::Add { element } => {
                    adds += 1;
                    assert_eq!(element["id"], json!("c"));
                }
                ServerMessage::Update {
                    element_id,
                    changes,
                } => {
                    updates += 1;
                    assert_eq!(element_id, "a");
                    assert_eq!(changes, json!({"fillColor": "#000"}));
                }
                ServerMessage::Remove { element_id } => {
                    removes += 1;
                    assert_eq!(element_id, "b");
                }
                _ => panic!("unexpected event"),
            }
        }
        assert_eq!((adds, updates, removes), (1, 1, 1));
    }
}
