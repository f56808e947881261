//! Shared test support: an in-memory upstream implementing the same
//! channel/blob/connector traits as the real clients, so composer, query
//! and fabric behavior can be exercised without a network.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use affine_bridge::crdt::Replica;
use affine_bridge::error::{ApiError, ErrorCode};
use affine_bridge::session::{Connector, Session};
use affine_bridge::upstream::http::UpstreamHttp;
use affine_bridge::upstream::{BlobStore, LoadedDoc, SpaceChannel};
use tokio::sync::mpsc;
use yrs::Map;

/// In-memory upstream: documents are full-state updates keyed by
/// `(workspace, doc)`; pushes merge and rebroadcast to subscribers.
#[derive(Default)]
pub struct FakeUpstream {
    docs: Mutex<HashMap<(String, String), Vec<u8>>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
    join_counts: Mutex<HashMap<String, usize>>,
    push_counts: Mutex<HashMap<String, usize>>,
    /// One-shot failure injection: the next push to this doc id fails.
    fail_next_push: Mutex<Option<(String, ErrorCode)>>,
}

impl FakeUpstream {
    pub fn new() -> Arc<FakeUpstream> {
        Arc::new(FakeUpstream::default())
    }

    /// Seeds a document from a replica's current state.
    pub fn seed(&self, workspace_id: &str, doc_id: &str, replica: &Replica) {
        let update = replica.encode_update_since(None).unwrap();
        self.docs
            .lock()
            .unwrap()
            .insert((workspace_id.to_owned(), doc_id.to_owned()), update);
    }

    /// Seeds an empty workspace root so the index document exists.
    pub fn seed_workspace(&self, workspace_id: &str) {
        let replica = Replica::new();
        {
            let meta = replica.map("meta");
            let mut txn = replica.transact_mut();
            meta.insert(&mut txn, "name", format!("Workspace {workspace_id}").as_str());
        }
        self.seed(workspace_id, workspace_id, &replica);
    }

    pub fn join_count(&self, workspace_id: &str) -> usize {
        *self
            .join_counts
            .lock()
            .unwrap()
            .get(workspace_id)
            .unwrap_or(&0)
    }

    pub fn push_count(&self, doc_id: &str) -> usize {
        *self.push_counts.lock().unwrap().get(doc_id).unwrap_or(&0)
    }

    pub fn fail_next_push(&self, doc_id: &str, code: ErrorCode) {
        *self.fail_next_push.lock().unwrap() = Some((doc_id.to_owned(), code));
    }

    pub fn contains_doc(&self, workspace_id: &str, doc_id: &str) -> bool {
        self.docs
            .lock()
            .unwrap()
            .contains_key(&(workspace_id.to_owned(), doc_id.to_owned()))
    }

    /// The document's current state as a replica, the way the snapshot
    /// endpoint would hand it out.
    pub fn replica(&self, workspace_id: &str, doc_id: &str) -> Option<Replica> {
        let docs = self.docs.lock().unwrap();
        let update = docs.get(&(workspace_id.to_owned(), doc_id.to_owned()))?;
        Some(Replica::from_update(update).unwrap())
    }

    /// Simulates another writer pushing an update from elsewhere: merges
    /// and broadcasts without going through a local channel.
    pub fn remote_push(&self, workspace_id: &str, doc_id: &str, update: &[u8]) {
        self.merge(workspace_id, doc_id, update);
        self.broadcast(doc_id, update);
    }

    fn merge(&self, workspace_id: &str, doc_id: &str, update: &[u8]) {
        let key = (workspace_id.to_owned(), doc_id.to_owned());
        let mut docs = self.docs.lock().unwrap();
        let merged = match docs.get(&key) {
            Some(existing) => {
                let replica = Replica::from_update(existing).unwrap();
                replica.apply_update(update).unwrap();
                replica.encode_update_since(None).unwrap()
            }
            None => {
                let replica = Replica::new();
                replica.apply_update(update).unwrap();
                replica.encode_update_since(None).unwrap()
            }
        };
        docs.insert(key, merged);
    }

    fn broadcast(&self, doc_id: &str, update: &[u8]) {
        let mut subscribers = self.subscribers.lock().unwrap();
        if let Some(senders) = subscribers.get_mut(doc_id) {
            senders.retain(|sender| sender.send(update.to_vec()).is_ok());
        }
    }
}

#[async_trait]
impl SpaceChannel for FakeUpstream {
    async fn join(&self, workspace_id: &str) -> Result<(), ApiError> {
        *self
            .join_counts
            .lock()
            .unwrap()
            .entry(workspace_id.to_owned())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn leave(&self, _workspace_id: &str) -> Result<(), ApiError> {
        Ok(())
    }

    async fn load_doc(&self, workspace_id: &str, doc_id: &str) -> Result<LoadedDoc, ApiError> {
        let docs = self.docs.lock().unwrap();
        let update = docs
            .get(&(workspace_id.to_owned(), doc_id.to_owned()))
            .ok_or_else(|| ApiError::not_found(ErrorCode::DocNotFound, "document", doc_id))?;
        let replica = Replica::from_update(update).unwrap();
        Ok(LoadedDoc {
            missing: update.clone(),
            state_vector: Some(replica.state_vector()),
            timestamp: Some(1_700_000_000_000),
        })
    }

    async fn push_update(
        &self,
        workspace_id: &str,
        doc_id: &str,
        update: &[u8],
    ) -> Result<i64, ApiError> {
        let injected = {
            let mut fail = self.fail_next_push.lock().unwrap();
            match fail.take() {
                Some((target, code)) if target == doc_id => Some(code),
                other => {
                    *fail = other;
                    None
                }
            }
        };
        if let Some(code) = injected {
            return Err(ApiError::new(code, format!("injected failure for {doc_id}")));
        }

        self.merge(workspace_id, doc_id, update);
        *self
            .push_counts
            .lock()
            .unwrap()
            .entry(doc_id.to_owned())
            .or_insert(0) += 1;
        self.broadcast(doc_id, update);
        Ok(1_700_000_000_001)
    }

    async fn subscribe(
        &self,
        _workspace_id: &str,
        doc_id: &str,
    ) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap()
            .entry(doc_id.to_owned())
            .or_default()
            .push(tx);
        rx
    }

    async fn unsubscribe(&self, _workspace_id: &str, doc_id: &str) {
        self.subscribers.lock().unwrap().remove(doc_id);
    }

    async fn disconnect(&self) {}
}

/// In-memory blob store handing out sequential ids.
#[derive(Default)]
pub struct FakeBlobs {
    counter: AtomicUsize,
    pub stored: Mutex<Vec<(String, Vec<u8>, String)>>,
}

#[async_trait]
impl BlobStore for FakeBlobs {
    async fn put_blob(
        &self,
        workspace_id: &str,
        data: Vec<u8>,
        mime: &str,
    ) -> Result<String, ApiError> {
        let id = format!("blob-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        self.stored
            .lock()
            .unwrap()
            .push((workspace_id.to_owned(), data, mime.to_owned()));
        Ok(id)
    }
}

/// Hands out sessions bound to a shared fake upstream.
pub struct FakeConnector {
    pub upstream: Arc<FakeUpstream>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self) -> Result<Arc<Session>, ApiError> {
        Ok(session_over(Arc::clone(&self.upstream)))
    }
}

pub fn session_over(upstream: Arc<FakeUpstream>) -> Arc<Session> {
    Session::new(
        "user-1",
        Arc::new(UpstreamHttp::unauthenticated("http://fake.invalid")),
        upstream as Arc<dyn SpaceChannel>,
    )
}
