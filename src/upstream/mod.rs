//! Clients for the upstream collaboration backend: the HTTP/GraphQL control
//! plane and the socket.io realtime channel.
//!
//! The rest of the engine only sees the [`SpaceChannel`] and [`BlobStore`]
//! traits, so the transaction composer, query layer and broadcast fabric
//! are transport-agnostic and tests can inject in-memory fakes.

pub mod graphql;
pub mod http;
pub mod socket;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ApiError;

/// A document as handed over by `space:load-doc`: a full update to apply to
/// a fresh replica, plus the upstream's state vector at that moment.
#[derive(Debug, Clone)]
pub struct LoadedDoc {
    pub missing: Vec<u8>,
    pub state_vector: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
}

/// The realtime document channel of one authenticated session.
#[async_trait]
pub trait SpaceChannel: Send + Sync {
    async fn join(&self, workspace_id: &str) -> Result<(), ApiError>;

    /// Best-effort; failure to leave must not prevent disconnecting.
    async fn leave(&self, workspace_id: &str) -> Result<(), ApiError>;

    async fn load_doc(&self, workspace_id: &str, doc_id: &str) -> Result<LoadedDoc, ApiError>;

    /// Pushes an encoded update and returns the upstream timestamp from the
    /// acknowledgement.
    async fn push_update(
        &self,
        workspace_id: &str,
        doc_id: &str,
        update: &[u8],
    ) -> Result<i64, ApiError>;

    /// Registers for `space:broadcast-doc-update` deliveries of a document.
    async fn subscribe(
        &self,
        workspace_id: &str,
        doc_id: &str,
    ) -> mpsc::UnboundedReceiver<Vec<u8>>;

    async fn unsubscribe(&self, workspace_id: &str, doc_id: &str);

    /// Closes the channel. Must succeed locally even when the peer is gone.
    async fn disconnect(&self);
}

/// Content-addressed binary storage for image and attachment blocks.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put_blob(
        &self,
        workspace_id: &str,
        data: Vec<u8>,
        mime: &str,
    ) -> Result<String, ApiError>;
}
