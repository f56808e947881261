//! The authenticated bond with the upstream: cookie-carrying HTTP client
//! plus the realtime channel, with the join/leave bookkeeping that makes
//! `join_workspace` idempotent per session.
//!
//! HTTP requests each get their own short-lived session (sign-in per
//! request, cheap next to the upstream round-trips it fronts); a live
//! canvas connection keeps one session for its whole lifetime. Sessions are
//! never shared across concurrent HTTP requests.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::UpstreamConfig;
use crate::error::ApiError;
use crate::upstream::http::UpstreamHttp;
use crate::upstream::socket::SocketChannel;
use crate::upstream::SpaceChannel;

pub struct Session {
    user_id: String,
    http: Arc<UpstreamHttp>,
    channel: Arc<dyn SpaceChannel>,
    joined: tokio::sync::Mutex<HashSet<String>>,
}

impl Session {
    pub fn new(
        user_id: impl Into<String>,
        http: Arc<UpstreamHttp>,
        channel: Arc<dyn SpaceChannel>,
    ) -> Arc<Session> {
        Arc::new(Session {
            user_id: user_id.into(),
            http,
            channel,
            joined: tokio::sync::Mutex::new(HashSet::new()),
        })
    }

    /// Signs in and connects the realtime channel.
    pub async fn establish(config: &UpstreamConfig) -> Result<Arc<Session>, ApiError> {
        let http = Arc::new(
            UpstreamHttp::sign_in(&config.base_url, &config.email, &config.password).await?,
        );
        let channel =
            SocketChannel::connect(&http.socket_url(), http.cookie_header()).await?;
        Ok(Session::new(
            http.user_id().to_owned(),
            http,
            channel as Arc<dyn SpaceChannel>,
        ))
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn http(&self) -> &Arc<UpstreamHttp> {
        &self.http
    }

    pub fn channel(&self) -> &Arc<dyn SpaceChannel> {
        &self.channel
    }

    /// Joins a workspace at most once per session. The joined-set lock is
    /// held across the emit so concurrent callers cannot double-join.
    pub async fn join_workspace(&self, workspace_id: &str) -> Result<(), ApiError> {
        let mut joined = self.joined.lock().await;
        if joined.contains(workspace_id) {
            return Ok(());
        }
        self.channel.join(workspace_id).await?;
        joined.insert(workspace_id.to_owned());
        Ok(())
    }

    pub async fn leave_workspace(&self, workspace_id: &str) -> Result<(), ApiError> {
        let mut joined = self.joined.lock().await;
        joined.remove(workspace_id);
        self.channel.leave(workspace_id).await
    }

    /// Leaves joined workspaces best-effort, then closes the channel. The
    /// close happens even when a leave fails.
    pub async fn disconnect(&self) {
        let joined: Vec<String> = {
            let mut guard = self.joined.lock().await;
            guard.drain().collect()
        };
        for workspace_id in joined {
            if let Err(err) = self.channel.leave(&workspace_id).await {
                log::debug!("leave {workspace_id} before disconnect failed: {err}");
            }
        }
        self.channel.disconnect().await;
    }
}

/// Opens sessions on demand. Injected so the web layer, broadcast fabric
/// and tests can each decide how sessions come to exist.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<Arc<Session>, ApiError>;
}

/// The production connector: a fresh sign-in per opened session.
pub struct UpstreamConnector {
    config: UpstreamConfig,
}

impl UpstreamConnector {
    pub fn new(config: UpstreamConfig) -> UpstreamConnector {
        UpstreamConnector { config }
    }
}

#[async_trait]
impl Connector for UpstreamConnector {
    async fn open(&self) -> Result<Arc<Session>, ApiError> {
        Session::establish(&self.config).await
    }
}
