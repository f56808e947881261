//! Wire types of the caller-facing REST surface. Everything here is plain
//! JSON with camelCase field names; validation that needs no upstream
//! traffic happens at deserialization time.

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as Json};

use crate::error::ApiError;

pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfoResponse {
    pub name: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSummary {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_count: Option<u64>,
    pub doc_count: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFolderRequest {
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<String>,
}

impl CreateFolderRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.name.trim().is_empty() {
            return Err(ApiError::invalid("folder name must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddBlockRequest {
    pub flavour: String,
    #[serde(default)]
    pub props: JsonMap<String, Json>,
    #[serde(default)]
    pub parent_block_id: Option<String>,
    #[serde(default)]
    pub position: Option<Json>,
}

impl AddBlockRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.flavour.trim().is_empty() {
            return Err(ApiError::invalid("flavour must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageUploadRequest {
    /// Base64-encoded image bytes.
    pub data: String,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub parent_block_id: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub width: Option<f64>,
    #[serde(default)]
    pub height: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    #[serde(default)]
    pub mode: Option<String>,
}

impl PublishRequest {
    pub fn mode(&self) -> Result<&str, ApiError> {
        match self.mode.as_deref() {
            None => Ok("page"),
            Some(mode @ ("page" | "edgeless")) => Ok(mode),
            Some(other) => Err(ApiError::invalid(format!(
                "mode must be \"page\" or \"edgeless\", got {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CommentRequest {
    pub content: Json,
}

#[derive(Debug, Deserialize)]
pub struct ResolveCommentRequest {
    #[serde(default = "default_true")]
    pub resolved: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTokenRequest {
    pub name: String,
    #[serde(default)]
    pub expires_at: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedResponse {
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokedResponse {
    pub revoked: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatedResponse {
    pub timestamp: i64,
}
