//! Typed GraphQL operations against the upstream control plane. Each
//! operation is a thin wrapper over [`UpstreamHttp::graphql`] with a typed
//! result; the interesting error mapping happens in the shared plumbing.

use async_trait::async_trait;
use serde_json::{json, Value as Json};

use crate::error::{ApiError, ErrorCode};
use crate::upstream::http::UpstreamHttp;
use crate::upstream::BlobStore;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct WorkspaceRef {
    pub id: String,
    #[serde(default, rename = "memberCount")]
    pub member_count: Option<u64>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicationRecord {
    pub doc_id: String,
    pub mode: String,
    pub public: bool,
    pub url: String,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenRecord {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    /// Only present right after generation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl UpstreamHttp {
    /// Workspace ids known to the control plane. Names are not exposed
    /// here; the query layer reads them from each workspace's root document.
    pub async fn workspaces(&self) -> Result<Vec<WorkspaceRef>, ApiError> {
        let data = self
            .graphql(
                "query workspaces { workspaces { id memberCount } }",
                json!({}),
            )
            .await?;
        let list = data.get("workspaces").cloned().unwrap_or(Json::Null);
        serde_json::from_value(list)
            .map_err(|err| ApiError::new(ErrorCode::UpstreamError, format!("bad workspaces payload: {err}")))
    }

    /// Makes a document publicly shareable in the given mode and returns
    /// the public URL.
    pub async fn publish_doc(
        &self,
        workspace_id: &str,
        doc_id: &str,
        mode: &str,
    ) -> Result<PublicationRecord, ApiError> {
        let mode = match mode {
            "page" => "Page",
            "edgeless" => "Edgeless",
            other => {
                return Err(ApiError::invalid(format!(
                    "publish mode must be \"page\" or \"edgeless\", got {other:?}"
                )))
            }
        };

        self.graphql(
            "mutation publishDoc($workspaceId: String!, $docId: String!, $mode: PublicDocMode) {\n\
               publishDoc(workspaceId: $workspaceId, docId: $docId, mode: $mode) { id mode public }\n\
             }",
            json!({ "workspaceId": workspace_id, "docId": doc_id, "mode": mode }),
        )
        .await?;

        Ok(PublicationRecord {
            doc_id: doc_id.to_owned(),
            mode: mode.to_lowercase(),
            public: true,
            url: format!("{}/share/{workspace_id}/{doc_id}", self.base_url()),
        })
    }

    /// Revokes public sharing; the document stays listable privately.
    pub async fn revoke_public_doc(
        &self,
        workspace_id: &str,
        doc_id: &str,
    ) -> Result<(), ApiError> {
        self.graphql(
            "mutation revokePublicDoc($workspaceId: String!, $docId: String!) {\n\
               revokePublicDoc(workspaceId: $workspaceId, docId: $docId) { id public }\n\
             }",
            json!({ "workspaceId": workspace_id, "docId": doc_id }),
        )
        .await?;
        Ok(())
    }

    pub async fn list_comments(
        &self,
        workspace_id: &str,
        doc_id: &str,
    ) -> Result<Json, ApiError> {
        let data = self
            .graphql(
                "query listComments($workspaceId: String!, $docId: String!) {\n\
                   listComments(workspaceId: $workspaceId, docId: $docId) {\n\
                     edges { node { id content resolved createdAt updatedAt user { id name } } }\n\
                   }\n\
                 }",
                json!({ "workspaceId": workspace_id, "docId": doc_id }),
            )
            .await?;

        let comments: Vec<Json> = data
            .pointer("/listComments/edges")
            .and_then(Json::as_array)
            .map(|edges| {
                edges
                    .iter()
                    .filter_map(|edge| edge.get("node").cloned())
                    .collect()
            })
            .unwrap_or_default();
        Ok(Json::Array(comments))
    }

    pub async fn create_comment(
        &self,
        workspace_id: &str,
        doc_id: &str,
        content: Json,
    ) -> Result<Json, ApiError> {
        let data = self
            .graphql(
                "mutation createComment($input: CommentCreateInput!) {\n\
                   createComment(input: $input) { id content resolved createdAt }\n\
                 }",
                json!({ "input": {
                    "workspaceId": workspace_id,
                    "docId": doc_id,
                    "content": content,
                }}),
            )
            .await?;
        Ok(data.get("createComment").cloned().unwrap_or(Json::Null))
    }

    pub async fn update_comment(&self, comment_id: &str, content: Json) -> Result<(), ApiError> {
        self.graphql(
            "mutation updateComment($input: CommentUpdateInput!) {\n\
               updateComment(input: $input)\n\
             }",
            json!({ "input": { "id": comment_id, "content": content } }),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_comment(&self, comment_id: &str) -> Result<(), ApiError> {
        self.graphql(
            "mutation deleteComment($id: String!) { deleteComment(id: $id) }",
            json!({ "id": comment_id }),
        )
        .await
        .map_err(not_found_as(ErrorCode::CommentNotFound))?;
        Ok(())
    }

    pub async fn resolve_comment(&self, comment_id: &str, resolved: bool) -> Result<(), ApiError> {
        self.graphql(
            "mutation resolveComment($input: CommentResolveInput!) {\n\
               resolveComment(input: $input)\n\
             }",
            json!({ "input": { "id": comment_id, "resolved": resolved } }),
        )
        .await
        .map_err(not_found_as(ErrorCode::CommentNotFound))?;
        Ok(())
    }

    pub async fn list_notifications(&self) -> Result<Json, ApiError> {
        let data = self
            .graphql(
                "query listNotifications($pagination: PaginationInput!) {\n\
                   currentUser {\n\
                     notifications(pagination: $pagination) {\n\
                       totalCount\n\
                       edges { node { id type level read createdAt body } }\n\
                     }\n\
                   }\n\
                 }",
                json!({ "pagination": { "first": 50, "offset": 0 } }),
            )
            .await?;

        let notifications: Vec<Json> = data
            .pointer("/currentUser/notifications/edges")
            .and_then(Json::as_array)
            .map(|edges| {
                edges
                    .iter()
                    .filter_map(|edge| edge.get("node").cloned())
                    .collect()
            })
            .unwrap_or_default();
        Ok(Json::Array(notifications))
    }

    pub async fn read_notification(&self, notification_id: &str) -> Result<(), ApiError> {
        self.graphql(
            "mutation readNotification($id: String!) { readNotification(id: $id) }",
            json!({ "id": notification_id }),
        )
        .await?;
        Ok(())
    }

    pub async fn list_access_tokens(&self) -> Result<Vec<AccessTokenRecord>, ApiError> {
        let data = self
            .graphql(
                "query accessTokens { accessTokens { id name createdAt expiresAt } }",
                json!({}),
            )
            .await?;

        let tokens = data
            .get("accessTokens")
            .and_then(Json::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(tokens
            .into_iter()
            .filter_map(|token| {
                Some(AccessTokenRecord {
                    id: token.get("id")?.as_str()?.to_owned(),
                    name: token
                        .get("name")
                        .and_then(Json::as_str)
                        .unwrap_or_default()
                        .to_owned(),
                    created_at: token
                        .get("createdAt")
                        .and_then(Json::as_str)
                        .map(str::to_owned),
                    expires_at: token
                        .get("expiresAt")
                        .and_then(Json::as_str)
                        .map(str::to_owned),
                    token: None,
                })
            })
            .collect())
    }

    pub async fn generate_access_token(
        &self,
        name: &str,
        expires_at: Option<&str>,
    ) -> Result<AccessTokenRecord, ApiError> {
        let data = self
            .graphql(
                "mutation generateUserAccessToken($input: GenerateAccessTokenInput!) {\n\
                   generateUserAccessToken(input: $input) { id name token expiresAt }\n\
                 }",
                json!({ "input": { "name": name, "expiresAt": expires_at } }),
            )
            .await?;

        let record = data
            .get("generateUserAccessToken")
            .cloned()
            .unwrap_or(Json::Null);
        Ok(AccessTokenRecord {
            id: record
                .get("id")
                .and_then(Json::as_str)
                .unwrap_or_default()
                .to_owned(),
            name: name.to_owned(),
            created_at: None,
            expires_at: record
                .get("expiresAt")
                .and_then(Json::as_str)
                .map(str::to_owned),
            token: record
                .get("token")
                .and_then(Json::as_str)
                .map(str::to_owned),
        })
    }

    pub async fn revoke_access_token(&self, token_id: &str) -> Result<(), ApiError> {
        self.graphql(
            "mutation revokeUserAccessToken($id: String!) { revokeUserAccessToken(id: $id) }",
            json!({ "id": token_id }),
        )
        .await
        .map_err(not_found_as(ErrorCode::TokenNotFound))?;
        Ok(())
    }
}

/// Narrows a generic upstream not-found onto a specific resource code.
fn not_found_as(code: ErrorCode) -> impl Fn(ApiError) -> ApiError {
    move |err| {
        if err.code == ErrorCode::DocNotFound || err.message.to_lowercase().contains("not found") {
            ApiError::new(code, err.message)
        } else {
            err
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_rejects_unknown_modes_before_any_traffic() {
        let http = UpstreamHttp::unauthenticated("http://unreachable.invalid");
        let err = http.publish_doc("W1", "D1", "banana").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }
}

#[async_trait]
impl BlobStore for UpstreamHttp {
    /// Uploads a blob through the `setBlob` multipart mutation and returns
    /// the content-addressed blob id.
    async fn put_blob(
        &self,
        workspace_id: &str,
        data: Vec<u8>,
        mime: &str,
    ) -> Result<String, ApiError> {
        let result = self
            .graphql_upload(
                "mutation setBlob($workspaceId: String!, $blob: Upload!) {\n\
                   setBlob(workspaceId: $workspaceId, blob: $blob)\n\
                 }",
                json!({ "workspaceId": workspace_id, "blob": null }),
                "blob",
                data,
                mime,
            )
            .await?;

        result
            .get("setBlob")
            .and_then(Json::as_str)
            .map(str::to_owned)
            .ok_or_else(|| {
                ApiError::new(ErrorCode::UpstreamError, "setBlob returned no blob id")
            })
    }
}
