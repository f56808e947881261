//! The caller-facing REST surface. Hand-rolled routing over hyper: the
//! path is split into segments and matched together with the method, and
//! every handler stays a thin translation between the wire types in
//! [`super::interface`] and the composer/query layers.
//!
//! Sessions are per-request: the router signs in, the handler joins the
//! workspace it touches, and the session is torn down after the response
//! is built. `/healthz` and `/canvas` never touch the upstream here.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use hyper_tungstenite::is_upgrade_request;
use serde_json::{json, Map as JsonMap, Value as Json};

use crate::canvas::serve_canvas;
use crate::config::Config;
use crate::doc::blocks::Position;
use crate::doc::elements::ElementInput;
use crate::error::{ApiError, ErrorCode};
use crate::fabric::Fabric;
use crate::query::Navigator;
use crate::session::{Connector, Session};
use crate::transaction::{
    Composer, CreateDocumentSpec, ImageInsert, UpdateDocumentPatch,
};
use crate::web::interface::{
    AddBlockRequest, CommentRequest, CreateFolderRequest, CreateTokenRequest, DeletedResponse,
    HealthResponse, ImageUploadRequest, PublishRequest, ResolveCommentRequest, RevokedResponse,
    ServerInfoResponse, UpdatedResponse, WorkspaceSummary, SERVER_VERSION,
};
use crate::web::util::{
    error_response, failure_response, json_ok, parse_json, query_flag, read_body,
};

/// Raw (pre-base64) upload cap.
const MAX_BLOB_BYTES: usize = 10 * 1024 * 1024;

/// Everything the handlers need, injected once at server start.
pub struct AppContext {
    pub config: Config,
    pub connector: Arc<dyn Connector>,
    pub fabric: Arc<Fabric>,
}

pub async fn call(ctx: Arc<AppContext>, mut request: Request<Incoming>) -> Response<Full<Bytes>> {
    let service = ApiService { ctx };
    let method = request.method().clone();
    let path = request.uri().path().trim_matches('/').to_owned();
    let query = request.uri().query().unwrap_or("").to_owned();
    let segments: Vec<&str> = if path.is_empty() {
        Vec::new()
    } else {
        path.split('/').collect()
    };

    // Routes that must not depend on the upstream.
    match (&method, segments.as_slice()) {
        (&Method::GET, []) => {
            return json_ok(ServerInfoResponse {
                name: "affine-bridge",
                version: SERVER_VERSION,
            });
        }
        (&Method::GET, ["healthz"]) => {
            return json_ok(HealthResponse { status: "ok" });
        }
        (&Method::GET, ["canvas"]) => {
            if !is_upgrade_request(&request) {
                return error_response(&ApiError::invalid(
                    "/canvas must be called as a websocket upgrade request",
                ));
            }
            match hyper_tungstenite::upgrade(&mut request, None) {
                Ok((response, websocket)) => {
                    let fabric = Arc::clone(&service.ctx.fabric);
                    tokio::spawn(serve_canvas(websocket, fabric));
                    return response.map(|_| Full::new(Bytes::new()));
                }
                Err(err) => {
                    return error_response(&ApiError::internal(format!(
                        "websocket upgrade failed: {err}"
                    )));
                }
            }
        }
        _ => {}
    }

    let body = match read_body(request).await {
        Ok(body) => body,
        Err(err) => return error_response(&err),
    };

    let session = match service.ctx.connector.open().await {
        Ok(session) => session,
        Err(err) => return error_response(&err),
    };

    let response = service
        .dispatch(&session, &method, &segments, &query, body)
        .await
        .unwrap_or_else(|err| error_response(&err));

    // Best-effort teardown off the response path.
    tokio::spawn(async move { session.disconnect().await });

    response
}

struct ApiService {
    ctx: Arc<AppContext>,
}

type ApiResult = Result<Response<Full<Bytes>>, ApiError>;

impl ApiService {
    async fn dispatch(
        &self,
        session: &Arc<Session>,
        method: &Method,
        segments: &[&str],
        query: &str,
        body: Bytes,
    ) -> ApiResult {
        match (method, segments) {
            (&Method::GET, ["workspaces"]) => self.list_workspaces(session).await,
            (&Method::GET, ["workspaces", ws]) => self.workspace_details(session, ws).await,
            (&Method::GET, ["workspaces", ws, "hierarchy"]) => {
                let links = query_flag(query, "links").unwrap_or(false);
                self.hierarchy(session, ws, links).await
            }

            (&Method::GET, ["workspaces", ws, "folders"]) => self.list_folders(session, ws).await,
            (&Method::POST, ["workspaces", ws, "folders"]) => {
                self.create_folder(session, ws, body).await
            }
            (&Method::GET, ["workspaces", ws, "folders", folder]) => {
                self.folder_contents(session, ws, folder).await
            }

            (&Method::GET, ["workspaces", ws, "documents"]) => {
                self.list_documents(session, ws).await
            }
            (&Method::POST, ["workspaces", ws, "documents"]) => {
                self.create_document(session, ws, body).await
            }
            (&Method::GET, ["workspaces", ws, "documents", doc]) => {
                self.get_document(session, ws, doc).await
            }
            (&Method::PATCH, ["workspaces", ws, "documents", doc]) => {
                self.update_document(session, ws, doc, body).await
            }
            (&Method::DELETE, ["workspaces", ws, "documents", doc]) => {
                self.delete_document(session, ws, doc).await
            }

            (&Method::GET, ["workspaces", ws, "documents", doc, "content"]) => {
                self.get_content(session, ws, doc).await
            }
            (&Method::POST, ["workspaces", ws, "documents", doc, "blocks"]) => {
                self.add_block(session, ws, doc, body).await
            }
            (&Method::PATCH, ["workspaces", ws, "documents", doc, "blocks", block]) => {
                self.update_block(session, ws, doc, block, body).await
            }
            (&Method::DELETE, ["workspaces", ws, "documents", doc, "blocks", block]) => {
                let cascade = query_flag(query, "cascade").unwrap_or(true);
                self.delete_block(session, ws, doc, block, cascade).await
            }

            (&Method::GET, ["workspaces", ws, "documents", doc, "edgeless"])
            | (&Method::GET, ["workspaces", ws, "documents", doc, "edgeless", "elements"]) => {
                self.list_elements(session, ws, doc).await
            }
            (&Method::POST, ["workspaces", ws, "documents", doc, "edgeless", "elements"]) => {
                self.create_element(session, ws, doc, body).await
            }
            (&Method::GET, ["workspaces", ws, "documents", doc, "edgeless", "elements", id]) => {
                self.get_element(session, ws, doc, id).await
            }
            (&Method::PATCH, ["workspaces", ws, "documents", doc, "edgeless", "elements", id]) => {
                self.update_element(session, ws, doc, id, body).await
            }
            (&Method::DELETE, ["workspaces", ws, "documents", doc, "edgeless", "elements", id]) => {
                let cleanup = query_flag(query, "cleanup").unwrap_or(false);
                self.delete_element(session, ws, doc, id, cleanup).await
            }

            (&Method::POST, ["workspaces", ws, "documents", doc, "images"]) => {
                self.upload_image(session, ws, doc, body).await
            }
            (&Method::POST, ["workspaces", ws, "documents", doc, "publish"]) => {
                self.publish(session, ws, doc, body).await
            }
            (&Method::POST, ["workspaces", ws, "documents", doc, "revoke"]) => {
                self.revoke(session, ws, doc).await
            }

            (&Method::GET, ["workspaces", ws, "documents", doc, "comments"]) => {
                self.list_comments(session, ws, doc).await
            }
            (&Method::POST, ["workspaces", ws, "documents", doc, "comments"]) => {
                self.create_comment(session, ws, doc, body).await
            }
            (&Method::PATCH, ["workspaces", _ws, "documents", _doc, "comments", id]) => {
                self.update_comment(session, id, body).await
            }
            (&Method::DELETE, ["workspaces", _ws, "documents", _doc, "comments", id]) => {
                self.delete_comment(session, id).await
            }
            (&Method::POST, ["workspaces", _ws, "documents", _doc, "comments", id, "resolve"]) => {
                self.resolve_comment(session, id, body).await
            }

            (&Method::GET, ["notifications"]) => self.list_notifications(session).await,
            (&Method::POST, ["notifications", id, "read"]) => {
                self.read_notification(session, id).await
            }

            (&Method::GET, ["users", "me", "tokens"]) => self.list_tokens(session).await,
            (&Method::POST, ["users", "me", "tokens"]) => {
                self.create_token(session, body).await
            }
            (&Method::DELETE, ["users", "me", "tokens", id]) => {
                self.revoke_token(session, id).await
            }

            (_, _) => Ok(crate::web::util::json(
                json!({ "error": {
                    "code": "NOT_FOUND",
                    "message": format!("route not found: /{}", segments.join("/")),
                }}),
                StatusCode::NOT_FOUND,
            )),
        }
    }

    async fn joined<'a>(
        &self,
        session: &'a Arc<Session>,
        workspace_id: &str,
    ) -> Result<&'a Arc<Session>, ApiError> {
        session.join_workspace(workspace_id).await?;
        Ok(session)
    }

    fn composer<'a>(&self, session: &'a Session, workspace_id: &'a str) -> Composer<'a> {
        Composer::new(session.channel().as_ref(), workspace_id, session.user_id())
    }

    async fn list_workspaces(&self, session: &Arc<Session>) -> ApiResult {
        let refs = session.http().workspaces().await?;
        let mut out = Vec::new();
        for workspace in refs {
            if let Err(err) = session.join_workspace(&workspace.id).await {
                log::warn!("skipping workspace {}: {err}", workspace.id);
                continue;
            }
            let navigator = Navigator::new(session.channel().as_ref(), &workspace.id);
            match navigator.overview().await {
                Ok(overview) => out.push(WorkspaceSummary {
                    id: workspace.id,
                    name: overview.name,
                    avatar: overview.avatar,
                    member_count: workspace.member_count,
                    doc_count: overview.doc_count,
                }),
                Err(err) => log::warn!("skipping workspace {}: {err}", workspace.id),
            }
        }
        Ok(json_ok(out))
    }

    async fn workspace_details(&self, session: &Arc<Session>, workspace_id: &str) -> ApiResult {
        let session = self.joined(session, workspace_id).await?;
        let member_count = session
            .http()
            .workspaces()
            .await
            .ok()
            .and_then(|refs| {
                refs.into_iter()
                    .find(|w| w.id == workspace_id)
                    .and_then(|w| w.member_count)
            });
        let navigator = Navigator::new(session.channel().as_ref(), workspace_id);
        let overview = navigator.overview().await?;
        Ok(json_ok(WorkspaceSummary {
            id: overview.id,
            name: overview.name,
            avatar: overview.avatar,
            member_count,
            doc_count: overview.doc_count,
        }))
    }

    async fn hierarchy(
        &self,
        session: &Arc<Session>,
        workspace_id: &str,
        links: bool,
    ) -> ApiResult {
        let session = self.joined(session, workspace_id).await?;
        let navigator = Navigator::new(session.channel().as_ref(), workspace_id);
        Ok(json_ok(navigator.hierarchy(links).await?))
    }

    async fn list_folders(&self, session: &Arc<Session>, workspace_id: &str) -> ApiResult {
        let session = self.joined(session, workspace_id).await?;
        let navigator = Navigator::new(session.channel().as_ref(), workspace_id);
        Ok(json_ok(navigator.folders().await?))
    }

    async fn create_folder(
        &self,
        session: &Arc<Session>,
        workspace_id: &str,
        body: Bytes,
    ) -> ApiResult {
        let request: CreateFolderRequest = parse_json(&body)?;
        request.validate()?;
        let session = self.joined(session, workspace_id).await?;
        let node = self
            .composer(session, workspace_id)
            .create_folder(&request.name, request.parent_id.as_deref())
            .await?;
        Ok(crate::web::util::json(node, StatusCode::CREATED))
    }

    async fn folder_contents(
        &self,
        session: &Arc<Session>,
        workspace_id: &str,
        folder_id: &str,
    ) -> ApiResult {
        let session = self.joined(session, workspace_id).await?;
        let navigator = Navigator::new(session.channel().as_ref(), workspace_id);
        Ok(json_ok(navigator.folder_contents(folder_id).await?))
    }

    async fn list_documents(&self, session: &Arc<Session>, workspace_id: &str) -> ApiResult {
        let session = self.joined(session, workspace_id).await?;
        let navigator = Navigator::new(session.channel().as_ref(), workspace_id);
        Ok(json_ok(navigator.list_documents().await?))
    }

    async fn create_document(
        &self,
        session: &Arc<Session>,
        workspace_id: &str,
        body: Bytes,
    ) -> ApiResult {
        let spec: CreateDocumentSpec = parse_json(&body)?;
        let session = self.joined(session, workspace_id).await?;
        match self.composer(session, workspace_id).create_document(spec).await {
            Ok(created) => Ok(crate::web::util::json(created, StatusCode::CREATED)),
            Err(failure) => Ok(failure_response(&failure)),
        }
    }

    async fn get_document(
        &self,
        session: &Arc<Session>,
        workspace_id: &str,
        doc_id: &str,
    ) -> ApiResult {
        let session = self.joined(session, workspace_id).await?;
        let navigator = Navigator::new(session.channel().as_ref(), workspace_id);
        Ok(json_ok(navigator.document_summary(doc_id).await?))
    }

    async fn update_document(
        &self,
        session: &Arc<Session>,
        workspace_id: &str,
        doc_id: &str,
        body: Bytes,
    ) -> ApiResult {
        let patch: UpdateDocumentPatch = parse_json(&body)?;
        if patch.is_empty() {
            return Err(ApiError::invalid("update carries no recognised fields"));
        }
        if let Some(mode) = &patch.mode {
            if mode != "page" && mode != "edgeless" {
                return Err(ApiError::invalid(format!(
                    "mode must be \"page\" or \"edgeless\", got {mode:?}"
                )));
            }
        }
        let session = self.joined(session, workspace_id).await?;
        match self
            .composer(session, workspace_id)
            .update_document(doc_id, &patch)
            .await
        {
            Ok(timestamp) => Ok(json_ok(UpdatedResponse { timestamp })),
            Err(failure) => Ok(failure_response(&failure)),
        }
    }

    async fn delete_document(
        &self,
        session: &Arc<Session>,
        workspace_id: &str,
        doc_id: &str,
    ) -> ApiResult {
        let session = self.joined(session, workspace_id).await?;
        match self
            .composer(session, workspace_id)
            .delete_document(doc_id)
            .await
        {
            Ok(()) => Ok(json_ok(DeletedResponse { deleted: true })),
            Err(failure) => Ok(failure_response(&failure)),
        }
    }

    async fn get_content(
        &self,
        session: &Arc<Session>,
        workspace_id: &str,
        doc_id: &str,
    ) -> ApiResult {
        let session = self.joined(session, workspace_id).await?;
        let navigator = Navigator::new(session.channel().as_ref(), workspace_id);
        let root = navigator.content(doc_id).await?;
        let markdown = navigator.content_markdown(doc_id).await.unwrap_or_default();
        Ok(json_ok(json!({ "root": root, "markdown": markdown })))
    }

    async fn add_block(
        &self,
        session: &Arc<Session>,
        workspace_id: &str,
        doc_id: &str,
        body: Bytes,
    ) -> ApiResult {
        let request: AddBlockRequest = parse_json(&body)?;
        request.validate()?;
        let position = match &request.position {
            Some(position) => Position::from_json(position)?,
            None => Position::End,
        };
        let session = self.joined(session, workspace_id).await?;
        let block_id = self
            .composer(session, workspace_id)
            .add_block(
                doc_id,
                request.parent_block_id.as_deref(),
                &request.flavour,
                &request.props,
                position,
            )
            .await?;
        Ok(crate::web::util::json(
            json!({ "blockId": block_id }),
            StatusCode::CREATED,
        ))
    }

    async fn update_block(
        &self,
        session: &Arc<Session>,
        workspace_id: &str,
        doc_id: &str,
        block_id: &str,
        body: Bytes,
    ) -> ApiResult {
        let props: JsonMap<String, Json> = parse_json(&body)?;
        let session = self.joined(session, workspace_id).await?;
        self.composer(session, workspace_id)
            .update_block(doc_id, block_id, &props)
            .await?;
        Ok(json_ok(json!({ "blockId": block_id })))
    }

    async fn delete_block(
        &self,
        session: &Arc<Session>,
        workspace_id: &str,
        doc_id: &str,
        block_id: &str,
        cascade: bool,
    ) -> ApiResult {
        let session = self.joined(session, workspace_id).await?;
        self.composer(session, workspace_id)
            .delete_block(doc_id, block_id, cascade)
            .await?;
        Ok(json_ok(DeletedResponse { deleted: true }))
    }

    async fn list_elements(
        &self,
        session: &Arc<Session>,
        workspace_id: &str,
        doc_id: &str,
    ) -> ApiResult {
        let session = self.joined(session, workspace_id).await?;
        let navigator = Navigator::new(session.channel().as_ref(), workspace_id);
        Ok(json_ok(navigator.elements(doc_id).await?))
    }

    async fn create_element(
        &self,
        session: &Arc<Session>,
        workspace_id: &str,
        doc_id: &str,
        body: Bytes,
    ) -> ApiResult {
        let input: ElementInput = parse_json(&body)?;
        let session = self.joined(session, workspace_id).await?;
        let (_, view) = self
            .composer(session, workspace_id)
            .create_element(doc_id, input)
            .await?;
        Ok(crate::web::util::json(view, StatusCode::CREATED))
    }

    async fn get_element(
        &self,
        session: &Arc<Session>,
        workspace_id: &str,
        doc_id: &str,
        element_id: &str,
    ) -> ApiResult {
        let session = self.joined(session, workspace_id).await?;
        let navigator = Navigator::new(session.channel().as_ref(), workspace_id);
        Ok(json_ok(navigator.element(doc_id, element_id).await?))
    }

    async fn update_element(
        &self,
        session: &Arc<Session>,
        workspace_id: &str,
        doc_id: &str,
        element_id: &str,
        body: Bytes,
    ) -> ApiResult {
        let changes: JsonMap<String, Json> = parse_json(&body)?;
        let session = self.joined(session, workspace_id).await?;
        let view = self
            .composer(session, workspace_id)
            .update_element(doc_id, element_id, &changes)
            .await?;
        Ok(json_ok(view))
    }

    async fn delete_element(
        &self,
        session: &Arc<Session>,
        workspace_id: &str,
        doc_id: &str,
        element_id: &str,
        cleanup: bool,
    ) -> ApiResult {
        let session = self.joined(session, workspace_id).await?;
        self.composer(session, workspace_id)
            .delete_element(doc_id, element_id, cleanup)
            .await?;
        Ok(json_ok(DeletedResponse { deleted: true }))
    }

    async fn upload_image(
        &self,
        session: &Arc<Session>,
        workspace_id: &str,
        doc_id: &str,
        body: Bytes,
    ) -> ApiResult {
        let request: ImageUploadRequest = parse_json(&body)?;
        let data = BASE64
            .decode(request.data.as_bytes())
            .map_err(|_| ApiError::invalid("image data is not valid base64"))?;
        if data.is_empty() {
            return Err(ApiError::invalid("image data must not be empty"));
        }
        if data.len() > MAX_BLOB_BYTES {
            return Err(ApiError::new(
                ErrorCode::PayloadTooLarge,
                format!("image exceeds the {MAX_BLOB_BYTES}-byte cap"),
            ));
        }

        let session = self.joined(session, workspace_id).await?;
        let inserted = self
            .composer(session, workspace_id)
            .insert_image(
                doc_id,
                session.http().as_ref(),
                ImageInsert {
                    data,
                    mime: request.mime.unwrap_or_else(|| "image/png".to_owned()),
                    parent_block_id: request.parent_block_id,
                    caption: request.caption,
                    width: request.width,
                    height: request.height,
                },
            )
            .await?;
        Ok(crate::web::util::json(inserted, StatusCode::CREATED))
    }

    async fn publish(
        &self,
        session: &Arc<Session>,
        workspace_id: &str,
        doc_id: &str,
        body: Bytes,
    ) -> ApiResult {
        let request: PublishRequest = parse_json(&body)?;
        let mode = request.mode()?;
        let record = session.http().publish_doc(workspace_id, doc_id, mode).await?;
        Ok(json_ok(record))
    }

    async fn revoke(
        &self,
        session: &Arc<Session>,
        workspace_id: &str,
        doc_id: &str,
    ) -> ApiResult {
        session.http().revoke_public_doc(workspace_id, doc_id).await?;
        Ok(json_ok(RevokedResponse { revoked: true }))
    }

    async fn list_comments(
        &self,
        session: &Arc<Session>,
        workspace_id: &str,
        doc_id: &str,
    ) -> ApiResult {
        Ok(json_ok(
            session.http().list_comments(workspace_id, doc_id).await?,
        ))
    }

    async fn create_comment(
        &self,
        session: &Arc<Session>,
        workspace_id: &str,
        doc_id: &str,
        body: Bytes,
    ) -> ApiResult {
        let request: CommentRequest = parse_json(&body)?;
        let created = session
            .http()
            .create_comment(workspace_id, doc_id, request.content)
            .await?;
        Ok(crate::web::util::json(created, StatusCode::CREATED))
    }

    async fn update_comment(
        &self,
        session: &Arc<Session>,
        comment_id: &str,
        body: Bytes,
    ) -> ApiResult {
        let request: CommentRequest = parse_json(&body)?;
        session
            .http()
            .update_comment(comment_id, request.content)
            .await?;
        Ok(json_ok(json!({ "id": comment_id })))
    }

    async fn delete_comment(&self, session: &Arc<Session>, comment_id: &str) -> ApiResult {
        session.http().delete_comment(comment_id).await?;
        Ok(json_ok(DeletedResponse { deleted: true }))
    }

    async fn resolve_comment(
        &self,
        session: &Arc<Session>,
        comment_id: &str,
        body: Bytes,
    ) -> ApiResult {
        let request: ResolveCommentRequest = parse_json(&body)?;
        session
            .http()
            .resolve_comment(comment_id, request.resolved)
            .await?;
        Ok(json_ok(json!({ "id": comment_id, "resolved": request.resolved })))
    }

    async fn list_notifications(&self, session: &Arc<Session>) -> ApiResult {
        Ok(json_ok(session.http().list_notifications().await?))
    }

    async fn read_notification(&self, session: &Arc<Session>, id: &str) -> ApiResult {
        session.http().read_notification(id).await?;
        Ok(json_ok(json!({ "id": id, "read": true })))
    }

    async fn list_tokens(&self, session: &Arc<Session>) -> ApiResult {
        Ok(json_ok(session.http().list_access_tokens().await?))
    }

    async fn create_token(&self, session: &Arc<Session>, body: Bytes) -> ApiResult {
        let request: CreateTokenRequest = parse_json(&body)?;
        if request.name.trim().is_empty() {
            return Err(ApiError::invalid("token name must not be empty"));
        }
        let token = session
            .http()
            .generate_access_token(&request.name, request.expires_at.as_deref())
            .await?;
        Ok(crate::web::util::json(token, StatusCode::CREATED))
    }

    async fn revoke_token(&self, session: &Arc<Session>, id: &str) -> ApiResult {
        session.http().revoke_access_token(id).await?;
        Ok(json_ok(RevokedResponse { revoked: true }))
    }
}
