//! The error taxonomy shared by every layer of the bridge. Handlers turn an
//! `ApiError` into a JSON body plus the HTTP status carried by its code;
//! internal layers construct errors through the helpers here so that codes
//! stay consistent with what the upstream reports.

use hyper::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Stable machine-readable error codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation
    InvalidRequest,
    PayloadTooLarge,

    // Authentication / authorization
    AuthRejected,
    SessionExpired,
    PermissionDenied,
    AccessDenied,

    // Not found
    WorkspaceNotFound,
    DocNotFound,
    BlockNotFound,
    ElementNotFound,
    FolderNotFound,
    CommentNotFound,
    TokenNotFound,

    // Conflict
    DocumentAlreadyExists,
    TagAlreadyExists,

    // Upstream
    UpstreamUnreachable,
    UpstreamTimeout,
    DocUpdateBlocked,
    SocketHandshakeFailed,
    UpstreamError,

    // Integrity
    CrdtApplyFailed,

    Internal,
}

impl ErrorCode {
    pub fn status(self) -> StatusCode {
        use ErrorCode::*;

        match self {
            InvalidRequest => StatusCode::BAD_REQUEST,
            PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AuthRejected | SessionExpired => StatusCode::UNAUTHORIZED,
            PermissionDenied | AccessDenied => StatusCode::FORBIDDEN,
            WorkspaceNotFound | DocNotFound | BlockNotFound | ElementNotFound
            | FolderNotFound | CommentNotFound | TokenNotFound => StatusCode::NOT_FOUND,
            DocumentAlreadyExists | TagAlreadyExists => StatusCode::CONFLICT,
            UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            UpstreamUnreachable | DocUpdateBlocked | SocketHandshakeFailed | UpstreamError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            CrdtApplyFailed | Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Maps an error name out of an upstream socket ack (`error.name`) onto a
    /// local code. Unknown names collapse to `UpstreamError` so the verbatim
    /// message still reaches the caller.
    pub fn from_upstream_name(name: &str) -> ErrorCode {
        match name {
            "DOC_NOT_FOUND" | "NOT_FOUND" | "DOC_HISTORY_NOT_FOUND" => ErrorCode::DocNotFound,
            "DOC_UPDATE_BLOCKED" | "BLOCKED" => ErrorCode::DocUpdateBlocked,
            "ACCESS_DENIED" => ErrorCode::AccessDenied,
            "PERMISSION_DENIED" | "FORBIDDEN" => ErrorCode::PermissionDenied,
            "AUTHENTICATION_REQUIRED" | "UNAUTHORIZED" => ErrorCode::SessionExpired,
            "SPACE_NOT_FOUND" | "WORKSPACE_NOT_FOUND" => ErrorCode::WorkspaceNotFound,
            _ => ErrorCode::UpstreamError,
        }
    }
}

/// A caller-visible failure: a code plus a human-readable message.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ApiError {
            code,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn not_found(code: ErrorCode, what: &str, id: &str) -> Self {
        Self::new(code, format!("{what} {id} does not exist"))
    }

    pub fn upstream_unreachable(err: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorCode::UpstreamUnreachable,
            format!("upstream request failed: {err}"),
        )
    }

    pub fn timeout(event: &str) -> Self {
        Self::new(
            ErrorCode::UpstreamTimeout,
            format!("timed out waiting for acknowledgement of {event}"),
        )
    }

    pub fn crdt(err: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorCode::CrdtApplyFailed,
            format!("replica refused update: {err}"),
        )
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::Internal, err.to_string())
    }

    pub fn status(&self) -> StatusCode {
        self.code.status()
    }
}

/// The steps of a composed multi-document transaction, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TxStep {
    Content,
    WorkspaceIndex,
    Properties,
    Folder,
}

/// A transaction that failed part-way through. Earlier steps are durable:
/// the upstream has no rollback, so the failure names the step and carries
/// the doc id created by the steps that did land.
#[derive(Debug, Clone, Error)]
#[error("transaction step {step:?} failed: {error}")]
pub struct TransactionFailure {
    pub step: TxStep,
    /// Doc id durable on the upstream despite the failure, when step 1 landed.
    pub doc_id: Option<String>,
    pub error: ApiError,
}

impl TransactionFailure {
    pub fn new(step: TxStep, doc_id: Option<String>, error: ApiError) -> Self {
        TransactionFailure {
            step,
            doc_id,
            error,
        }
    }
}

impl From<TransactionFailure> for ApiError {
    fn from(failure: TransactionFailure) -> ApiError {
        failure.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_expected_statuses() {
        assert_eq!(ErrorCode::InvalidRequest.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::AuthRejected.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::AccessDenied.status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorCode::DocNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ErrorCode::DocumentAlreadyExists.status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ErrorCode::PayloadTooLarge.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ErrorCode::UpstreamTimeout.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn upstream_names_translate() {
        assert_eq!(
            ErrorCode::from_upstream_name("DOC_NOT_FOUND"),
            ErrorCode::DocNotFound
        );
        assert_eq!(
            ErrorCode::from_upstream_name("something-new"),
            ErrorCode::UpstreamError
        );
    }
}
