use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{header::CONTENT_TYPE, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;

use crate::error::{ApiError, ErrorCode, TransactionFailure};

/// Upload cap: 10 MB of raw payload, 15 MB once base64-inflated.
pub const MAX_BODY_BYTES: usize = 15 * 1024 * 1024;

pub fn json<T: Serialize>(value: T, code: StatusCode) -> Response<Full<Bytes>> {
    let serialized = match serde_json::to_string(&value) {
        Ok(v) => v,
        Err(err) => {
            return Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .header(CONTENT_TYPE, "text/plain")
                .body(Full::new(Bytes::from(err.to_string())))
                .unwrap();
        }
    };

    Response::builder()
        .status(code)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(serialized)))
        .unwrap()
}

pub fn json_ok<T: Serialize>(value: T) -> Response<Full<Bytes>> {
    json(value, StatusCode::OK)
}

pub fn error_response(err: &ApiError) -> Response<Full<Bytes>> {
    json(
        json!({ "error": { "code": err.code, "message": err.message } }),
        err.status(),
    )
}

/// A composed transaction that failed part-way: the body names the failed
/// step and, when step 1 landed, the durable doc id.
pub fn failure_response(failure: &TransactionFailure) -> Response<Full<Bytes>> {
    json(
        json!({ "error": {
            "code": failure.error.code,
            "message": failure.error.message,
            "step": failure.step,
            "docId": failure.doc_id,
        }}),
        failure.error.status(),
    )
}

/// Collects the request body, enforcing the payload cap before buffering
/// when the caller declared a length and after when it did not.
pub async fn read_body(request: Request<Incoming>) -> Result<Bytes, ApiError> {
    let declared = request
        .headers()
        .get(hyper::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if matches!(declared, Some(length) if length > MAX_BODY_BYTES) {
        return Err(ApiError::new(
            ErrorCode::PayloadTooLarge,
            format!("payload exceeds the {MAX_BODY_BYTES}-byte cap"),
        ));
    }

    let bytes = request
        .into_body()
        .collect()
        .await
        .map_err(|err| ApiError::invalid(format!("failed to read request body: {err}")))?
        .to_bytes();

    if bytes.len() > MAX_BODY_BYTES {
        return Err(ApiError::new(
            ErrorCode::PayloadTooLarge,
            format!("payload exceeds the {MAX_BODY_BYTES}-byte cap"),
        ));
    }
    Ok(bytes)
}

pub fn parse_json<T: DeserializeOwned>(bytes: &Bytes) -> Result<T, ApiError> {
    if bytes.is_empty() {
        return serde_json::from_slice(b"{}")
            .map_err(|err| ApiError::invalid(format!("invalid request body: {err}")));
    }
    serde_json::from_slice(bytes)
        .map_err(|err| ApiError::invalid(format!("invalid request body: {err}")))
}

/// Reads a boolean query-string flag (`?name=true`, `?name=1`, bare `?name`).
pub fn query_flag(query: &str, name: &str) -> Option<bool> {
    for pair in query.split('&') {
        let (key, value) = match pair.split_once('=') {
            Some((key, value)) => (key, value),
            None => (pair, ""),
        };
        if key == name {
            return Some(matches!(value, "" | "1" | "true" | "yes"));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_flags_parse_common_shapes() {
        assert_eq!(query_flag("links=true&x=1", "links"), Some(true));
        assert_eq!(query_flag("links", "links"), Some(true));
        assert_eq!(query_flag("cascade=false", "cascade"), Some(false));
        assert_eq!(query_flag("other=1", "links"), None);
    }
}
