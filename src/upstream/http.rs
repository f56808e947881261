//! Plain-HTTP side of the upstream: sign-in (cookie harvest), the REST
//! snapshot endpoint, and the GraphQL POST plumbing the typed operations in
//! [`super::graphql`] are built on.

use reqwest::header::{HeaderValue, COOKIE, SET_COOKIE};
use serde_json::{json, Value as Json};

use crate::error::{ApiError, ErrorCode};

/// An authenticated HTTP client for the upstream control plane. Carries the
/// two session cookies harvested at sign-in; never shared across sessions.
pub struct UpstreamHttp {
    base_url: String,
    client: reqwest::Client,
    cookie_header: String,
    user_id: String,
}

#[derive(Debug, serde::Deserialize)]
struct SignInResponse {
    #[serde(default)]
    id: Option<String>,
}

impl UpstreamHttp {
    /// Signs in and captures the session cookies from `set-cookie`.
    pub async fn sign_in(
        base_url: &str,
        email: &str,
        password: &str,
    ) -> Result<UpstreamHttp, ApiError> {
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{base_url}/api/auth/sign-in"))
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await
            .map_err(ApiError::upstream_unreachable)?;

        let status = response.status();
        if status.is_client_error() {
            return Err(ApiError::new(
                ErrorCode::AuthRejected,
                format!("upstream rejected credentials for {email} ({status})"),
            ));
        }
        if !status.is_success() {
            return Err(ApiError::new(
                ErrorCode::UpstreamUnreachable,
                format!("sign-in failed with {status}"),
            ));
        }

        let mut cookies = Vec::new();
        for header in response.headers().get_all(SET_COOKIE) {
            if let Ok(raw) = header.to_str() {
                if let Some(cookie) = raw.split(';').next() {
                    cookies.push(cookie.trim().to_owned());
                }
            }
        }
        if cookies.is_empty() {
            return Err(ApiError::new(
                ErrorCode::AuthRejected,
                "sign-in response carried no session cookies",
            ));
        }
        let cookie_header = cookies.join("; ");

        let user_id_from_cookie = cookies.iter().find_map(|cookie| {
            cookie
                .strip_prefix("affine_user_id=")
                .map(|value| value.to_owned())
        });

        let body: SignInResponse = response.json().await.unwrap_or(SignInResponse { id: None });
        let user_id = body
            .id
            .or(user_id_from_cookie)
            .unwrap_or_else(|| "unknown".to_owned());

        log::debug!("signed in to {base_url} as user {user_id}");

        Ok(UpstreamHttp {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client,
            cookie_header,
            user_id,
        })
    }

    /// An unauthenticated client; only useful for tests and health probes.
    pub fn unauthenticated(base_url: &str) -> UpstreamHttp {
        UpstreamHttp {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client: reqwest::Client::new(),
            cookie_header: String::new(),
            user_id: "unknown".to_owned(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn cookie_header(&self) -> &str {
        &self.cookie_header
    }

    /// The websocket endpoint of the realtime channel, with the engine.io
    /// handshake query attached.
    pub fn socket_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("wss://{}", self.base_url)
        };
        format!("{ws_base}/socket.io/?EIO=4&transport=websocket")
    }

    fn cookie_value(&self) -> Result<HeaderValue, ApiError> {
        HeaderValue::from_str(&self.cookie_header)
            .map_err(|_| ApiError::internal("session cookies are not a valid header value"))
    }

    /// Executes a GraphQL operation and unwraps the `data`/`errors` envelope.
    pub async fn graphql(&self, query: &str, variables: Json) -> Result<Json, ApiError> {
        let response = self
            .client
            .post(format!("{}/graphql", self.base_url))
            .header(COOKIE, self.cookie_value()?)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(ApiError::upstream_unreachable)?;

        let status = response.status();
        let envelope: Json = response
            .json()
            .await
            .map_err(|err| ApiError::new(ErrorCode::UpstreamError, format!("bad GraphQL response: {err}")))?;

        if let Some(error) = envelope.get("errors").and_then(|e| e.get(0)) {
            return Err(graphql_error(error));
        }
        if !status.is_success() {
            return Err(ApiError::new(
                ErrorCode::UpstreamError,
                format!("GraphQL request failed with {status}"),
            ));
        }

        Ok(envelope.get("data").cloned().unwrap_or(Json::Null))
    }

    /// Executes a GraphQL multipart upload (the `Upload` scalar protocol):
    /// an `operations` part, a `map` part, and the file itself.
    pub async fn graphql_upload(
        &self,
        query: &str,
        variables: Json,
        file_field: &str,
        data: Vec<u8>,
        mime: &str,
    ) -> Result<Json, ApiError> {
        let operations = json!({ "query": query, "variables": variables }).to_string();
        let map = json!({ "0": [format!("variables.{file_field}")] }).to_string();

        let part = reqwest::multipart::Part::bytes(data)
            .file_name("blob")
            .mime_str(mime)
            .map_err(|_| ApiError::invalid(format!("invalid mime type {mime:?}")))?;
        let form = reqwest::multipart::Form::new()
            .text("operations", operations)
            .text("map", map)
            .part("0", part);

        let response = self
            .client
            .post(format!("{}/graphql", self.base_url))
            .header(COOKIE, self.cookie_value()?)
            .multipart(form)
            .send()
            .await
            .map_err(ApiError::upstream_unreachable)?;

        let envelope: Json = response
            .json()
            .await
            .map_err(|err| ApiError::new(ErrorCode::UpstreamError, format!("bad GraphQL response: {err}")))?;

        if let Some(error) = envelope.get("errors").and_then(|e| e.get(0)) {
            return Err(graphql_error(error));
        }
        Ok(envelope.get("data").cloned().unwrap_or(Json::Null))
    }
}

/// Maps one entry of a GraphQL `errors` array onto the local taxonomy,
/// keeping the upstream message verbatim.
fn graphql_error(error: &Json) -> ApiError {
    let message = error
        .get("message")
        .and_then(Json::as_str)
        .unwrap_or("upstream GraphQL error")
        .to_owned();
    let name = error
        .get("extensions")
        .and_then(|ext| ext.get("name").or_else(|| ext.get("code")))
        .and_then(Json::as_str)
        .unwrap_or("");
    ApiError::new(ErrorCode::from_upstream_name(name), message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_url_rewrites_the_scheme() {
        let http = UpstreamHttp::unauthenticated("https://affine.example.com");
        assert_eq!(
            http.socket_url(),
            "wss://affine.example.com/socket.io/?EIO=4&transport=websocket"
        );

        let http = UpstreamHttp::unauthenticated("http://localhost:3010/");
        assert_eq!(
            http.socket_url(),
            "ws://localhost:3010/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[test]
    fn graphql_errors_map_to_codes() {
        let error = serde_json::json!({
            "message": "doc is gone",
            "extensions": { "name": "DOC_NOT_FOUND" },
        });
        let mapped = graphql_error(&error);
        assert_eq!(mapped.code, ErrorCode::DocNotFound);
        assert_eq!(mapped.message, "doc is gone");
    }
}
