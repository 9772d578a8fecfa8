//! HTTP transport seam.
//!
//! Everything above this module talks to the backend through
//! [`HttpTransport`]; tests swap in scripted fakes.

use crate::{AuthError, AuthResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// HTTP methods used against the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// A backend request relative to the API base URL.
///
/// `Debug` omits headers and body, which may carry credentials.
#[derive(Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> AuthResult<Self> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }
}

impl fmt::Debug for ApiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// Status and raw body of a backend response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> AuthResult<T> {
        Ok(serde_json::from_str(&self.body)?)
    }

    /// Human-readable failure detail for error messages.
    pub fn detail(&self) -> String {
        response_detail(&self.body)
    }

    /// Turn a non-success response into [`AuthError::Api`].
    pub fn error_for_status(self) -> AuthResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(AuthError::Api {
                status: self.status,
                detail: self.detail(),
            })
        }
    }
}

/// Sends one request. Implementations never retry and never refresh.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send `request` to `url`, attaching `bearer` as the Authorization header when present.
    ///
    /// Errors are transport failures only; any HTTP status is a successful `ApiResponse`.
    async fn execute(
        &self,
        url: Url,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> AuthResult<ApiResponse>;
}

/// Production transport over a shared `reqwest::Client`.
#[derive(Clone)]
pub struct ReqwestTransport {
    http_client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> AuthResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("keyward/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(
        &self,
        url: Url,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> AuthResult<ApiResponse> {
        debug!(method = request.method.as_str(), path = %url.path(), "Sending request");

        let mut builder = self.http_client.request(request.method.into(), url);
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(map_send_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(map_send_error)?;

        debug!(status, "Received response");
        Ok(ApiResponse { status, body })
    }
}

fn map_send_error(error: reqwest::Error) -> AuthError {
    if error.is_timeout() {
        AuthError::Timeout
    } else if error.is_connect() {
        AuthError::NetworkUnavailable
    } else {
        AuthError::Http(error)
    }
}

/// Resolve `path` against the API base URL, keeping any base path prefix.
pub fn resolve_url(base: &Url, path: &str) -> AuthResult<Url> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    Ok(base.join(path.trim_start_matches('/'))?)
}

/// Digest of a response body, safe to log.
pub(crate) fn summarize_response_body(body: &str) -> String {
    let mut hasher = DefaultHasher::new();
    body.hash(&mut hasher);
    format!("len={},digest={:016x}", body.len(), hasher.finish())
}

/// Pull a readable message out of an error body, falling back to a digest.
pub(crate) fn response_detail(body: &str) -> String {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(body) {
        for field in ["detail", "error_description", "error", "message"] {
            if let Some(serde_json::Value::String(text)) = map.get(field) {
                return text.clone();
            }
        }
    }
    summarize_response_body(body)
}
