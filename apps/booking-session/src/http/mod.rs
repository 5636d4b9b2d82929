//! Low-level request execution against the booking API.
//!
//! Nothing here knows about sessions or renewal. [`HttpBackend`] is the seam
//! the renewal call and the request pipeline are built on; the production
//! implementation is [`ReqwestBackend`], which carries ambient credentials
//! through a shared cookie jar.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::trace;
use url::Url;

/// Structured error code the API uses for "identity exists but the email
/// address has not been verified".
pub const EMAIL_NOT_VERIFIED_CODE: &str = "EMAIL_NOT_VERIFIED";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CredentialsMode {
    #[default]
    Omit,
    Include,
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    pub credentials: CredentialsMode,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            credentials: CredentialsMode::Omit,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn with_json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_credentials(mut self) -> Self {
        self.credentials = CredentialsMode::Include;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HttpError> {
        serde_json::from_slice(&self.body).map_err(|err| HttpError::Decode(err.to_string()))
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn error_body(&self) -> ErrorBody {
        ErrorBody::parse(&self.body)
    }

    /// Raw `Retry-After` header, if the server sent one.
    pub fn retry_after_raw(&self) -> Option<String> {
        self.headers
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_string())
    }

    /// `Retry-After` in its delta-seconds form. The HTTP-date form is left to
    /// callers through [`ApiResponse::retry_after_raw`].
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_raw()
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

/// Error payload returned by the API on non-success statuses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ErrorBody {
    pub fn parse(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return Self::default();
        }
        serde_json::from_slice(bytes).unwrap_or_else(|_| Self {
            code: None,
            message: Some(String::from_utf8_lossy(bytes).trim().to_string()),
            error: None,
        })
    }

    pub fn is_email_unverified(&self) -> bool {
        self.code
            .as_deref()
            .map(|code| code.trim().eq_ignore_ascii_case(EMAIL_NOT_VERIFIED_CODE))
            .unwrap_or(false)
    }

    pub fn detail(&self) -> Option<&str> {
        self.message
            .as_deref()
            .or(self.error.as_deref())
            .filter(|detail| !detail.is_empty())
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid http configuration: {0}")]
    Config(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("invalid response body: {0}")]
    Decode(String),
}

#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, HttpError>;
}

pub struct ReqwestBackend {
    base_url: Url,
    jar: Arc<Jar>,
    credentialed: Client,
    anonymous: Client,
}

impl ReqwestBackend {
    pub fn new(base_url: Url, jar: Arc<Jar>) -> Result<Self, HttpError> {
        let credentialed = Client::builder()
            .cookie_provider(jar.clone())
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|err| HttpError::Config(err.to_string()))?;
        let anonymous = Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|err| HttpError::Config(err.to_string()))?;
        Ok(Self {
            base_url,
            jar,
            credentialed,
            anonymous,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn cookie_jar(&self) -> Arc<Jar> {
        self.jar.clone()
    }

    fn url(&self, path: &str) -> Result<Url, HttpError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| HttpError::Config(format!("invalid api path '{path}': {err}")))
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, HttpError> {
        let url = self.url(&request.path)?;
        let client = match request.credentials {
            CredentialsMode::Include => &self.credentialed,
            CredentialsMode::Omit => &self.anonymous,
        };
        let mut builder = client.request(request.method.clone(), url);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        trace!(
            target = "booking.http",
            method = %request.method,
            path = %request.path,
            status = status.as_u16(),
            bytes = body.len(),
            "request completed"
        );
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn error_body_detects_unverified_code() {
        let body = ErrorBody::parse(br#"{"code":"email_not_verified","message":"verify first"}"#);
        assert!(body.is_email_unverified());
        assert_eq!(body.detail(), Some("verify first"));
    }

    #[test]
    fn error_body_ignores_unverified_wording_without_code() {
        let body = ErrorBody::parse(br#"{"message":"Email not verified"}"#);
        assert!(!body.is_email_unverified());
    }

    #[test]
    fn error_body_falls_back_to_plain_text() {
        let body = ErrorBody::parse(b"upstream exploded\n");
        assert_eq!(body.detail(), Some("upstream exploded"));
        assert!(ErrorBody::parse(b"").detail().is_none());
    }

    #[test]
    fn retry_after_parses_delta_seconds_only() {
        let mut response = ApiResponse::new(StatusCode::TOO_MANY_REQUESTS, Bytes::new());
        response
            .headers
            .insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(response.retry_after(), Some(Duration::from_secs(12)));

        response.headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"),
        );
        assert_eq!(response.retry_after(), None);
        assert_eq!(
            response.retry_after_raw().as_deref(),
            Some("Wed, 21 Oct 2026 07:28:00 GMT")
        );
    }

    #[test]
    fn backend_joins_paths_under_base() {
        let base = Url::parse("http://127.0.0.1:8080/api/").unwrap();
        let backend = ReqwestBackend::new(base, Arc::new(Jar::default())).unwrap();
        assert_eq!(
            backend.url("/auth/refresh").unwrap().as_str(),
            "http://127.0.0.1:8080/api/auth/refresh"
        );
        assert_eq!(
            backend.url("appointments?page=2").unwrap().as_str(),
            "http://127.0.0.1:8080/api/appointments?page=2"
        );
    }
}
