//! Ordered stages every API request passes through.
//!
//! 1. credentials: the request always carries ambient credentials.
//! 2. authorization: a 401 triggers one coordinated renewal and one replay;
//!    a 403 carrying the unverified code ends the session.
//! 3. rate limit: a 429 is surfaced with its retry hint and never retried.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

use crate::auth::{AuthRedirect, is_auth_flow_path};
use crate::http::{ApiRequest, ApiResponse, ErrorBody, HttpBackend, HttpError};
use crate::session::SessionState;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("request failed with status {status}")]
    Status { status: StatusCode, body: ErrorBody },
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited {
        retry_after: Option<Duration>,
        retry_after_raw: Option<String>,
        body: ErrorBody,
    },
    #[error("session expired; redirect to {redirect}")]
    SessionExpired { redirect: AuthRedirect },
    #[error("email address is not verified")]
    EmailUnverified,
    #[error("failed to encode request body: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode response body: {0}")]
    Decode(#[source] serde_json::Error),
}

impl PipelineError {
    /// Where the caller should navigate, when the failure ended the session.
    pub fn redirect(&self) -> Option<AuthRedirect> {
        match self {
            PipelineError::SessionExpired { redirect } => Some(*redirect),
            PipelineError::EmailUnverified => Some(AuthRedirect::VerifyEmail),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            PipelineError::Status { status, .. } => Some(*status),
            PipelineError::RateLimited { .. } => Some(StatusCode::TOO_MANY_REQUESTS),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct RequestPipeline {
    backend: Arc<dyn HttpBackend>,
    session: SessionState,
}

impl RequestPipeline {
    pub fn new(backend: Arc<dyn HttpBackend>, session: SessionState) -> Self {
        Self { backend, session }
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, PipelineError> {
        let response = self.authorize(request).await?;
        let response = limit_rate(response)?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(PipelineError::Status {
                status: response.status,
                body: response.error_body(),
            })
        }
    }

    pub async fn get_json<T>(&self, path: &str) -> Result<T, PipelineError>
    where
        T: DeserializeOwned,
    {
        let response = self.send(ApiRequest::get(path)).await?;
        serde_json::from_slice(&response.body).map_err(PipelineError::Decode)
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, PipelineError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::to_value(body).map_err(PipelineError::Encode)?;
        let response = self.send(ApiRequest::post(path).with_json(body)).await?;
        serde_json::from_slice(&response.body).map_err(PipelineError::Decode)
    }

    async fn dispatch(&self, request: &ApiRequest) -> Result<ApiResponse, PipelineError> {
        let request = request.clone().with_credentials();
        Ok(self.backend.execute(&request).await?)
    }

    async fn authorize(&self, request: ApiRequest) -> Result<ApiResponse, PipelineError> {
        let mut response = self.dispatch(&request).await?;

        if response.status == StatusCode::UNAUTHORIZED {
            if is_auth_flow_path(&request.path) {
                debug!(
                    target = "booking.pipeline",
                    path = %request.path,
                    "401 on auth flow path; not renewing"
                );
                return Ok(response);
            }

            debug!(target = "booking.pipeline", path = %request.path, "401; renewing credentials");
            if let Err(redirect) = self.session.renew_credentials().await {
                return Err(PipelineError::SessionExpired { redirect });
            }
            // Exactly one replay. A second 401 is returned to the caller.
            response = self.dispatch(&request).await?;
        }

        if response.status == StatusCode::FORBIDDEN && response.error_body().is_email_unverified() {
            warn!(target = "booking.pipeline", path = %request.path, "server reports unverified email");
            self.session.mark_unverified();
            return Err(PipelineError::EmailUnverified);
        }

        Ok(response)
    }
}

fn limit_rate(response: ApiResponse) -> Result<ApiResponse, PipelineError> {
    if response.status != StatusCode::TOO_MANY_REQUESTS {
        return Ok(response);
    }
    let retry_after = response.retry_after();
    warn!(
        target = "booking.pipeline",
        retry_after_secs = retry_after.map(|delay| delay.as_secs()),
        "rate limited"
    );
    Err(PipelineError::RateLimited {
        retry_after,
        retry_after_raw: response.retry_after_raw(),
        body: response.error_body(),
    })
}
