pub mod coordinator;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::http::{ApiRequest, HttpBackend};

pub use coordinator::{CredentialRefreshCoordinator, RefreshOutcome};

pub const RENEWAL_PATH: &str = "auth/refresh";
pub const LOGIN_PATH: &str = "auth/login";
pub const REGISTER_PATH: &str = "auth/register";
pub const LOGOUT_PATH: &str = "auth/logout";

const AUTH_FLOW_PATHS: &[&str] = &[RENEWAL_PATH, LOGIN_PATH, REGISTER_PATH, LOGOUT_PATH];

/// True when `path` belongs to the login/registration/renewal flow. Such
/// requests must never trigger a renewal themselves.
pub fn is_auth_flow_path(path: &str) -> bool {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let trimmed = path.trim_matches('/');
    AUTH_FLOW_PATHS.iter().any(|flow| {
        trimmed == *flow
            || trimmed
                .strip_suffix(flow)
                .map(|prefix| prefix.ends_with('/'))
                .unwrap_or(false)
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

impl Identity {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// Where the caller should be sent once a session can no longer be renewed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRedirect {
    Login,
    VerifyEmail,
}

impl fmt::Display for AuthRedirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthRedirect::Login => f.write_str("login"),
            AuthRedirect::VerifyEmail => f.write_str("verify-email"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenewalError {
    #[error("email address is not verified")]
    Unverified,
    #[error("renewal rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("renewal timed out after {0:?}")]
    TimedOut(Duration),
    #[error("renewal transport failure: {0}")]
    Transport(String),
    #[error("invalid renewal response: {0}")]
    Decode(String),
}

impl RenewalError {
    pub fn redirect(&self) -> AuthRedirect {
        match self {
            RenewalError::Unverified => AuthRedirect::VerifyEmail,
            _ => AuthRedirect::Login,
        }
    }
}

/// The underlying credential-renewal call.
#[async_trait]
pub trait Renewer: Send + Sync {
    async fn renew(&self) -> Result<Identity, RenewalError>;
}

#[derive(Debug, Deserialize)]
struct RenewalResponse {
    user: Identity,
}

/// Renews against [`RENEWAL_PATH`] through the raw backend, never through
/// the request pipeline.
pub struct HttpRenewer {
    backend: Arc<dyn HttpBackend>,
}

impl HttpRenewer {
    pub fn new(backend: Arc<dyn HttpBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Renewer for HttpRenewer {
    async fn renew(&self) -> Result<Identity, RenewalError> {
        let request = ApiRequest::post(RENEWAL_PATH).with_credentials();
        let response = self
            .backend
            .execute(&request)
            .await
            .map_err(|err| RenewalError::Transport(err.to_string()))?;

        if response.is_success() {
            let payload: RenewalResponse = response
                .json()
                .map_err(|err| RenewalError::Decode(err.to_string()))?;
            return Ok(payload.user);
        }

        let status = response.status;
        let body = response.error_body();
        if body.is_email_unverified() {
            debug!(target = "booking.auth", status = status.as_u16(), "renewal refused: email unverified");
            return Err(RenewalError::Unverified);
        }

        Err(RenewalError::Rejected {
            status: status.as_u16(),
            message: body
                .detail()
                .map(str::to_string)
                .unwrap_or_else(|| status.to_string()),
        })
    }
}
