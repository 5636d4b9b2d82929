//! Session liveness for the booking client.
//!
//! Two cooperating halves keep a signed-in client alive: credential renewal
//! that collapses concurrent 401s into a single renewal call, and a realtime
//! notification channel that follows the session, answers heartbeats and
//! reconnects with bounded backoff.

pub mod auth;
pub mod cli;
pub mod config;
pub mod http;
pub mod liveness;
pub mod pipeline;
pub mod realtime;
pub mod session;
pub mod telemetry;

pub use crate::auth::{AuthRedirect, CredentialRefreshCoordinator, Identity, RenewalError};
pub use crate::config::LivenessConfig;
pub use crate::liveness::LivenessCore;
pub use crate::pipeline::{PipelineError, RequestPipeline};
pub use crate::realtime::{ConnectionState, RealtimeTransport};
pub use crate::session::{SessionSnapshot, SessionState};
