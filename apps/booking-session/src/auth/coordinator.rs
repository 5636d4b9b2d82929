//! Single-flight credential renewal.
//!
//! However many callers discover an expired credential at the same time, at
//! most one renewal call is outstanding. The first caller starts it; everyone
//! arriving while it runs joins the waiter list and receives the same
//! outcome, in the order they joined.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{Identity, RenewalError, Renewer};

pub type RefreshOutcome = Result<Identity, RenewalError>;

#[derive(Default)]
struct RefreshCoordinationState {
    in_flight: bool,
    waiters: Vec<oneshot::Sender<RefreshOutcome>>,
}

pub struct CredentialRefreshCoordinator {
    renewer: Arc<dyn Renewer>,
    state: Arc<Mutex<RefreshCoordinationState>>,
    timeout: Duration,
}

impl CredentialRefreshCoordinator {
    pub fn new(renewer: Arc<dyn Renewer>, timeout: Duration) -> Self {
        Self {
            renewer,
            state: Arc::new(Mutex::new(RefreshCoordinationState::default())),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn in_flight(&self) -> bool {
        self.state.lock().in_flight
    }

    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Joins the in-flight renewal, starting one if none is running.
    pub async fn request_refresh(&self) -> RefreshOutcome {
        let (sender, receiver) = oneshot::channel();
        let starts_renewal = {
            let mut state = self.state.lock();
            state.waiters.push(sender);
            !std::mem::replace(&mut state.in_flight, true)
        };

        if starts_renewal {
            debug!(target = "booking.auth", "starting credential renewal");
            let mut release = Release {
                state: self.state.clone(),
                outcome: None,
            };
            let renewer = self.renewer.clone();
            let timeout = self.timeout;
            // Spawned so that dropping the initiating caller cannot cancel a
            // renewal other callers are waiting on.
            tokio::spawn(async move {
                release.outcome = Some(bounded_renewal(renewer.as_ref(), timeout).await);
            });
        } else {
            debug!(target = "booking.auth", "joining in-flight credential renewal");
        }

        receiver.await.unwrap_or_else(|_| {
            Err(RenewalError::Transport(
                "renewal task ended without an outcome".into(),
            ))
        })
    }
}

async fn bounded_renewal(renewer: &dyn Renewer, timeout: Duration) -> RefreshOutcome {
    match tokio::time::timeout(timeout, renewer.renew()).await {
        Ok(Ok(identity)) => {
            info!(target = "booking.auth", user = %identity.id, "credential renewal succeeded");
            Ok(identity)
        }
        Ok(Err(err)) => {
            warn!(target = "booking.auth", error = %err, "credential renewal failed");
            Err(err)
        }
        Err(_) => {
            warn!(target = "booking.auth", timeout_ms = timeout.as_millis() as u64, "credential renewal timed out");
            Err(RenewalError::TimedOut(timeout))
        }
    }
}

/// Resets the coordination state and releases every waiter when the renewal
/// task finishes, including when it is aborted or panics.
struct Release {
    state: Arc<Mutex<RefreshCoordinationState>>,
    outcome: Option<RefreshOutcome>,
}

impl Drop for Release {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or_else(|| {
            Err(RenewalError::Transport("renewal task aborted".into()))
        });
        let waiters = {
            let mut state = self.state.lock();
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };
        debug!(target = "booking.auth", waiters = waiters.len(), "releasing renewal waiters");
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}
