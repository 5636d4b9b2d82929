//! Who the caller is and whether the app may treat them as signed in.
//!
//! [`SessionState`] is the single authority for session validity. Every
//! mutation replaces the whole [`SessionSnapshot`] and notifies subscribers
//! through a watch channel before returning.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::auth::{AuthRedirect, CredentialRefreshCoordinator, Identity, RefreshOutcome};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    identity: Option<Identity>,
    is_loading: bool,
    last_error: Option<String>,
}

impl SessionSnapshot {
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    pub fn is_verified(&self) -> bool {
        self.identity
            .as_ref()
            .map(|identity| identity.email_verified)
            .unwrap_or(false)
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.identity
            .as_ref()
            .map(|identity| identity.has_role(role))
            .unwrap_or(false)
    }
}

#[derive(Clone)]
pub struct SessionState {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    snapshot: watch::Sender<SessionSnapshot>,
    coordinator: Arc<CredentialRefreshCoordinator>,
    bootstrap_started: AtomicBool,
    bootstrapped: AtomicBool,
    redirects: broadcast::Sender<AuthRedirect>,
}

impl SessionState {
    pub fn new(coordinator: Arc<CredentialRefreshCoordinator>) -> Self {
        let (snapshot, _) = watch::channel(SessionSnapshot::default());
        let (redirects, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(SessionInner {
                snapshot,
                coordinator,
                bootstrap_started: AtomicBool::new(false),
                bootstrapped: AtomicBool::new(false),
                redirects,
            }),
        }
    }

    pub fn coordinator(&self) -> &Arc<CredentialRefreshCoordinator> {
        &self.inner.coordinator
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot.subscribe()
    }

    /// Redirects decided by renewal failures, for whoever drives navigation.
    pub fn subscribe_redirects(&self) -> broadcast::Receiver<AuthRedirect> {
        self.inner.redirects.subscribe()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.inner.snapshot.borrow().has_role(role)
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.inner.bootstrapped.load(Ordering::SeqCst)
    }

    /// Establishes the initial session. Runs at most once per state; later
    /// calls return immediately.
    pub async fn bootstrap(&self) {
        if self.inner.bootstrap_started.swap(true, Ordering::SeqCst) {
            debug!(target = "booking.session", "bootstrap already started");
            return;
        }

        self.set_loading(true);
        // Shares the coordinator slot so a 401 racing the bootstrap joins it.
        let outcome = self.inner.coordinator.request_refresh().await;
        self.inner.bootstrapped.store(true, Ordering::SeqCst);
        match outcome {
            Ok(identity) => {
                info!(
                    target = "booking.session",
                    user = %identity.id,
                    verified = identity.email_verified,
                    "session bootstrapped"
                );
                self.replace(|_| SessionSnapshot {
                    identity: Some(identity),
                    is_loading: false,
                    last_error: None,
                });
            }
            Err(err) => {
                debug!(target = "booking.session", error = %err, "no session to restore");
                self.clear();
            }
        }
    }

    /// Waits for bootstrap to finish, bounded by `timeout`. On timeout the
    /// caller gets the unauthenticated snapshot rather than hanging.
    pub async fn wait_until_ready(&self, timeout: Duration) -> SessionSnapshot {
        let mut receiver = self.subscribe();
        let inner = self.inner.clone();
        let ready = receiver.wait_for(|snapshot| {
            inner.bootstrapped.load(Ordering::SeqCst) && !snapshot.is_loading()
        });
        match tokio::time::timeout(timeout, ready).await {
            Ok(Ok(snapshot)) => snapshot.clone(),
            Ok(Err(_)) => SessionSnapshot::default(),
            Err(_) => {
                warn!(
                    target = "booking.session",
                    timeout_ms = timeout.as_millis() as u64,
                    "session not ready in time; treating caller as unauthenticated"
                );
                SessionSnapshot::default()
            }
        }
    }

    pub fn set_identity(&self, identity: Option<Identity>) -> bool {
        self.replace(|current| SessionSnapshot {
            identity,
            is_loading: current.is_loading,
            last_error: None,
        })
    }

    pub fn set_loading(&self, loading: bool) -> bool {
        self.replace(|current| SessionSnapshot {
            is_loading: loading,
            ..current.clone()
        })
    }

    pub fn set_error(&self, error: Option<String>) -> bool {
        self.replace(|current| SessionSnapshot {
            last_error: error,
            ..current.clone()
        })
    }

    pub fn clear(&self) -> bool {
        self.replace(|_| SessionSnapshot::default())
    }

    /// Re-validates an authenticated session through the shared renewal.
    /// Returns whether the session is still valid afterwards; a failure
    /// clears it.
    pub async fn refresh(&self) -> bool {
        if !self.snapshot().is_authenticated() {
            debug!(target = "booking.session", "refresh skipped; not authenticated");
            return false;
        }

        self.set_loading(true);
        let outcome = self.inner.coordinator.request_refresh().await;
        let renewed = self.apply_outcome(outcome).is_ok();
        self.set_loading(false);
        renewed
    }

    /// Renewal on behalf of a request that failed authorization.
    pub async fn renew_credentials(&self) -> Result<Identity, AuthRedirect> {
        let outcome = self.inner.coordinator.request_refresh().await;
        self.apply_outcome(outcome)
    }

    /// The server reported an authenticated but unverified identity.
    pub fn mark_unverified(&self) {
        warn!(target = "booking.session", "email not verified; clearing session");
        self.end_session(AuthRedirect::VerifyEmail);
    }

    fn apply_outcome(&self, outcome: RefreshOutcome) -> Result<Identity, AuthRedirect> {
        match outcome {
            Ok(identity) => {
                self.set_identity(Some(identity.clone()));
                Ok(identity)
            }
            Err(err) => {
                let redirect = err.redirect();
                warn!(
                    target = "booking.session",
                    error = %err,
                    redirect = %redirect,
                    "renewal failed; clearing session"
                );
                self.end_session(redirect);
                Err(redirect)
            }
        }
    }

    fn end_session(&self, redirect: AuthRedirect) {
        // Only the waiter that actually ends the session announces the redirect.
        if self.clear() {
            let _ = self.inner.redirects.send(redirect);
        }
    }

    fn replace<F>(&self, update: F) -> bool
    where
        F: FnOnce(&SessionSnapshot) -> SessionSnapshot,
    {
        self.inner.snapshot.send_if_modified(|current| {
            let next = update(current);
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{RenewalError, Renewer};
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    fn identity(verified: bool) -> Identity {
        Identity {
            id: "u-7".into(),
            email: "sam@example.com".into(),
            email_verified: verified,
            roles: BTreeSet::from(["USER".to_string()]),
        }
    }

    struct ScriptedRenewer {
        calls: AtomicUsize,
        gate: Semaphore,
        outcome: parking_lot::Mutex<RefreshOutcome>,
    }

    impl ScriptedRenewer {
        fn new(outcome: RefreshOutcome, open: bool) -> Arc<Self> {
            let permits = if open { Semaphore::MAX_PERMITS } else { 0 };
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(permits),
                outcome: parking_lot::Mutex::new(outcome),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn set_outcome(&self, outcome: RefreshOutcome) {
            *self.outcome.lock() = outcome;
        }
    }

    #[async_trait]
    impl Renewer for ScriptedRenewer {
        async fn renew(&self) -> Result<Identity, RenewalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _permit = self.gate.acquire().await.expect("gate closed");
            self.outcome.lock().clone()
        }
    }

    fn session_with(renewer: Arc<ScriptedRenewer>) -> SessionState {
        let coordinator = Arc::new(CredentialRefreshCoordinator::new(
            renewer,
            Duration::from_secs(5),
        ));
        SessionState::new(coordinator)
    }

    #[test]
    fn initial_snapshot_is_unauthenticated() {
        let snapshot = SessionSnapshot::default();
        assert!(!snapshot.is_authenticated());
        assert!(!snapshot.is_verified());
        assert!(!snapshot.is_loading());
        assert!(snapshot.identity().is_none());
        assert!(snapshot.last_error().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn set_identity_recomputes_flags_and_notifies() {
        let session = session_with(ScriptedRenewer::new(Err(RenewalError::Unverified), true));
        let mut receiver = session.subscribe();
        session.set_error(Some("stale".into()));
        receiver.borrow_and_update();

        assert!(session.set_identity(Some(identity(false))));
        assert!(receiver.has_changed().unwrap());
        let snapshot = receiver.borrow_and_update().clone();
        assert!(snapshot.is_authenticated());
        assert!(!snapshot.is_verified());
        assert!(snapshot.last_error().is_none());
        assert!(snapshot.has_role("USER"));

        assert!(!session.set_identity(Some(identity(false))));
        assert!(!receiver.has_changed().unwrap());
    }

    #[test_timeout::tokio_timeout_test]
    async fn bootstrap_runs_once_for_concurrent_callers() {
        let renewer = ScriptedRenewer::new(Ok(identity(true)), false);
        let session = session_with(renewer.clone());

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.bootstrap().await }
        });
        let second = tokio::spawn({
            let session = session.clone();
            async move { session.bootstrap().await }
        });
        while renewer.calls() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(session.snapshot().is_loading());

        renewer.gate.add_permits(1);
        first.await.unwrap();
        second.await.unwrap();

        let snapshot = session.snapshot();
        assert_eq!(renewer.calls(), 1);
        assert!(snapshot.is_authenticated());
        assert!(snapshot.is_verified());
        assert!(!snapshot.is_loading());

        session.bootstrap().await;
        assert_eq!(renewer.calls(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn bootstrap_failure_clears_session() {
        let renewer = ScriptedRenewer::new(
            Err(RenewalError::Rejected {
                status: 401,
                message: "no session".into(),
            }),
            true,
        );
        let session = session_with(renewer);
        session.bootstrap().await;

        let snapshot = session.snapshot();
        assert_eq!(snapshot, SessionSnapshot::default());
        assert!(session.is_bootstrapped());
    }

    #[test_timeout::tokio_timeout_test]
    async fn wait_until_ready_returns_after_bootstrap() {
        let renewer = ScriptedRenewer::new(Ok(identity(true)), false);
        let session = session_with(renewer.clone());

        let waiter = tokio::spawn({
            let session = session.clone();
            async move { session.wait_until_ready(Duration::from_secs(5)).await }
        });
        let boot = tokio::spawn({
            let session = session.clone();
            async move { session.bootstrap().await }
        });
        renewer.gate.add_permits(1);
        boot.await.unwrap();

        let snapshot = waiter.await.unwrap();
        assert!(snapshot.is_authenticated());
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn wait_until_ready_times_out_as_unauthenticated() {
        let renewer = ScriptedRenewer::new(Ok(identity(true)), false);
        let session = session_with(renewer);
        let boot = tokio::spawn({
            let session = session.clone();
            async move { session.bootstrap().await }
        });

        let snapshot = session.wait_until_ready(Duration::from_secs(2)).await;
        assert!(!snapshot.is_authenticated());
        boot.abort();
    }

    #[test_timeout::tokio_timeout_test]
    async fn refresh_is_noop_when_unauthenticated() {
        let renewer = ScriptedRenewer::new(Ok(identity(true)), true);
        let session = session_with(renewer.clone());

        assert!(!session.refresh().await);
        assert_eq!(renewer.calls(), 0);
        assert!(!session.snapshot().is_loading());
    }

    #[test_timeout::tokio_timeout_test]
    async fn refresh_adopts_renewed_identity() {
        let renewer = ScriptedRenewer::new(Ok(identity(true)), true);
        let session = session_with(renewer.clone());
        session.set_identity(Some(identity(false)));

        assert!(session.refresh().await);
        let snapshot = session.snapshot();
        assert!(snapshot.is_verified());
        assert!(!snapshot.is_loading());
        assert_eq!(renewer.calls(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn refresh_failure_clears_and_redirects_to_login() {
        let renewer = ScriptedRenewer::new(Ok(identity(true)), true);
        let session = session_with(renewer.clone());
        session.set_identity(Some(identity(true)));
        let mut redirects = session.subscribe_redirects();

        renewer.set_outcome(Err(RenewalError::TimedOut(Duration::from_secs(5))));
        assert!(!session.refresh().await);

        assert_eq!(session.snapshot(), SessionSnapshot::default());
        assert_eq!(redirects.recv().await.unwrap(), AuthRedirect::Login);
    }

    #[test_timeout::tokio_timeout_test]
    async fn unverified_renewal_redirects_to_verification() {
        let renewer = ScriptedRenewer::new(Err(RenewalError::Unverified), true);
        let session = session_with(renewer);
        session.set_identity(Some(identity(false)));
        let mut redirects = session.subscribe_redirects();

        let result = session.renew_credentials().await;

        assert_eq!(result, Err(AuthRedirect::VerifyEmail));
        assert!(!session.snapshot().is_authenticated());
        assert_eq!(redirects.recv().await.unwrap(), AuthRedirect::VerifyEmail);
    }

    #[test_timeout::tokio_timeout_test]
    async fn mark_unverified_clears_once() {
        let session = session_with(ScriptedRenewer::new(Ok(identity(true)), true));
        session.set_identity(Some(identity(false)));
        let mut redirects = session.subscribe_redirects();

        session.mark_unverified();
        session.mark_unverified();

        assert!(!session.snapshot().is_authenticated());
        assert_eq!(redirects.recv().await.unwrap(), AuthRedirect::VerifyEmail);
        assert!(matches!(
            redirects.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
