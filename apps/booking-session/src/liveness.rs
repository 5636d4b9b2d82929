use std::sync::Arc;

use reqwest::cookie::Jar;
use thiserror::Error;
use tracing::{debug, info};

use crate::auth::{CredentialRefreshCoordinator, HttpRenewer, LOGOUT_PATH};
use crate::config::{ConfigError, LivenessConfig};
use crate::http::{ApiRequest, HttpBackend, HttpError, ReqwestBackend};
use crate::pipeline::RequestPipeline;
use crate::realtime::{Connector, RealtimeTransport, TungsteniteConnector};
use crate::session::{SessionSnapshot, SessionState};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Http(#[from] HttpError),
}

/// Everything that keeps a signed-in client alive, wired in dependency order:
/// backend, renewal, coordinator, session, pipeline, realtime.
pub struct LivenessCore {
    config: LivenessConfig,
    session: SessionState,
    pipeline: RequestPipeline,
    realtime: RealtimeTransport,
}

impl LivenessCore {
    /// Production wiring: reqwest with a shared cookie jar for HTTP, and the
    /// same jar for the websocket upgrade. Must be called inside a tokio
    /// runtime.
    pub fn build(config: LivenessConfig) -> Result<Self, CoreError> {
        let jar = Arc::new(Jar::default());
        let backend = Arc::new(ReqwestBackend::new(config.api_base.clone(), jar.clone())?);
        let connector = Arc::new(TungsteniteConnector::new(Some(jar)));
        Ok(Self::assemble(config, backend, connector))
    }

    pub fn assemble(
        config: LivenessConfig,
        backend: Arc<dyn HttpBackend>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let renewer = Arc::new(HttpRenewer::new(backend.clone()));
        let coordinator = Arc::new(CredentialRefreshCoordinator::new(
            renewer,
            config.renewal_timeout,
        ));
        let session = SessionState::new(coordinator);
        let pipeline = RequestPipeline::new(backend, session.clone());
        let realtime = RealtimeTransport::spawn(config.realtime(), connector, session.clone());
        Self {
            config,
            session,
            pipeline,
            realtime,
        }
    }

    /// Bootstraps the session and waits, bounded, for it to settle. The
    /// realtime channel follows the session on its own.
    pub async fn start(&self) -> SessionSnapshot {
        let session = self.session.clone();
        tokio::spawn(async move { session.bootstrap().await });
        let snapshot = self.session.wait_until_ready(self.config.ready_timeout).await;
        info!(
            target = "booking.core",
            authenticated = snapshot.is_authenticated(),
            verified = snapshot.is_verified(),
            "session ready"
        );
        snapshot
    }

    /// Best-effort server logout, then local teardown. Clearing the session
    /// also closes the realtime channel.
    pub async fn logout(&self) {
        if let Err(err) = self.pipeline.send(ApiRequest::post(LOGOUT_PATH)).await {
            debug!(target = "booking.core", error = %err, "logout request failed; clearing locally");
        }
        self.session.clear();
    }

    pub fn shutdown(&self) {
        self.realtime.shutdown();
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    pub fn realtime(&self) -> &RealtimeTransport {
        &self.realtime
    }
}
