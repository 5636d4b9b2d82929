//! Realtime notification channel.
//!
//! A single task owns the socket, the connection state and every pending
//! timer. [`RealtimeTransport`] is a cheap handle that feeds commands into
//! that task and exposes its state and the domain events it delivers.

mod machine;
pub mod protocol;
pub mod socket;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use url::Url;

use crate::session::SessionState;

pub use machine::ReconnectPolicy;
pub use protocol::{DomainEvent, DomainEventKind, InboundMessage, OutboundMessage, WireId};
pub use socket::{Connector, SocketEvent, SocketLink, TransportError, TungsteniteConnector};

use machine::{Event, Machine};

pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_TOKEN_REFRESH_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_SHUTDOWN_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub url: Url,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub token_refresh_reconnect_delay: Duration,
    /// Used when `SERVER_SHUTDOWN` carries no `reconnectInSeconds`.
    pub shutdown_reconnect_default: Duration,
}

impl RealtimeConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            reconnect_base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            token_refresh_reconnect_delay: DEFAULT_TOKEN_REFRESH_RECONNECT_DELAY,
            shutdown_reconnect_default: DEFAULT_SHUTDOWN_RECONNECT_DELAY,
        }
    }
}

#[derive(Clone)]
pub struct RealtimeTransport {
    events: mpsc::UnboundedSender<Event>,
    state: watch::Receiver<ConnectionState>,
    messages: broadcast::Sender<DomainEvent>,
}

impl RealtimeTransport {
    /// Starts the transport task. It follows the session: it connects once the
    /// session is authenticated and disconnects when it is cleared.
    pub fn spawn(
        config: RealtimeConfig,
        connector: Arc<dyn Connector>,
        session: SessionState,
    ) -> Self {
        let (events, queue) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (messages, _) = broadcast::channel(64);

        let machine = Machine::new(
            config,
            connector,
            session,
            events.downgrade(),
            state_tx,
            messages.clone(),
        );
        tokio::spawn(machine.run(queue));

        Self {
            events,
            state,
            messages,
        }
    }

    pub fn connect(&self) {
        let _ = self.events.send(Event::Connect);
    }

    pub fn disconnect(&self) {
        let _ = self.events.send(Event::Disconnect);
    }

    /// Closes the socket, cancels pending timers and stops the task.
    pub fn shutdown(&self) {
        let _ = self.events.send(Event::Shutdown);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<DomainEvent> {
        self.messages.subscribe()
    }
}
