use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{InboundMessage, OutboundMessage, parse_inbound};
use super::socket::{Connector, SocketEvent, SocketLink, TransportError};
use super::{ConnectionState, DomainEvent, RealtimeConfig};
use crate::session::SessionState;

/// Linear backoff: attempt `k` waits `base_delay * k`, up to `max_attempts`
/// consecutive attempts. A successful open resets the count.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    attempt_count: u32,
    base_delay: Duration,
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            attempt_count: 0,
            base_delay,
            max_attempts,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Claims the next attempt and returns its delay, or `None` once the
    /// attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt_count >= self.max_attempts {
            return None;
        }
        self.attempt_count += 1;
        Some(self.delay_for(self.attempt_count))
    }

    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }
}

pub(crate) enum Event {
    Connect,
    Disconnect,
    Shutdown,
    Authentication(bool),
    Opened {
        id: u64,
        result: Result<SocketLink, TransportError>,
    },
    Socket {
        link: u64,
        event: SocketEvent,
    },
    ReconnectDue {
        timer: u64,
    },
    RefreshFinished {
        renewed: bool,
    },
}

/// A spawned task the machine may cancel; `id` recognises stale results.
struct Pending {
    id: u64,
    handle: JoinHandle<()>,
}

struct ActiveLink {
    id: u64,
    outbound: mpsc::UnboundedSender<String>,
    pump: JoinHandle<()>,
}

pub(crate) struct Machine {
    config: RealtimeConfig,
    connector: Arc<dyn Connector>,
    session: SessionState,
    events: mpsc::WeakUnboundedSender<Event>,
    state: watch::Sender<ConnectionState>,
    messages: broadcast::Sender<DomainEvent>,
    policy: ReconnectPolicy,
    next_id: u64,
    opening: Option<Pending>,
    link: Option<ActiveLink>,
    reconnect: Option<Pending>,
    watcher: Option<JoinHandle<()>>,
    refreshing: bool,
    authenticated: bool,
}

impl Machine {
    pub(crate) fn new(
        config: RealtimeConfig,
        connector: Arc<dyn Connector>,
        session: SessionState,
        events: mpsc::WeakUnboundedSender<Event>,
        state: watch::Sender<ConnectionState>,
        messages: broadcast::Sender<DomainEvent>,
    ) -> Self {
        let policy = ReconnectPolicy::new(config.reconnect_base_delay, config.max_reconnect_attempts);
        Self {
            config,
            connector,
            session,
            events,
            state,
            messages,
            policy,
            next_id: 0,
            opening: None,
            link: None,
            reconnect: None,
            watcher: None,
            refreshing: false,
            authenticated: false,
        }
    }

    pub(crate) async fn run(mut self, mut queue: mpsc::UnboundedReceiver<Event>) {
        self.watcher = Some(self.watch_session());
        while let Some(event) = queue.recv().await {
            if !self.handle(event) {
                break;
            }
        }
        self.close(None);
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        debug!(target = "booking.realtime", "transport task stopped");
    }

    /// Returns false once the machine should stop.
    fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Connect => {
                // Only an idle machine gets a fresh budget; a pending retry
                // keeps counting toward the limit.
                if self.reconnect.is_none() && *self.state.borrow() == ConnectionState::Disconnected {
                    self.policy.reset();
                }
                self.connect();
            }
            Event::Disconnect => self.close(None),
            Event::Shutdown => return false,
            Event::Authentication(authenticated) => self.on_authentication(authenticated),
            Event::Opened { id, result } => self.on_opened(id, result),
            Event::Socket { link, event } => self.on_socket(link, event),
            Event::ReconnectDue { timer } => self.on_reconnect_due(timer),
            Event::RefreshFinished { renewed } => {
                debug!(target = "booking.realtime", renewed, "token refresh finished; cycling socket");
                self.refreshing = false;
                self.close(Some(self.config.token_refresh_reconnect_delay));
            }
        }
        true
    }

    fn on_authentication(&mut self, authenticated: bool) {
        if authenticated == self.authenticated {
            return;
        }
        self.authenticated = authenticated;
        if authenticated {
            info!(target = "booking.realtime", "session authenticated; connecting");
            self.policy.reset();
            self.connect();
        } else {
            info!(target = "booking.realtime", "session ended; disconnecting");
            self.close(None);
        }
    }

    fn connect(&mut self) {
        if !self.authenticated {
            debug!(target = "booking.realtime", "connect ignored; not authenticated");
            return;
        }
        if self.opening.is_some() || self.link.is_some() {
            let state = *self.state.borrow();
            debug!(target = "booking.realtime", %state, "connect ignored; socket already live");
            return;
        }
        self.cancel_reconnect();
        self.open();
    }

    fn open(&mut self) {
        let id = self.allocate_id();
        self.set_state(ConnectionState::Connecting);
        let connector = self.connector.clone();
        let url = self.config.url.clone();
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            let result = connector.connect(&url).await;
            if let Some(events) = events.upgrade() {
                let _ = events.send(Event::Opened { id, result });
            }
        });
        self.opening = Some(Pending { id, handle });
    }

    fn on_opened(&mut self, id: u64, result: Result<SocketLink, TransportError>) {
        if self.opening.as_ref().map(|pending| pending.id) != Some(id) {
            debug!(target = "booking.realtime", id, "discarding stale open result");
            return;
        }
        self.opening = None;

        match result {
            Ok(link) => {
                info!(target = "booking.realtime", url = %self.config.url, "realtime connected");
                self.policy.reset();
                self.attach(id, link);
                self.set_state(ConnectionState::Connected);
            }
            Err(err) => {
                warn!(target = "booking.realtime", error = %err, "realtime connect failed");
                self.set_state(ConnectionState::Error);
                self.schedule_reconnect();
            }
        }
    }

    fn attach(&mut self, id: u64, link: SocketLink) {
        let SocketLink {
            outbound,
            mut inbound,
        } = link;
        let events = self.events.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                let Some(sender) = events.upgrade() else {
                    return;
                };
                if sender.send(Event::Socket { link: id, event }).is_err() {
                    return;
                }
            }
            if let Some(sender) = events.upgrade() {
                let _ = sender.send(Event::Socket {
                    link: id,
                    event: SocketEvent::Closed {
                        code: None,
                        reason: None,
                    },
                });
            }
        });
        self.link = Some(ActiveLink { id, outbound, pump });
    }

    fn on_socket(&mut self, link: u64, event: SocketEvent) {
        if self.link.as_ref().map(|active| active.id) != Some(link) {
            return;
        }
        match event {
            SocketEvent::Message(text) => self.on_frame(&text),
            SocketEvent::Closed { code, reason } => {
                info!(
                    target = "booking.realtime",
                    code = code.unwrap_or_default(),
                    reason = reason.as_deref().unwrap_or(""),
                    "realtime socket closed"
                );
                self.detach();
                self.schedule_reconnect();
            }
            SocketEvent::Error(err) => {
                warn!(target = "booking.realtime", error = %err, "realtime socket error");
                self.detach();
                self.set_state(ConnectionState::Error);
                self.schedule_reconnect();
            }
        }
    }

    fn on_frame(&mut self, text: &str) {
        let message = match parse_inbound(text) {
            Ok(message) => message,
            Err(err) => {
                debug!(target = "booking.realtime", error = %err, "ignoring inbound frame");
                return;
            }
        };

        match message {
            InboundMessage::Domain(event) => {
                let ack = event.ack();
                debug!(target = "booking.realtime", kind = ?event.kind, "domain event");
                let _ = self.messages.send(event);
                if let Some(ack) = ack {
                    self.send(&ack);
                }
            }
            InboundMessage::Ping { timestamp } => {
                self.send(&OutboundMessage::Pong { timestamp });
            }
            InboundMessage::TokenRefreshRequired => self.on_token_refresh_required(),
            InboundMessage::IdleTimeout { message } => {
                info!(
                    target = "booking.realtime",
                    message = message.as_deref().unwrap_or(""),
                    "server reports idle timeout"
                );
            }
            InboundMessage::ServerShutdown { reconnect_in } => {
                let delay = reconnect_in
                    .map(Duration::from_secs)
                    .unwrap_or(self.config.shutdown_reconnect_default);
                info!(
                    target = "booking.realtime",
                    delay_ms = delay.as_millis() as u64,
                    "server shutting down; reconnecting later"
                );
                self.close(Some(delay));
            }
        }
    }

    fn on_token_refresh_required(&mut self) {
        if self.refreshing {
            debug!(target = "booking.realtime", "token refresh already running");
            return;
        }
        self.refreshing = true;
        info!(target = "booking.realtime", "server requested token refresh");
        let session = self.session.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let renewed = session.refresh().await;
            if let Some(events) = events.upgrade() {
                let _ = events.send(Event::RefreshFinished { renewed });
            }
        });
    }

    /// Best effort; a failed write surfaces later as a socket close.
    fn send(&self, message: &OutboundMessage) {
        let Some(link) = &self.link else {
            return;
        };
        match message.encode() {
            Ok(frame) => {
                let _ = link.outbound.send(frame);
            }
            Err(err) => warn!(target = "booking.realtime", error = %err, "failed to encode frame"),
        }
    }

    fn detach(&mut self) {
        if let Some(link) = self.link.take() {
            link.pump.abort();
        }
    }

    /// Manual disconnect. With `reconnect_after`, a single planned reconnect
    /// is armed that bypasses the backoff counter.
    fn close(&mut self, reconnect_after: Option<Duration>) {
        self.cancel_reconnect();
        if let Some(opening) = self.opening.take() {
            opening.handle.abort();
        }
        self.detach();
        self.policy.reset();
        self.set_state(ConnectionState::Disconnected);
        if let Some(delay) = reconnect_after {
            self.arm_reconnect(delay);
        }
    }

    fn schedule_reconnect(&mut self) {
        match self.policy.next_delay() {
            Some(delay) => {
                info!(
                    target = "booking.realtime",
                    attempt = self.policy.attempt_count(),
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                self.set_state(ConnectionState::Reconnecting);
                self.arm_reconnect(delay);
            }
            None => {
                warn!(
                    target = "booking.realtime",
                    attempts = self.policy.attempt_count(),
                    "reconnect attempts exhausted"
                );
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    fn arm_reconnect(&mut self, delay: Duration) {
        self.cancel_reconnect();
        let id = self.allocate_id();
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(events) = events.upgrade() {
                let _ = events.send(Event::ReconnectDue { timer: id });
            }
        });
        self.reconnect = Some(Pending { id, handle });
    }

    fn cancel_reconnect(&mut self) {
        if let Some(pending) = self.reconnect.take() {
            pending.handle.abort();
        }
    }

    fn on_reconnect_due(&mut self, timer: u64) {
        if self.reconnect.as_ref().map(|pending| pending.id) != Some(timer) {
            return;
        }
        self.reconnect = None;
        if !self.authenticated {
            debug!(target = "booking.realtime", "reconnect skipped; not authenticated");
            self.set_state(ConnectionState::Disconnected);
            return;
        }
        if self.opening.is_none() && self.link.is_none() {
            self.open();
        }
    }

    fn watch_session(&self) -> JoinHandle<()> {
        let mut snapshots = self.session.subscribe();
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut last = None;
            loop {
                let authenticated = snapshots.borrow_and_update().is_authenticated();
                if last != Some(authenticated) {
                    last = Some(authenticated);
                    let Some(sender) = events.upgrade() else {
                        return;
                    };
                    if sender.send(Event::Authentication(authenticated)).is_err() {
                        return;
                    }
                }
                if snapshots.changed().await.is_err() {
                    return;
                }
            }
        })
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(target = "booking.realtime", from = %current, to = %next, "connection state");
            *current = next;
            true
        });
    }
}
