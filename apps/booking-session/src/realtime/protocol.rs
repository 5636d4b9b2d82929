//! Wire vocabulary of the notification socket.
//!
//! Every frame is a JSON object with a `type` discriminator. Inbound frames
//! are decoded into [`InboundMessage`], a closed set the transport matches
//! exhaustively; `PONG` and `ACK` only ever travel client to server.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    AppointmentCreated,
    AppointmentUpdated,
    AppointmentConfirmed,
    AppointmentCancelled,
    AppointmentReminder,
    AvailabilityChanged,
    RescheduleRequested,
    RescheduleApproved,
    RescheduleRejected,
    Ping,
    Pong,
    Ack,
    TokenRefreshRequired,
    IdleTimeout,
    ServerShutdown,
}

/// Opaque timestamp; echoed back exactly as received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Millis(i64),
    Float(f64),
    Text(String),
}

/// Identifiers arrive as numbers from some producers and strings from others.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireId {
    Number(i64),
    Text(String),
}

impl std::fmt::Display for WireId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireId::Number(value) => write!(f, "{value}"),
            WireId::Text(value) => f.write_str(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(default)]
    appointment_id: Option<WireId>,
    #[serde(default)]
    reschedule_request_id: Option<WireId>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    timestamp: Option<Timestamp>,
    #[serde(default, deserialize_with = "lenient_seconds")]
    reconnect_in_seconds: Option<u64>,
}

/// Whole seconds from an integer, a float (rounded up) or a numeric string.
/// Anything else reads as absent so the caller falls back to its default.
fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    let seconds = match value {
        Some(Value::Number(number)) => number.as_u64().or_else(|| number.as_f64().and_then(whole_seconds)),
        Some(Value::String(text)) => {
            let text = text.trim();
            text.parse::<u64>()
                .ok()
                .or_else(|| text.parse::<f64>().ok().and_then(whole_seconds))
        }
        _ => None,
    };
    Ok(seconds)
}

fn whole_seconds(value: f64) -> Option<u64> {
    (value.is_finite() && value >= 0.0 && value <= u64::MAX as f64).then(|| value.ceil() as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainEventKind {
    AppointmentCreated,
    AppointmentUpdated,
    AppointmentConfirmed,
    AppointmentCancelled,
    AppointmentReminder,
    AvailabilityChanged,
    RescheduleRequested,
    RescheduleApproved,
    RescheduleRejected,
}

/// A business notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub kind: DomainEventKind,
    pub appointment_id: Option<WireId>,
    pub reschedule_request_id: Option<WireId>,
    pub title: Option<String>,
    pub message: Option<String>,
    pub data: Option<Value>,
    pub timestamp: Option<Timestamp>,
}

impl DomainEvent {
    /// The acknowledgement owed for this event, if it carries anything to
    /// correlate with.
    pub fn ack(&self) -> Option<OutboundMessage> {
        if self.appointment_id.is_none() && self.reschedule_request_id.is_none() {
            return None;
        }
        Some(OutboundMessage::Ack {
            appointment_id: self.appointment_id.clone(),
            reschedule_request_id: self.reschedule_request_id.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Domain(DomainEvent),
    Ping { timestamp: Option<Timestamp> },
    TokenRefreshRequired,
    IdleTimeout { message: Option<String> },
    ServerShutdown { reconnect_in: Option<u64> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundMessage {
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<Timestamp>,
    },
    #[serde(rename_all = "camelCase")]
    Ack {
        #[serde(skip_serializing_if = "Option::is_none")]
        appointment_id: Option<WireId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reschedule_request_id: Option<WireId>,
    },
}

impl OutboundMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("unexpected client-only message {0:?} received from server")]
    ClientOnly(MessageKind),
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}

impl TryFrom<Envelope> for InboundMessage {
    type Error = ProtocolError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let domain = |kind| {
            InboundMessage::Domain(DomainEvent {
                kind,
                appointment_id: envelope.appointment_id.clone(),
                reschedule_request_id: envelope.reschedule_request_id.clone(),
                title: envelope.title.clone(),
                message: envelope.message.clone(),
                data: envelope.data.clone(),
                timestamp: envelope.timestamp.clone(),
            })
        };
        let message = match envelope.kind {
            MessageKind::AppointmentCreated => domain(DomainEventKind::AppointmentCreated),
            MessageKind::AppointmentUpdated => domain(DomainEventKind::AppointmentUpdated),
            MessageKind::AppointmentConfirmed => domain(DomainEventKind::AppointmentConfirmed),
            MessageKind::AppointmentCancelled => domain(DomainEventKind::AppointmentCancelled),
            MessageKind::AppointmentReminder => domain(DomainEventKind::AppointmentReminder),
            MessageKind::AvailabilityChanged => domain(DomainEventKind::AvailabilityChanged),
            MessageKind::RescheduleRequested => domain(DomainEventKind::RescheduleRequested),
            MessageKind::RescheduleApproved => domain(DomainEventKind::RescheduleApproved),
            MessageKind::RescheduleRejected => domain(DomainEventKind::RescheduleRejected),
            MessageKind::Ping => InboundMessage::Ping {
                timestamp: envelope.timestamp.clone(),
            },
            MessageKind::TokenRefreshRequired => InboundMessage::TokenRefreshRequired,
            MessageKind::IdleTimeout => InboundMessage::IdleTimeout {
                message: envelope.message.clone(),
            },
            MessageKind::ServerShutdown => InboundMessage::ServerShutdown {
                reconnect_in: envelope.reconnect_in_seconds,
            },
            kind @ (MessageKind::Pong | MessageKind::Ack) => {
                return Err(ProtocolError::ClientOnly(kind));
            }
        };
        Ok(message)
    }
}

pub fn parse_inbound(text: &str) -> Result<InboundMessage, ProtocolError> {
    let envelope: Envelope = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
    InboundMessage::try_from(envelope)
}
