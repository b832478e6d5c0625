//! Envelope wire model.
//!
//! The wire shape keeps `type` and `payload` as sibling fields; in memory the
//! payload is a tagged union keyed by that `type`, so consumers match on
//! [`Payload`] instead of poking at untyped JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

/// Recipient id addressing every registered component.
pub const BROADCAST: &str = "broadcast";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Standard,
    Command,
    Event,
    State,
    Register,
}

impl MessageKind {
    pub const ALL: [MessageKind; 5] = [
        MessageKind::Standard,
        MessageKind::Command,
        MessageKind::Event,
        MessageKind::State,
        MessageKind::Register,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Standard => "standard",
            MessageKind::Command => "command",
            MessageKind::Event => "event",
            MessageKind::State => "state",
            MessageKind::Register => "register",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub const NAMES: [&'static str; 4] = ["low", "normal", "high", "critical"];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateOp {
    Update,
    Sync,
    Query,
}

impl StateOp {
    pub const NAMES: [&'static str; 3] = ["update", "sync", "query"];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatePayload {
    pub state_type: StateOp,
    #[serde(default)]
    pub state_data: Value,
    #[serde(default)]
    pub version: u64,
}

/// Payload of a `register` envelope.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Registration {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_endpoint(mut self, transport: impl Into<String>, address: impl Into<String>) -> Self {
        self.endpoints.insert(transport.into(), address.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Standard(Value),
    Command(CommandPayload),
    Event(EventPayload),
    State(StatePayload),
    Register(Registration),
}

impl Payload {
    pub fn event(event: impl Into<String>, data: Value) -> Self {
        Payload::Event(EventPayload {
            event: event.into(),
            data,
        })
    }

    pub fn command(command: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Payload::Command(CommandPayload {
            command: command.into(),
            parameters,
        })
    }

    pub fn state(state_type: StateOp, state_data: Value, version: u64) -> Self {
        Payload::State(StatePayload {
            state_type,
            state_data,
            version,
        })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Standard(_) => MessageKind::Standard,
            Payload::Command(_) => MessageKind::Command,
            Payload::Event(_) => MessageKind::Event,
            Payload::State(_) => MessageKind::State,
            Payload::Register(_) => MessageKind::Register,
        }
    }

    pub fn to_value(&self) -> Value {
        let encoded = match self {
            Payload::Standard(v) => return v.clone(),
            Payload::Command(p) => serde_json::to_value(p),
            Payload::Event(p) => serde_json::to_value(p),
            Payload::State(p) => serde_json::to_value(p),
            Payload::Register(p) => serde_json::to_value(p),
        };
        encoded.unwrap_or_default()
    }

    pub fn from_parts(kind: MessageKind, value: Value) -> CoreResult<Self> {
        fn decode<T: serde::de::DeserializeOwned>(value: Value) -> CoreResult<T> {
            serde_json::from_value(value).map_err(|e| CoreError::invalid("payload", e.to_string()))
        }
        Ok(match kind {
            MessageKind::Standard => Payload::Standard(value),
            MessageKind::Command => Payload::Command(decode(value)?),
            MessageKind::Event => Payload::Event(decode(value)?),
            MessageKind::State => Payload::State(decode(value)?),
            MessageKind::Register => Payload::Register(decode(value)?),
        })
    }

    /// Event name when this is an event payload.
    pub fn event_name(&self) -> Option<&str> {
        match self {
            Payload::Event(p) => Some(&p.event),
            _ => None,
        }
    }
}

/// Immutable message wrapper exchanged between components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct Envelope {
    pub id: String,
    pub from: String,
    pub to: String,
    /// Application message name, e.g. `market-data`.
    pub topic: Option<String>,
    pub payload: Payload,
    /// Epoch milliseconds at creation.
    pub timestamp: i64,
    /// Milliseconds after `timestamp` past which delivery is abandoned.
    pub ttl: Option<u64>,
    pub priority: Priority,
    pub correlation_id: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

impl Envelope {
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST
    }

    pub fn expires_at(&self) -> Option<i64> {
        self.ttl
            .map(|ttl| self.timestamp.saturating_add(ttl.min(i64::MAX as u64) as i64))
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at().map(|at| now_ms >= at).unwrap_or(false)
    }

    /// Time left before expiry; `None` when the envelope never expires.
    pub fn remaining(&self, now_ms: i64) -> Option<Duration> {
        self.expires_at()
            .map(|at| Duration::from_millis(at.saturating_sub(now_ms).max(0) as u64))
    }

    /// Standard payload body, if any.
    pub fn data(&self) -> Option<&Value> {
        match &self.payload {
            Payload::Standard(v) => Some(v),
            _ => None,
        }
    }

    /// Same envelope addressed to a single recipient. Broadcast fan-out
    /// keeps the id so recipients can correlate copies.
    pub fn addressed_to(&self, target: &str) -> Envelope {
        Envelope {
            to: target.to_string(),
            ..self.clone()
        }
    }

    /// Validate a raw frame and decode it.
    pub fn parse(raw: &Value) -> CoreResult<Envelope> {
        super::validate::validate_frame(raw)?;
        serde_json::from_value(raw.clone()).map_err(|e| CoreError::invalid("envelope", e.to_string()))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    #[serde(default)]
    id: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    topic: Option<String>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ttl: Option<u64>,
    #[serde(default)]
    priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<Map<String, Value>>,
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = CoreError;

    fn try_from(w: WireEnvelope) -> Result<Self, Self::Error> {
        Ok(Envelope {
            payload: Payload::from_parts(w.kind, w.payload)?,
            id: w.id,
            from: w.from,
            to: w.to,
            topic: w.topic,
            timestamp: w.timestamp,
            ttl: w.ttl,
            priority: w.priority,
            correlation_id: w.correlation_id,
            metadata: w.metadata,
        })
    }
}

impl From<Envelope> for WireEnvelope {
    fn from(e: Envelope) -> Self {
        WireEnvelope {
            kind: e.payload.kind(),
            payload: e.payload.to_value(),
            id: e.id,
            from: e.from,
            to: e.to,
            topic: e.topic,
            timestamp: e.timestamp,
            ttl: e.ttl,
            priority: e.priority,
            correlation_id: e.correlation_id,
            metadata: e.metadata,
        }
    }
}
