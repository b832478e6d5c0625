//! Contract registry: envelope shapes, validation, taxonomy and pure
//! constructors. Stateless.

pub mod envelope;
pub mod schema;
pub mod taxonomy;
pub mod validate;

use serde_json::{json, Map, Value};

pub use envelope::{
    CommandPayload, Envelope, EventPayload, MessageKind, Payload, Priority, Registration, StateOp,
    StatePayload, BROADCAST,
};
pub use schema::{validate_state_against_schema, FieldKind, FieldRule, StateSchema};
pub use taxonomy::{describe_error, describe_event, lookup_endpoint, Category};
pub use validate::{is_valid_id, validate_envelope, validate_frame, validate_registration};

use crate::error::CoreResult;

/// Optional envelope header fields.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeOptions {
    pub topic: Option<String>,
    pub ttl: Option<u64>,
    pub priority: Priority,
    pub correlation_id: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

impl EnvelopeOptions {
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl = Some(ttl_ms);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn build_envelope(from: &str, to: &str, payload: Payload, options: EnvelopeOptions) -> Envelope {
    Envelope {
        id: new_id(),
        from: from.to_string(),
        to: to.to_string(),
        topic: options.topic,
        payload,
        timestamp: crate::now_ms(),
        ttl: options.ttl,
        priority: options.priority,
        correlation_id: options.correlation_id,
        metadata: options.metadata,
    }
}

/// Validate an envelope built in-process exactly as a wire frame would be.
pub fn check_envelope(envelope: &Envelope) -> CoreResult<()> {
    validate_envelope(&envelope.to_value(), envelope.kind())
}

pub fn build_error_response(code: &str, details: Value) -> Value {
    let (message, category, retryable) = match describe_error(code) {
        Ok(known) => (known.message, known.category, known.retryable),
        Err(_) => ("Unknown error", Category::General, false),
    };
    json!({
        "success": false,
        "error": {
            "code": code,
            "message": message,
            "category": category,
            "retryable": retryable,
            "details": details,
        },
        "timestamp": crate::now_ms(),
    })
}

pub fn build_success_response(data: Value, metadata: Option<Map<String, Value>>) -> Value {
    let mut body = json!({
        "success": true,
        "data": data,
        "timestamp": crate::now_ms(),
    });
    if let (Some(meta), Some(obj)) = (metadata, body.as_object_mut()) {
        obj.insert("metadata".to_string(), Value::Object(meta));
    }
    body
}

/// Error response for a `CoreError`, carrying violations when there are any.
pub fn error_response_for(err: &crate::error::CoreError) -> Value {
    let details = if err.violations().is_empty() {
        json!({ "reason": err.to_string() })
    } else {
        json!({ "reason": err.to_string(), "violations": err.violations() })
    };
    build_error_response(err.code(), details)
}
