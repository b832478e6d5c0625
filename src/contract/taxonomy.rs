//! Static vocabulary: event names, error codes and service endpoints.

use serde::Serialize;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    General,
    Communication,
    Trading,
    Analysis,
}

pub mod events {
    pub const COMPONENT_REGISTERED: &str = "component-registered";
    pub const COMPONENT_UNREGISTERED: &str = "component-unregistered";
    pub const COMPONENT_JOINED: &str = "component-joined";
    pub const COMPONENT_LEFT: &str = "component-left";
    pub const COMPONENT_STATUS_CHANGED: &str = "component-status-changed";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const STATE_CHANGED: &str = "state-changed";
    pub const STATE_SYNC: &str = "state-sync";
    pub const MESSAGE_QUEUED: &str = "message-queued";
    pub const MESSAGE_DROPPED: &str = "message-dropped";
    pub const SYSTEM_READY: &str = "system-ready";
    pub const SYSTEM_SHUTDOWN: &str = "system-shutdown";
    pub const REGISTER_ACK: &str = "register-ack";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EventSpec {
    pub name: &'static str,
    pub category: Category,
    pub description: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorSpec {
    pub code: &'static str,
    pub category: Category,
    pub message: &'static str,
    pub retryable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EndpointSpec {
    pub service: &'static str,
    pub name: &'static str,
    pub method: &'static str,
    pub path: &'static str,
}

macro_rules! event {
    ($name:expr, $cat:ident, $desc:expr) => {
        EventSpec {
            name: $name,
            category: Category::$cat,
            description: $desc,
        }
    };
}

macro_rules! error_code {
    ($code:expr, $cat:ident, $msg:expr, $retry:expr) => {
        ErrorSpec {
            code: $code,
            category: Category::$cat,
            message: $msg,
            retryable: $retry,
        }
    };
}

pub static EVENTS: &[EventSpec] = &[
    event!(events::COMPONENT_REGISTERED, Communication, "A component completed registration"),
    event!(events::COMPONENT_UNREGISTERED, Communication, "A component was removed from the registry"),
    event!(events::COMPONENT_JOINED, Communication, "Broadcast to peers when a component registers"),
    event!(events::COMPONENT_LEFT, Communication, "Broadcast to peers when a component unregisters"),
    event!(events::COMPONENT_STATUS_CHANGED, Communication, "A component changed lifecycle status"),
    event!(events::HEARTBEAT, Communication, "Periodic liveness beacon carrying bus metrics"),
    event!(events::STATE_CHANGED, General, "A component's state was committed"),
    event!(events::STATE_SYNC, General, "Full state pushed to its owner"),
    event!(events::MESSAGE_QUEUED, Communication, "An envelope was queued for later delivery"),
    event!(events::MESSAGE_DROPPED, Communication, "An envelope expired or exhausted its retries"),
    event!(events::SYSTEM_READY, General, "The orchestrator finished startup"),
    event!(events::SYSTEM_SHUTDOWN, General, "The orchestrator is shutting down"),
    event!(events::REGISTER_ACK, Communication, "Registration accepted; carries the assigned id"),
    event!("market-data", Trading, "Price or order-book update for a symbol"),
    event!("order-placed", Trading, "An order was submitted to an exchange"),
    event!("order-filled", Trading, "An order was fully or partially filled"),
    event!("order-cancelled", Trading, "An order was cancelled"),
    event!("position-opened", Trading, "A position was opened"),
    event!("position-closed", Trading, "A position was closed"),
    event!("balance-updated", Trading, "Account balance changed"),
    event!("signal-generated", Analysis, "An analysis engine produced a trading signal"),
    event!("analysis-complete", Analysis, "An analysis run finished"),
    event!("alert-triggered", Analysis, "A monitored condition crossed its threshold"),
];

pub static ERRORS: &[ErrorSpec] = &[
    error_code!("INTERNAL_ERROR", General, "Unexpected internal failure", true),
    error_code!("VALIDATION_ERROR", General, "Input failed contract validation", false),
    error_code!("NOT_FOUND", General, "Requested resource does not exist", false),
    error_code!("TIMEOUT", General, "Operation did not complete in time", true),
    error_code!("PERSISTENCE_ERROR", General, "Snapshot or queue storage failed", true),
    error_code!("STARTUP_FAILED", General, "Subsystem failed to start", false),
    error_code!("SHUTTING_DOWN", General, "Service is draining and refuses new work", true),
    error_code!("COMPONENT_NOT_FOUND", Communication, "Referenced component is not registered", false),
    error_code!("DELIVERY_FAILED", Communication, "No transport could deliver the message", true),
    error_code!("MESSAGE_EXPIRED", Communication, "Message ttl elapsed before delivery", false),
    error_code!("CONNECTION_CLOSED", Communication, "Peer connection closed", true),
    error_code!("LOCK_TIMEOUT", Communication, "State lock could not be acquired in time", true),
    error_code!("INSUFFICIENT_BALANCE", Trading, "Account balance too low for the order", false),
    error_code!("ORDER_REJECTED", Trading, "Exchange rejected the order", false),
    error_code!("INVALID_SYMBOL", Trading, "Unknown or unsupported trading symbol", false),
    error_code!("RISK_LIMIT_EXCEEDED", Trading, "Order would breach a risk limit", false),
    error_code!("ANALYSIS_FAILED", Analysis, "Analysis run failed", true),
    error_code!("INSUFFICIENT_DATA", Analysis, "Not enough data points for the analysis", true),
    error_code!("MODEL_UNAVAILABLE", Analysis, "Scoring model is not loaded", true),
];

pub static ENDPOINTS: &[EndpointSpec] = &[
    EndpointSpec { service: "bus", name: "connect", method: "GET", path: "/" },
    EndpointSpec { service: "gateway", name: "health", method: "GET", path: "/health" },
    EndpointSpec { service: "gateway", name: "metrics", method: "GET", path: "/metrics" },
    EndpointSpec { service: "gateway", name: "global-state", method: "GET", path: "/state" },
    EndpointSpec { service: "gateway", name: "component-state", method: "GET", path: "/state/{id}" },
    EndpointSpec { service: "gateway", name: "components", method: "GET", path: "/components" },
    EndpointSpec { service: "gateway", name: "register", method: "POST", path: "/register" },
    EndpointSpec { service: "gateway", name: "message", method: "POST", path: "/message" },
    EndpointSpec { service: "gateway", name: "state-update", method: "POST", path: "/state/{id}" },
    EndpointSpec { service: "gateway", name: "heartbeat", method: "POST", path: "/heartbeat/{id}" },
];

pub fn describe_event(event_type: &str) -> CoreResult<&'static EventSpec> {
    EVENTS
        .iter()
        .find(|e| e.name == event_type)
        .ok_or_else(|| CoreError::NotFound {
            kind: "event",
            name: event_type.to_string(),
        })
}

pub fn describe_error(code: &str) -> CoreResult<&'static ErrorSpec> {
    ERRORS
        .iter()
        .find(|e| e.code == code)
        .ok_or_else(|| CoreError::NotFound {
            kind: "error code",
            name: code.to_string(),
        })
}

pub fn lookup_endpoint(service: &str, endpoint_name: &str) -> CoreResult<&'static EndpointSpec> {
    ENDPOINTS
        .iter()
        .find(|e| e.service == service && e.name == endpoint_name)
        .ok_or_else(|| CoreError::NotFound {
            kind: "endpoint",
            name: format!("{}/{}", service, endpoint_name),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_core_error_code_is_in_taxonomy() {
        let errs = [
            CoreError::Validation(vec![]),
            CoreError::ComponentNotFound("x".into()),
            CoreError::NotFound { kind: "event", name: "x".into() },
            CoreError::Delivery { target: "x".into(), reason: "y".into() },
            CoreError::LockTimeout { key: "x".into(), waited_ms: 1 },
            CoreError::Persistence("x".into()),
            CoreError::Startup { stage: "bus".into(), reason: "y".into() },
            CoreError::ShuttingDown("bus"),
        ];
        for e in errs {
            assert!(describe_error(e.code()).is_ok(), "{} missing", e.code());
        }
    }

    #[test]
    fn test_describe_event() {
        let event = describe_event("order-filled").unwrap();
        assert_eq!(event.category, Category::Trading);
        assert!(matches!(describe_event("nope"), Err(CoreError::NotFound { .. })));
    }

    #[test]
    fn test_lookup_endpoint() {
        assert_eq!(lookup_endpoint("gateway", "health").unwrap().path, "/health");
        assert_eq!(lookup_endpoint("gateway", "heartbeat").unwrap().method, "POST");
        let err = lookup_endpoint("gateway", "teleport").unwrap_err();
        assert_eq!(err.to_string(), "endpoint not found: gateway/teleport");
    }
}
