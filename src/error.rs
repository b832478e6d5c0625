use serde::{Deserialize, Serialize};

/// A single failed check. Validation always collects every violation
/// before failing, so callers see the whole list at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub field: String,
    pub problem: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, problem: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            problem: problem.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.problem)
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// All errors surfaced by the bus, the state store and the orchestrator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    /// Malformed envelope, registration or state.
    #[error("validation failed: {}", join_violations(.0))]
    Validation(Vec<Violation>),

    /// An operation referenced a component id the bus does not know.
    #[error("component not found: {0}")]
    ComponentNotFound(String),

    /// Static lookup miss (endpoint, event type, error code).
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// No viable transport, or the transport call failed.
    #[error("delivery to {target} failed: {reason}")]
    Delivery { target: String, reason: String },

    /// A state mutation could not acquire its key lock in time.
    #[error("lock timeout on {key} after {waited_ms}ms")]
    LockTimeout { key: String, waited_ms: u64 },

    /// Snapshot or outbox I/O failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("startup failed at stage {stage}: {reason}")]
    Startup { stage: String, reason: String },

    #[error("{0} is shutting down")]
    ShuttingDown(&'static str),
}

impl CoreError {
    pub fn invalid(field: impl Into<String>, problem: impl Into<String>) -> Self {
        CoreError::Validation(vec![Violation::new(field, problem)])
    }

    /// Taxonomy code used in error responses (see `contract::taxonomy`).
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::ComponentNotFound(_) => "COMPONENT_NOT_FOUND",
            CoreError::NotFound { .. } => "NOT_FOUND",
            CoreError::Delivery { .. } => "DELIVERY_FAILED",
            CoreError::LockTimeout { .. } => "LOCK_TIMEOUT",
            CoreError::Persistence(_) => "PERSISTENCE_ERROR",
            CoreError::Startup { .. } => "STARTUP_FAILED",
            CoreError::ShuttingDown(_) => "SHUTTING_DOWN",
        }
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            CoreError::Validation(v) => v,
            _ => &[],
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Persistence(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Persistence(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
