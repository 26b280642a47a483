use crate::engine::EngineError;

#[derive(Debug)]
pub enum CoordinatorError {
    /// Malformed or out-of-policy input; nothing was written.
    Validation(String),
    UnknownResource(String),
    /// Live leases reference a resource that no longer resolves.
    StaleLeaseDetected {
        resource_id: String,
        holders: Vec<String>,
    },
    /// Caller's role does not allow the operation.
    NotPermitted(&'static str),
    LimitExceeded(&'static str),
    /// Persistence failed; outcome unknown.
    Store(String),
}

impl CoordinatorError {
    /// Failures worth retrying on the next tick rather than surfacing at once.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoordinatorError::Store(_))
    }
}

impl std::fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorError::Validation(msg) => write!(f, "validation failed: {msg}"),
            CoordinatorError::UnknownResource(id) => write!(f, "unknown resource: {id}"),
            CoordinatorError::StaleLeaseDetected {
                resource_id,
                holders,
            } => write!(
                f,
                "stale lease on missing resource {resource_id} held by {}",
                holders.join(", ")
            ),
            CoordinatorError::NotPermitted(msg) => write!(f, "not permitted: {msg}"),
            CoordinatorError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            CoordinatorError::Store(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for CoordinatorError {}

impl From<EngineError> for CoordinatorError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotFound(id) => CoordinatorError::UnknownResource(id),
            EngineError::SlotElapsed(slot) => {
                CoordinatorError::Validation(format!("slot {slot} has already ended"))
            }
            EngineError::Invalid(msg) => CoordinatorError::Validation(msg),
            EngineError::LimitExceeded(msg) => CoordinatorError::LimitExceeded(msg),
            EngineError::WalError(msg) => CoordinatorError::Store(msg),
        }
    }
}
