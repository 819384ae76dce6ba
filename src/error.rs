use crate::registry::UnitState;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("invalid unit transition {from:?} -> {to:?}")]
    InvalidTransition { from: UnitState, to: UnitState },
    #[error("donor {donor} is not eligible to donate: {reason}")]
    IneligibleDonor { donor: String, reason: String },
    #[error("record was modified concurrently, reload and retry")]
    ConcurrentModification,
    #[error("trace chain for {subject} broken at seq {seq}")]
    IntegrityViolation { subject: String, seq: u64 },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("codec error: {0}")]
    Codec(String),
}

impl EngineError {
    /// Callers may retry these after re-reading the record they hold.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ConcurrentModification)
    }
}
