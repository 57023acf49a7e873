use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input, rejected before any I/O. Retry after correcting it.
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    /// Lost the race for this interval; re-fetch availability instead of retrying.
    #[error("SLOT_TAKEN: interval conflicts with {0}")]
    SlotTaken(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    /// Gave up waiting for the staff lock. Nothing was written.
    #[error("lock wait timeout on staff {0}")]
    LockTimeout(Ulid),
    /// WAL append failed. Nothing was applied.
    #[error("store error: {0}")]
    Store(String),
}

impl EngineError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Transient store failures: the whole operation may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::LockTimeout(_) | EngineError::Store(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::SlotTaken(_))
    }

    /// SQLSTATE reported to wire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "22023",
            EngineError::NotFound { .. } => "P0002",
            EngineError::SlotTaken(_) => "23P01",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::LockTimeout(_) => "55P03",
            EngineError::Store(_) => "58030",
        }
    }
}
