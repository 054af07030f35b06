use ulid::Ulid;

use crate::model::Span;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or out-of-hours request, rejected before any ledger write.
    Validation(&'static str),
    /// The requested interval collides with an existing booking once the
    /// buffer is applied. `blocking` is the buffer-expanded range so the UI
    /// can refresh availability.
    Conflict { blocking: Span },
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Payment callback carried a correlation token the ledger never issued.
    UnknownToken(String),
    /// Payment provider reported failure; the associated hold was cancelled.
    PaymentFailed { reference: String },
    /// The hold deadline passed before the payment callback arrived.
    HoldExpired(Ulid),
    /// Payment-provider call failed before checkout could start.
    Gateway(String),
    /// A status transition the lifecycle does not allow.
    InvalidTransition { from: &'static str },
    LimitExceeded(&'static str),
    /// Transient store failure — no write happened, safe to retry the call.
    Wal(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::Conflict { blocking } => write!(
                f,
                "slot conflicts with an existing booking (blocked [{}, {}))",
                blocking.start, blocking.end
            ),
            EngineError::NotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "booking already exists: {id}"),
            EngineError::UnknownToken(token) => {
                write!(f, "unknown correlation token: {token}")
            }
            EngineError::PaymentFailed { reference } => {
                write!(f, "payment failed for {reference}; booking cancelled")
            }
            EngineError::HoldExpired(id) => {
                write!(f, "hold expired before payment completed: {id}")
            }
            EngineError::Gateway(msg) => write!(f, "payment provider error: {msg}"),
            EngineError::InvalidTransition { from } => {
                write!(f, "booking is {from}; transition not allowed")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Wal(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
