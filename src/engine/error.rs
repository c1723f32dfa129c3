use ulid::Ulid;

use crate::model::{SlotError, TimeRange};

#[derive(Debug)]
pub enum EngineError {
    /// Malformed time/date or an inverted range, raised at model construction.
    InvalidSlot(SlotError),
    /// A commit was attempted with zero candidate slots.
    EmptyRequest,
    /// Two candidates within the same commit request overlap each other.
    SelfConflict { first: TimeRange, second: TimeRange },
    /// A candidate overlaps a booking already on the schedule.
    SlotOccupied { requested: TimeRange, existing: Ulid },
    NotFound(Ulid),
    LimitExceeded(&'static str),
    /// The persistence collaborator failed. Surfaced as-is, never retried here.
    WalError(String),
}

impl From<SlotError> for EngineError {
    fn from(e: SlotError) -> Self {
        EngineError::InvalidSlot(e)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidSlot(e) => write!(f, "invalid slot: {e}"),
            EngineError::EmptyRequest => write!(f, "request contains no slots"),
            EngineError::SelfConflict { first, second } => {
                write!(f, "requested slots {first} and {second} overlap each other")
            }
            EngineError::SlotOccupied { requested, existing } => {
                write!(f, "slot {requested} conflicts with existing booking {existing}")
            }
            EngineError::NotFound(id) => write!(f, "no booking with id {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
