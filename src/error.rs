//! Error types for dispatchd.
//!
//! Every variant that concerns a single event carries its id so the
//! decision can be reconstructed from the log line alone.

use thiserror::Error;

use crate::gate::DenyReason;
use crate::model::EventId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("denied event from account {account} (resource {resource_id}): {reason}")]
    Denied {
        account: String,
        resource_id: String,
        reason: DenyReason,
    },

    #[error("no task template matches event {event_id} ({resource})")]
    Unroutable { event_id: EventId, resource: String },

    #[error("invalid state transition for {event_id}: {from} -> {to}")]
    InvalidTransition {
        event_id: EventId,
        from: String,
        to: String,
    },

    #[error("capacity exceeded for {event_id}: ceiling {ceiling} reached, waited {waited_ms}ms")]
    CapacityExceeded {
        event_id: EventId,
        ceiling: usize,
        waited_ms: u64,
    },

    #[error("launch rejected for {event_id}: {reason}")]
    LaunchRejected { event_id: EventId, reason: String },

    #[error("retry budget exhausted for {event_id}: {attempts}/{ceiling} attempts")]
    RetryExhausted {
        event_id: EventId,
        attempts: u32,
        ceiling: u32,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
