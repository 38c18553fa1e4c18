//! Dispatch records and their lifecycle.
//!
//! A dispatch record follows one canonical event through execution. There is
//! exactly one per event id; every change to it is a state transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::{CanonicalEvent, EventId};
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Task Handle
// ---------------------------------------------------------------------------

/// Opaque identifier of a task started by an execution backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(pub String);

impl std::fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a dispatch record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Admitted, waiting for capacity.
    Pending,
    /// Slot acquired, backend call in progress.
    Launching,
    /// Backend accepted the task and returned a handle.
    Running,
    /// Task reported success. Terminal.
    Succeeded,
    /// Launch rejected or task failed. Terminal unless re-queued within budget.
    Failed,
    /// Capacity reclaimed or operator abort. Always leaves again.
    Preempted,
}

impl State {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Pending, Launching)
                | (Launching, Running)
                | (Launching, Failed)   // backend rejected the launch
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Preempted)
                | (Preempted, Pending)  // re-queue
                | (Preempted, Failed)   // retry budget exhausted
                | (Failed, Pending) // retry within budget
        )
    }

    /// Is this a terminal state? `Failed` is terminal only once the retry
    /// budget is spent, so it is not listed here.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Succeeded)
    }

    /// Holds an in-flight slot.
    pub fn is_in_flight(self) -> bool {
        matches!(self, State::Launching | State::Running)
    }

    /// Entering this state from `Failed`/`Preempted` consumes one retry.
    pub fn is_requeue(from: State, to: State) -> bool {
        to == State::Pending && matches!(from, State::Failed | State::Preempted)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Pending => "pending",
            State::Launching => "launching",
            State::Running => "running",
            State::Succeeded => "succeeded",
            State::Failed => "failed",
            State::Preempted => "preempted",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(State::Pending),
            "launching" => Ok(State::Launching),
            "running" => Ok(State::Running),
            "succeeded" => Ok(State::Succeeded),
            "failed" => Ok(State::Failed),
            "preempted" => Ok(State::Preempted),
            other => Err(Error::Other(format!("unknown dispatch state: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch Record
// ---------------------------------------------------------------------------

/// Lifecycle tracker for one event's execution attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRecord {
    /// The admitted event. Owned by the ledger from admission on.
    pub event: CanonicalEvent,

    /// Name of the task template this event was matched to.
    pub template: String,

    pub state: State,

    /// Number of re-queues so far. Never exceeds `retry_ceiling`.
    pub attempts: u32,

    /// Re-queue budget fixed at admission.
    pub retry_ceiling: u32,

    /// When the record last entered `Launching`.
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// Set while `Running`. Kept on success, cleared on failure or preemption.
    pub task_handle: Option<TaskHandle>,

    /// Cause of the most recent failure or preemption.
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DispatchRecord {
    /// A fresh `Pending` record for a just-admitted event.
    pub fn pending(event: CanonicalEvent, template: impl Into<String>, retry_ceiling: u32) -> Self {
        let now = Utc::now();
        Self {
            event,
            template: template.into(),
            state: State::Pending,
            attempts: 0,
            retry_ceiling,
            last_attempt_at: None,
            task_handle: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> &EventId {
        &self.event.id
    }

    /// Is there retry budget left for one more re-queue?
    pub fn can_retry(&self) -> bool {
        self.attempts < self.retry_ceiling
    }
}
