//! Signals flowing into the dispatcher from the backend, the operator and
//! the host: interruptions, completions, utilization samples, inbox messages.

use serde::{Deserialize, Serialize};

use super::dispatch::TaskHandle;
use super::event::{EventId, WireEvent};

/// Capacity behind a running task is being reclaimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptionSignal {
    pub task_handle: TaskHandle,
    pub reason: String,
}

/// Something the execution backend reports about a task it started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionSignal {
    /// The task ran to completion.
    Exited {
        handle: TaskHandle,
        success: bool,
        detail: Option<String>,
    },
    /// The task was interrupted by the platform.
    Interrupted(InterruptionSignal),
}

impl ExecutionSignal {
    pub fn handle(&self) -> &TaskHandle {
        match self {
            Self::Exited { handle, .. } => handle,
            Self::Interrupted(signal) => &signal.task_handle,
        }
    }
}

/// Host utilization, as percentages in `0.0..=100.0`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UtilizationSample {
    pub cpu_pct: f64,
    pub mem_pct: f64,
}

/// A message on the dispatcher's inbox queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// A storage notification routed across the account boundary.
    Event {
        /// Account the transport says delivered the event.
        declared_account: String,
        event: WireEvent,
    },
    Interruption(InterruptionSignal),
    /// Completion report from a remote execution backend.
    Completion {
        task_handle: TaskHandle,
        success: bool,
        #[serde(default)]
        detail: Option<String>,
    },
    Utilization(UtilizationSample),
    /// Operator abort of an in-flight task.
    Cancel { event_id: EventId, reason: String },
}
