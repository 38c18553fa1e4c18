//! Task templates: static descriptions of the unit of work to run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::event::EventKind;

/// CPU/memory bounds for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// CPU units (1024 = one vCPU).
    pub cpu_units: u32,
    pub memory_mib: u32,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            cpu_units: 256,
            memory_mib: 512,
        }
    }
}

/// Supplied externally; read-only to the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub name: String,

    /// Task definition reference understood by the execution backend.
    /// For the process backend this is the command to run.
    pub reference: String,

    /// Resource-id prefix (`bucket/key-prefix`) this template handles.
    /// Empty matches everything.
    #[serde(default)]
    pub match_prefix: String,

    /// Event kinds this template handles.
    #[serde(default = "default_event_kinds")]
    pub event_kinds: Vec<EventKind>,

    #[serde(default)]
    pub resources: ResourceRequirements,

    /// Identity the task assumes in the consumer account.
    pub identity: String,

    /// Static environment bindings passed to every launch.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_event_kinds() -> Vec<EventKind> {
    vec![EventKind::Created]
}
