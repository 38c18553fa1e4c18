//! Core data model.
//!
//! Notifications arrive as [`WireEvent`]s, are validated into [`RawEvent`]s,
//! normalized into [`CanonicalEvent`]s, and tracked through execution by a
//! [`DispatchRecord`].

pub mod dispatch;
pub mod event;
pub mod signal;
pub mod template;

pub use dispatch::{DispatchRecord, State, TaskHandle};
pub use event::{CanonicalEvent, EventId, EventKind, RawEvent, ResourceRef, WireEvent};
pub use signal::{ExecutionSignal, InboundMessage, InterruptionSignal, UtilizationSample};
pub use template::{ResourceRequirements, TaskTemplate};
