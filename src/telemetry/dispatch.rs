//! Dispatch span helpers.
//!
//! Provides span creation and state-transition recording for dispatch
//! records flowing through the launcher and reclaimer.

use tracing::Span;

use crate::model::{EventId, State};

/// Start a span covering one launch of a dispatch record.
///
/// The `dispatch.task_handle` field is declared empty and filled by
/// [`record_task_handle`] once the backend accepts the task.
pub fn start_dispatch_span(template: &str, event_id: &EventId, attempt: u32) -> Span {
    tracing::info_span!(
        "dispatch.launch",
        "dispatch.template" = template,
        "dispatch.event_id" = %event_id.0,
        "dispatch.attempt" = attempt,
        "dispatch.task_handle" = tracing::field::Empty,
    )
}

/// Start a span covering reconciliation of one interruption.
pub fn start_reclaim_span(task_handle: &str, reason: &str) -> Span {
    tracing::info_span!(
        "dispatch.reclaim",
        "dispatch.task_handle" = task_handle,
        "dispatch.reason" = reason,
        "dispatch.event_id" = tracing::field::Empty,
    )
}

/// Record the backend handle on a launch span.
pub fn record_task_handle(span: &Span, handle: &str) {
    span.record("dispatch.task_handle", handle);
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: State, to: State) {
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "state_transition");
    });
}
