//! Dispatch ledger: the idempotency boundary and the record of every
//! event's lifecycle.
//!
//! The upstream notifier delivers at least once, so [`DispatchLedger::admit`]
//! must be atomic for callers racing on the same event id. Every other
//! change is a compare-and-set [`DispatchLedger::transition`] that names the
//! state it expects to find; a concurrent caller that lost the race gets
//! `InvalidTransition` instead of a second launch.
//!
//! Two implementations: [`memory::MemoryLedger`] and the Postgres-backed
//! [`crate::db::ledger::PgLedger`].

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::model::{CanonicalEvent, DispatchRecord, EventId, State, TaskHandle};
use crate::telemetry::metrics;

pub use memory::MemoryLedger;

/// Result of admitting an event.
#[derive(Debug, Clone)]
pub enum Admission {
    /// First sighting. A new `Pending` record was created.
    Accepted(DispatchRecord),
    /// A record already exists for this event id. Nothing was created.
    Duplicate(DispatchRecord),
}

impl Admission {
    pub fn record(&self) -> &DispatchRecord {
        match self {
            Admission::Accepted(r) | Admission::Duplicate(r) => r,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Admission::Duplicate(_))
    }
}

/// What happens to the task handle during a transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HandleChange {
    #[default]
    Keep,
    Set(TaskHandle),
    Clear,
}

/// Field changes applied together with a transition.
///
/// `attempts` and `last_attempt_at` are not here: the ledger bumps
/// `attempts` on every re-queue and stamps `last_attempt_at` on every entry
/// into `Launching`.
#[derive(Debug, Clone, Default)]
pub struct Patch {
    pub handle: HandleChange,
    pub error: Option<String>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(mut self, handle: TaskHandle) -> Self {
        self.handle = HandleChange::Set(handle);
        self
    }

    pub fn clear_handle(mut self) -> Self {
        self.handle = HandleChange::Clear;
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[async_trait]
pub trait DispatchLedger: Send + Sync {
    /// Record an event. Atomic with respect to concurrent admits of the same id.
    async fn admit(
        &self,
        event: CanonicalEvent,
        template: &str,
        retry_ceiling: u32,
    ) -> Result<Admission>;

    async fn get(&self, id: &EventId) -> Result<DispatchRecord>;

    /// The record currently holding `handle`, if any.
    async fn find_by_handle(&self, handle: &TaskHandle) -> Result<Option<DispatchRecord>>;

    /// Move a record from `from` to `to`, failing if it is not in `from`.
    async fn transition(
        &self,
        id: &EventId,
        from: State,
        to: State,
        patch: Patch,
    ) -> Result<DispatchRecord>;

    /// Records whose event id starts with `prefix`, at most `limit`.
    async fn find_by_id_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<DispatchRecord>>;

    /// Records, oldest first, optionally filtered by state.
    async fn list(&self, state: Option<State>, limit: usize) -> Result<Vec<DispatchRecord>>;

    /// Number of records in any of `states`.
    async fn count_by_state(&self, states: &[State]) -> Result<usize>;

    /// Records in `state` whose latest attempt entered `Launching` before
    /// `cutoff`.
    async fn attempted_before(
        &self,
        state: State,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DispatchRecord>>;
}

/// Validate a transition against the state graph, the stored state and
/// the retry budget.
pub(crate) fn check_transition(record: &DispatchRecord, from: State, to: State) -> Result<()> {
    if !from.can_transition_to(to) || record.state != from {
        return Err(Error::InvalidTransition {
            event_id: record.id().clone(),
            from: record.state.to_string(),
            to: to.to_string(),
        });
    }
    if State::is_requeue(from, to) && !record.can_retry() {
        return Err(Error::RetryExhausted {
            event_id: record.id().clone(),
            attempts: record.attempts,
            ceiling: record.retry_ceiling,
        });
    }
    Ok(())
}

pub(crate) fn count_transition(from: State, to: State) {
    metrics::state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.to_string()),
            KeyValue::new("to", to.to_string()),
        ],
    );
}

/// Re-queue a `Failed` or `Preempted` record if budget remains.
///
/// With budget left the record goes back to `Pending` with `attempts + 1`.
/// Without it, a preempted record is failed; either way the exhaustion is
/// logged at error level since it is the final outcome for that event.
pub async fn requeue_within_budget(
    ledger: &dyn DispatchLedger,
    record: DispatchRecord,
    cause: &str,
) -> Result<DispatchRecord> {
    let from = record.state;
    if !matches!(from, State::Failed | State::Preempted) {
        return Err(Error::InvalidTransition {
            event_id: record.id().clone(),
            from: from.to_string(),
            to: State::Pending.to_string(),
        });
    }

    if record.can_retry() {
        let requeued = ledger
            .transition(record.id(), from, State::Pending, Patch::new().error(cause))
            .await?;
        info!(
            event_id = requeued.id().short(),
            attempts = requeued.attempts,
            retry_ceiling = requeued.retry_ceiling,
            from = %from,
            cause,
            "re-queued"
        );
        return Ok(requeued);
    }

    let failed = if from == State::Preempted {
        ledger
            .transition(record.id(), from, State::Failed, Patch::new().error(cause))
            .await?
    } else {
        record
    };
    error!(
        event_id = failed.id().short(),
        resource = %failed.event.resource,
        attempts = failed.attempts,
        retry_ceiling = failed.retry_ceiling,
        cause,
        "retry budget exhausted, event failed permanently"
    );
    Ok(failed)
}
