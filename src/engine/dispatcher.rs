//! The dispatcher: ingest path, launch loop, completion and cancel.
//!
//! Everything that changes a record goes through the ledger's
//! compare-and-set transitions, so the launch loop, the reclaimer and the
//! completion path can race freely; whoever loses gets `InvalidTransition`
//! and backs off.

use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::gate::{Authorizer, Decision};
use crate::launcher::TaskLauncher;
use crate::ledger::{Admission, DispatchLedger, Patch, requeue_within_budget};
use crate::model::{
    DispatchRecord, EventId, ExecutionSignal, RawEvent, State, TaskHandle, WireEvent,
};
use crate::normalize::normalize;
use crate::reclaim::{ReclaimConfig, Reclaimer};
use crate::telemetry::metrics;
use crate::templates::TemplateRegistry;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Re-queues allowed per event before it fails permanently.
    pub retry_ceiling: u32,
    /// How long one launch waits for a free slot.
    pub launch_timeout: Duration,
    /// Pending records considered per pump.
    pub pump_batch: usize,
    /// Launch loop wakes at least this often even without a notification.
    pub poll_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: 3,
            launch_timeout: Duration::from_secs(30),
            pump_batch: 64,
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Result of ingesting one event that passed the gate.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    Accepted(DispatchRecord),
    /// Already seen; the existing record is returned untouched.
    Duplicate(DispatchRecord),
}

impl IngestOutcome {
    pub fn record(&self) -> &DispatchRecord {
        match self {
            Self::Accepted(r) | Self::Duplicate(r) => r,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

impl From<Admission> for IngestOutcome {
    fn from(admission: Admission) -> Self {
        match admission {
            Admission::Accepted(r) => Self::Accepted(r),
            Admission::Duplicate(r) => Self::Duplicate(r),
        }
    }
}

fn count_ingest(result: &'static str) {
    metrics::events_ingested().add(1, &[KeyValue::new("result", result)]);
}

/// Audit entry for an event dropped before it reached the gate.
fn audit_malformed(declared_account: &str, source_account: Option<&str>, cause: &str) {
    warn!(
        target: "audit",
        account = source_account.unwrap_or("-"),
        declared_account,
        decision = "malformed",
        %cause,
        "event dropped"
    );
}

pub struct Dispatcher {
    gate: Arc<dyn Authorizer>,
    templates: Arc<TemplateRegistry>,
    ledger: Arc<dyn DispatchLedger>,
    launcher: Arc<TaskLauncher>,
    reclaimer: Arc<Reclaimer>,
    config: DispatchConfig,
    backlog: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(
        gate: Arc<dyn Authorizer>,
        templates: Arc<TemplateRegistry>,
        ledger: Arc<dyn DispatchLedger>,
        launcher: Arc<TaskLauncher>,
        config: DispatchConfig,
        reclaim: ReclaimConfig,
    ) -> Self {
        let backlog = Arc::new(Notify::new());
        let reclaimer = Arc::new(Reclaimer::new(
            Arc::clone(&ledger),
            Arc::clone(&launcher),
            reclaim,
            Arc::clone(&backlog),
        ));
        Self {
            gate,
            templates,
            ledger,
            launcher,
            reclaimer,
            config,
            backlog,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn DispatchLedger> {
        &self.ledger
    }

    pub fn launcher(&self) -> &Arc<TaskLauncher> {
        &self.launcher
    }

    pub fn reclaimer(&self) -> &Arc<Reclaimer> {
        &self.reclaimer
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Normalize, authorize, route and admit one event.
    ///
    /// # Errors
    ///
    /// - `MalformedEvent` if the event cannot be normalized.
    /// - `Denied` if the gate refuses it. No record is created.
    /// - `Unroutable` if no template matches. No record is created.
    pub async fn ingest(&self, raw: &RawEvent, declared_account: &str) -> Result<IngestOutcome> {
        let result = self.admit_event(raw, declared_account).await;
        count_ingest(match &result {
            Ok(IngestOutcome::Accepted(_)) => "accepted",
            Ok(IngestOutcome::Duplicate(_)) => "duplicate",
            Err(Error::MalformedEvent(cause)) => {
                audit_malformed(declared_account, Some(&raw.source_account), cause);
                "malformed"
            }
            Err(Error::Denied { .. }) => "denied",
            Err(Error::Unroutable { .. }) => "unroutable",
            Err(_) => "error",
        });
        result
    }

    /// [`Dispatcher::ingest`] for an event straight off the wire.
    pub async fn ingest_wire(
        &self,
        wire: WireEvent,
        declared_account: &str,
    ) -> Result<IngestOutcome> {
        let source_account = wire.source_account.clone();
        match RawEvent::from_wire(wire) {
            Ok(raw) => self.ingest(&raw, declared_account).await,
            Err(e) => {
                if let Error::MalformedEvent(ref cause) = e {
                    audit_malformed(declared_account, source_account.as_deref(), cause);
                }
                count_ingest("malformed");
                Err(e)
            }
        }
    }

    async fn admit_event(&self, raw: &RawEvent, declared_account: &str) -> Result<IngestOutcome> {
        let event = normalize(raw)?;

        if let Decision::Denied(reason) = self.gate.authorize(raw, declared_account) {
            return Err(Error::Denied {
                account: declared_account.to_string(),
                resource_id: raw.resource_id.clone(),
                reason,
            });
        }

        let Some(template) = self.templates.match_event(&event) else {
            warn!(
                event_id = event.id.short(),
                resource = %event.resource,
                kind = %event.kind,
                "no template matches event"
            );
            return Err(Error::Unroutable {
                event_id: event.id.clone(),
                resource: event.resource.to_string(),
            });
        };
        let template = template.name.clone();

        let outcome: IngestOutcome = self
            .ledger
            .admit(event, &template, self.config.retry_ceiling)
            .await?
            .into();
        let record = outcome.record();
        if outcome.is_duplicate() {
            info!(
                event_id = record.id().short(),
                state = %record.state,
                "duplicate delivery ignored"
            );
        } else {
            info!(
                event_id = record.id().short(),
                source_account = %record.event.source_account,
                resource = %record.event.resource,
                %template,
                "event admitted"
            );
            self.backlog.notify_one();
        }
        Ok(outcome)
    }

    /// Launch pending records, oldest first, until none are left or no slot
    /// frees up in time. Returns how many were started.
    pub async fn pump(&self) -> Result<usize> {
        let pending = self
            .ledger
            .list(Some(State::Pending), self.config.pump_batch)
            .await?;
        let mut launched = 0;

        for record in pending {
            let Some(template) = self.templates.get(&record.template) else {
                self.fail_unregistered(&record).await?;
                continue;
            };
            match self
                .launcher
                .launch(&record, template, self.config.launch_timeout)
                .await
            {
                Ok(_) => {
                    launched += 1;
                    self.replay_deferred().await;
                }
                Err(Error::CapacityExceeded {
                    ceiling, waited_ms, ..
                }) => {
                    debug!(ceiling, waited_ms, launched, "no free slot, pump paused");
                    break;
                }
                // Already logged and reconciled by the launcher.
                Err(Error::LaunchRejected { .. }) => {}
                Err(Error::InvalidTransition { event_id, from, .. }) => {
                    debug!(event_id = event_id.short(), %from, "record left Pending before launch");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(launched)
    }

    /// Handle signals that arrived while their task's launch was still
    /// committing.
    pub async fn replay_deferred(&self) {
        for signal in self.launcher.take_deferred() {
            match signal {
                ExecutionSignal::Exited {
                    handle,
                    success,
                    detail,
                } => {
                    if let Err(e) = self.finish(&handle, success, detail).await {
                        error!(%handle, "deferred completion handling failed: {e}");
                    }
                }
                ExecutionSignal::Interrupted(signal) => {
                    if let Err(e) = self.reclaimer.handle(&signal).await {
                        error!(
                            handle = %signal.task_handle,
                            "deferred interruption handling failed: {e}"
                        );
                    }
                }
            }
        }
    }

    /// A record routed to a template that has since been removed.
    async fn fail_unregistered(&self, record: &DispatchRecord) -> Result<()> {
        error!(
            event_id = record.id().short(),
            template = %record.template,
            "template no longer registered, failing event"
        );
        let cause = format!("template {} not registered", record.template);
        self.ledger
            .transition(record.id(), State::Pending, State::Launching, Patch::new())
            .await?;
        self.ledger
            .transition(record.id(), State::Launching, State::Failed, Patch::new().error(cause))
            .await?;
        Ok(())
    }

    /// Run [`Dispatcher::pump`] whenever the backlog is poked, and on every
    /// poll interval, until shutdown.
    pub async fn run_launch_loop(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            launch_timeout_secs = self.config.launch_timeout.as_secs(),
            "launch loop started"
        );
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            match self.pump().await {
                Ok(0) => {}
                Ok(launched) => debug!(launched, "pump finished"),
                Err(e) => error!("pump failed: {e}"),
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("launch loop shutting down");
                    return Ok(());
                }
                _ = self.backlog.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Record that the task behind `handle` ran to completion.
    ///
    /// A failed run is re-queued within budget. Reports for handles the
    /// ledger no longer considers running (preempted, cancelled, reported
    /// twice) are ignored and return `None`, as are reports that beat their
    /// own launch; those are replayed by [`Dispatcher::replay_deferred`].
    pub async fn finish(
        &self,
        handle: &TaskHandle,
        success: bool,
        detail: Option<String>,
    ) -> Result<Option<DispatchRecord>> {
        let exited = ExecutionSignal::Exited {
            handle: handle.clone(),
            success,
            detail: detail.clone(),
        };
        if self.launcher.defer_if_launching(&exited) {
            return Ok(None);
        }
        let Some(record) = self.ledger.find_by_handle(handle).await? else {
            debug!(%handle, "completion for unknown task handle");
            return Ok(None);
        };
        if record.state != State::Running {
            debug!(%handle, state = %record.state, "completion for a task no longer running");
            return Ok(None);
        }

        let (to, patch) = if success {
            (State::Succeeded, Patch::new())
        } else {
            let cause = detail.clone().unwrap_or_else(|| "task failed".to_string());
            (State::Failed, Patch::new().clear_handle().error(cause))
        };
        let finished = match self
            .ledger
            .transition(record.id(), State::Running, to, patch)
            .await
        {
            Ok(r) => r,
            Err(Error::InvalidTransition { event_id, from, .. }) => {
                debug!(event_id = event_id.short(), %from, "completion raced another transition");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        self.launcher.release();
        self.backlog.notify_one();

        if success {
            info!(
                event_id = finished.id().short(),
                %handle,
                attempts = finished.attempts,
                "task succeeded"
            );
            return Ok(Some(finished));
        }

        let cause = detail.unwrap_or_else(|| "task failed".to_string());
        warn!(event_id = finished.id().short(), %handle, %cause, "task failed");
        requeue_within_budget(self.ledger.as_ref(), finished, &cause)
            .await
            .map(Some)
    }

    /// Operator abort: stop the running task and reconcile it as a
    /// preemption, so it re-queues within budget.
    pub async fn cancel(&self, event_id: &EventId, reason: &str) -> Result<DispatchRecord> {
        let record = self.ledger.get(event_id).await?;
        if record.state != State::Running {
            return Err(Error::InvalidTransition {
                event_id: event_id.clone(),
                from: record.state.to_string(),
                to: State::Preempted.to_string(),
            });
        }
        if let Some(ref handle) = record.task_handle {
            self.launcher.backend().stop_task(handle, reason).await?;
        }
        info!(event_id = event_id.short(), reason, "cancel requested");
        self.reclaimer
            .preempt(record, &format!("cancelled: {reason}"))
            .await
    }
}
