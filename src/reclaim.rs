//! Capacity reclaimer watcher.
//!
//! Discounted capacity can be taken back at any moment. An interruption is a
//! retryable failure: the record goes `Running → Preempted → Pending` with
//! one more attempt on the clock, until the retry budget runs out.
//!
//! The same path handles work that never reports back (overdue past the
//! execution timeout) and operator aborts. Records stranded in `Launching`
//! by a crash mid-launch are failed and re-queued by the same sweep, so
//! their slots come back after a restart.

use chrono::Utc;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};
use tracing::{Instrument, debug, error, info, warn};

use crate::error::{Error, Result};
use crate::launcher::TaskLauncher;
use crate::ledger::{DispatchLedger, Patch, requeue_within_budget};
use crate::model::{DispatchRecord, ExecutionSignal, InterruptionSignal, State};
use crate::telemetry::dispatch::{record_state_transition, start_reclaim_span};
use crate::telemetry::metrics;

#[derive(Debug, Clone)]
pub struct ReclaimConfig {
    /// Running longer than this without a completion report counts as lost.
    pub execution_timeout: Duration,
    /// `Launching` longer than this, with no launch in this process behind
    /// it, counts as stranded. Capped at `execution_timeout`.
    pub launch_stall_timeout: Duration,
    /// How often to look for overdue work.
    pub sweep_interval: Duration,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(3600),
            launch_stall_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

pub struct Reclaimer {
    ledger: Arc<dyn DispatchLedger>,
    launcher: Arc<TaskLauncher>,
    config: ReclaimConfig,
    backlog: Arc<Notify>,
}

impl Reclaimer {
    /// `backlog` is notified whenever a record goes back to `Pending`.
    pub fn new(
        ledger: Arc<dyn DispatchLedger>,
        launcher: Arc<TaskLauncher>,
        config: ReclaimConfig,
        backlog: Arc<Notify>,
    ) -> Self {
        Self {
            ledger,
            launcher,
            config,
            backlog,
        }
    }

    /// Reconcile one interruption signal. Unknown handles (already finished,
    /// already preempted) are logged and ignored.
    pub async fn handle(&self, signal: &InterruptionSignal) -> Result<Option<DispatchRecord>> {
        let span = start_reclaim_span(&signal.task_handle.0, &signal.reason);
        async {
            if self
                .launcher
                .defer_if_launching(&ExecutionSignal::Interrupted(signal.clone()))
            {
                return Ok(None);
            }
            let Some(record) = self.ledger.find_by_handle(&signal.task_handle).await? else {
                warn!(handle = %signal.task_handle, "interruption for unknown task handle");
                return Ok(None);
            };
            span.record("dispatch.event_id", record.id().0.as_str());
            self.preempt(record, &signal.reason).await.map(Some)
        }
        .instrument(span.clone())
        .await
    }

    /// Move a running record to `Preempted`, free its slot, and re-queue it
    /// within budget.
    pub async fn preempt(&self, record: DispatchRecord, reason: &str) -> Result<DispatchRecord> {
        let handle = record.task_handle.clone();
        let preempted = self
            .ledger
            .transition(
                record.id(),
                State::Running,
                State::Preempted,
                Patch::new()
                    .clear_handle()
                    .error(format!("preempted: {reason}")),
            )
            .await?;
        self.launcher.release();
        record_state_transition(&tracing::Span::current(), State::Running, State::Preempted);
        info!(
            event_id = preempted.id().short(),
            handle = handle.as_ref().map(|h| h.0.as_str()).unwrap_or("-"),
            reason,
            "task preempted"
        );

        let outcome = requeue_within_budget(self.ledger.as_ref(), preempted, reason).await?;
        let label = if outcome.state == State::Pending {
            self.backlog.notify_one();
            "requeued"
        } else {
            "exhausted"
        };
        metrics::preemptions().add(1, &[KeyValue::new("outcome", label)]);
        Ok(outcome)
    }

    /// Stop and preempt every record running past the execution timeout,
    /// then reclaim stranded launches.
    pub async fn sweep_overdue(&self) -> Result<Vec<DispatchRecord>> {
        let cutoff = cutoff(self.config.execution_timeout)?;
        let overdue = self.ledger.attempted_before(State::Running, cutoff).await?;

        let mut reclaimed = Vec::with_capacity(overdue.len());
        for record in overdue {
            if let Some(ref handle) = record.task_handle {
                let stopped = self
                    .launcher
                    .backend()
                    .stop_task(handle, "execution timeout")
                    .await;
                if let Err(e) = stopped {
                    error!(
                        event_id = record.id().short(),
                        %handle,
                        "failed to stop overdue task: {e}"
                    );
                }
            }
            warn!(
                event_id = record.id().short(),
                timeout_secs = self.config.execution_timeout.as_secs(),
                "task exceeded execution timeout"
            );
            match self.preempt(record, "execution timeout").await {
                Ok(r) => reclaimed.push(r),
                // Finished or preempted between the read and the transition.
                Err(Error::InvalidTransition { event_id, .. }) => {
                    debug!(event_id = event_id.short(), "overdue record moved on before reclaim");
                }
                Err(e) => return Err(e),
            }
        }
        reclaimed.extend(self.reclaim_stalled_launches().await?);
        Ok(reclaimed)
    }

    /// `Launching → Failed`, then re-queue within budget, for every record
    /// stuck in `Launching` that no launch in this process owns.
    async fn reclaim_stalled_launches(&self) -> Result<Vec<DispatchRecord>> {
        let stall = self
            .config
            .launch_stall_timeout
            .min(self.config.execution_timeout);
        let stalled = self
            .ledger
            .attempted_before(State::Launching, cutoff(stall)?)
            .await?;

        let mut reclaimed = Vec::with_capacity(stalled.len());
        for record in stalled {
            if let Some(ref handle) = record.task_handle {
                if self.launcher.is_launching(handle) {
                    continue;
                }
                // The backend may have started it before the crash.
                let stopped = self
                    .launcher
                    .backend()
                    .stop_task(handle, "launch stalled")
                    .await;
                if let Err(e) = stopped {
                    warn!(
                        event_id = record.id().short(),
                        %handle,
                        "failed to stop stalled task: {e}"
                    );
                }
            }
            let failed = match self
                .ledger
                .transition(
                    record.id(),
                    State::Launching,
                    State::Failed,
                    Patch::new().clear_handle().error("launch stalled"),
                )
                .await
            {
                Ok(r) => r,
                Err(Error::InvalidTransition { event_id, .. }) => {
                    debug!(event_id = event_id.short(), "stalled launch moved on before reclaim");
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.launcher.release();
            warn!(
                event_id = failed.id().short(),
                stall_secs = stall.as_secs(),
                "stalled launch reclaimed"
            );

            let outcome =
                requeue_within_budget(self.ledger.as_ref(), failed, "launch stalled").await?;
            if outcome.state == State::Pending {
                self.backlog.notify_one();
            }
            reclaimed.push(outcome);
        }
        Ok(reclaimed)
    }

    /// Consume interruption signals and sweep for overdue work until
    /// shutdown.
    pub async fn run(
        &self,
        mut signals: mpsc::Receiver<InterruptionSignal>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            execution_timeout_secs = self.config.execution_timeout.as_secs(),
            "reclaimer started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("reclaimer shutting down");
                    return Ok(());
                }
                signal = signals.recv() => {
                    let Some(signal) = signal else {
                        return Ok(());
                    };
                    match self.handle(&signal).await {
                        Ok(_) => {}
                        Err(Error::InvalidTransition { event_id, from, to }) => {
                            warn!(
                                event_id = event_id.short(),
                                %from,
                                %to,
                                "interruption raced another transition"
                            );
                        }
                        Err(e) => {
                            error!(
                                handle = %signal.task_handle,
                                "interruption handling failed: {e}"
                            );
                        }
                    }
                }
                _ = sweep.tick() => {
                    if let Err(e) = self.sweep_overdue().await {
                        error!("overdue sweep failed: {e}");
                    }
                }
            }
        }
    }
}

fn cutoff(age: Duration) -> Result<chrono::DateTime<Utc>> {
    let age = chrono::Duration::from_std(age)
        .map_err(|e| Error::Config(format!("reclaim timeout out of range: {e}")))?;
    Ok(Utc::now() - age)
}
