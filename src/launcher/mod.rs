//! Task launcher: starts one unit of compute per pending record, never more
//! than the concurrency ceiling at once.
//!
//! The slot counter is the launcher's own: test-and-acquire is a single
//! compare-and-swap against the current ceiling, and a slot is returned
//! through [`TaskLauncher::release`] when a record leaves `Running`. The
//! launcher does not guard against being called twice for the same record;
//! the ledger's `Pending → Launching` compare-and-set does.
//!
//! The handle is minted before the backend is called and recorded on
//! `Pending → Launching`. A task can exit before `Launching → Running`
//! commits; signals for such a handle are held with
//! [`TaskLauncher::defer_if_launching`] and handed back through
//! [`TaskLauncher::take_deferred`] once the launch settles.

pub mod memory;
pub mod process;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{Instrument, debug, error, info, warn};

use crate::ceiling::ConcurrencyCeiling;
use crate::error::{Error, Result};
use crate::ledger::{DispatchLedger, Patch, requeue_within_budget};
use crate::model::{
    DispatchRecord, EventId, ExecutionSignal, ResourceRequirements, State, TaskHandle, TaskTemplate,
};
use crate::telemetry::dispatch::{record_state_transition, record_task_handle, start_dispatch_span};
use crate::telemetry::metrics;

pub use memory::InMemoryBackend;
pub use process::ProcessBackend;

// ---------------------------------------------------------------------------
// Backend contract
// ---------------------------------------------------------------------------

/// What the execution backend is asked to run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LaunchRequest {
    pub event_id: EventId,
    pub template_reference: String,
    pub environment: BTreeMap<String, String>,
    pub identity: String,
    pub resources: ResourceRequirements,
    /// Zero-based: the number of earlier re-queues.
    pub attempt: u32,
}

impl LaunchRequest {
    /// Template bindings plus the event's own coordinates. Event bindings
    /// win over a template binding of the same name.
    pub fn new(record: &DispatchRecord, template: &TaskTemplate) -> Self {
        let mut environment = template.env.clone();
        let event = &record.event;
        for (k, v) in [
            ("DISPATCH_EVENT_ID", event.id.0.clone()),
            ("DISPATCH_SOURCE_ACCOUNT", event.source_account.clone()),
            ("DISPATCH_BUCKET", event.resource.bucket.clone()),
            ("DISPATCH_KEY", event.resource.key.clone()),
            ("DISPATCH_EVENT_KIND", event.kind.to_string()),
            ("DISPATCH_ATTEMPT", record.attempts.to_string()),
        ] {
            environment.insert(k.to_string(), v);
        }
        Self {
            event_id: event.id.clone(),
            template_reference: template.reference.clone(),
            environment,
            identity: template.identity.clone(),
            resources: template.resources,
            attempt: record.attempts,
        }
    }
}

/// Structured refusal from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: String,
    /// Quota exhaustion and similar are worth another try; a malformed
    /// template is not.
    pub retryable: bool,
}

impl Rejection {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: false,
        }
    }
}

/// Something that can start and stop bounded units of work.
///
/// Completion and interruption are reported asynchronously as
/// [`crate::model::ExecutionSignal`]s on a channel the backend is built with.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Handle the next task will run under. Must be unique per call.
    fn new_handle(&self) -> TaskHandle;

    /// Start `request` under `handle`. Signals for the task may be emitted
    /// before this returns.
    async fn run_task(
        &self,
        handle: &TaskHandle,
        request: &LaunchRequest,
    ) -> std::result::Result<(), Rejection>;

    /// Stop a running task. Stopping a task that already exited is not an error.
    async fn stop_task(&self, handle: &TaskHandle, reason: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Launcher
// ---------------------------------------------------------------------------

pub struct TaskLauncher {
    backend: Arc<dyn ExecutionBackend>,
    ledger: Arc<dyn DispatchLedger>,
    ceiling: Arc<ConcurrencyCeiling>,
    in_flight: AtomicUsize,
    freed: Notify,
    /// Launches not yet settled, with any signal that beat the commit.
    launching: Mutex<HashMap<TaskHandle, Option<ExecutionSignal>>>,
    deferred: Mutex<Vec<ExecutionSignal>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TaskLauncher {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        ledger: Arc<dyn DispatchLedger>,
        ceiling: Arc<ConcurrencyCeiling>,
    ) -> Self {
        Self {
            backend,
            ledger,
            ceiling,
            in_flight: AtomicUsize::new(0),
            freed: Notify::new(),
            launching: Mutex::new(HashMap::new()),
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// Whether a launch under `handle` is in progress in this process.
    pub fn is_launching(&self, handle: &TaskHandle) -> bool {
        lock(&self.launching).contains_key(handle)
    }

    /// Hold `signal` if its task's launch has not settled yet. Returns
    /// `false` when the caller should handle the signal itself.
    pub fn defer_if_launching(&self, signal: &ExecutionSignal) -> bool {
        let mut launching = lock(&self.launching);
        match launching.get_mut(signal.handle()) {
            Some(slot) => {
                debug!(handle = %signal.handle(), "signal arrived mid-launch, deferred");
                *slot = Some(signal.clone());
                true
            }
            None => false,
        }
    }

    /// Signals held during launches that have since committed to `Running`.
    pub fn take_deferred(&self) -> Vec<ExecutionSignal> {
        std::mem::take(&mut *lock(&self.deferred))
    }

    fn begin_launch(&self, handle: &TaskHandle) {
        lock(&self.launching).insert(handle.clone(), None);
    }

    /// Stop holding signals for `handle`; returns one that arrived meanwhile.
    fn end_launch(&self, handle: &TaskHandle) -> Option<ExecutionSignal> {
        lock(&self.launching).remove(handle).flatten()
    }

    /// Count records a previous process left in `Launching`/`Running` so the
    /// slot counter starts from the truth.
    pub async fn seed_in_flight(&self) -> Result<usize> {
        let count = self
            .ledger
            .count_by_state(&[State::Launching, State::Running])
            .await?;
        self.in_flight.store(count, Ordering::Release);
        metrics::in_flight().record(count as u64, &[]);
        Ok(count)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn ceiling(&self) -> &Arc<ConcurrencyCeiling> {
        &self.ceiling
    }

    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        &self.backend
    }

    /// Take a slot if one is free under the current ceiling.
    fn try_acquire(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.ceiling.get()).then_some(n + 1)
            })
            .is_ok()
    }

    async fn acquire(&self, event_id: &EventId, timeout: Duration) -> Result<()> {
        let started = tokio::time::Instant::now();
        let deadline = started + timeout;
        loop {
            // Register interest before checking so a release in between wakes us.
            let freed = self.freed.notified();
            let changed = self.ceiling.changed();
            if self.try_acquire() {
                metrics::slot_wait_ms().record(started.elapsed().as_secs_f64() * 1000.0, &[]);
                metrics::in_flight().record(self.in_flight() as u64, &[]);
                return Ok(());
            }
            let wait = async {
                tokio::select! {
                    _ = freed => {}
                    _ = changed => {}
                }
            };
            if tokio::time::timeout_at(deadline, wait).await.is_err() {
                return Err(Error::CapacityExceeded {
                    event_id: event_id.clone(),
                    ceiling: self.ceiling.get(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        }
    }

    /// Return a slot. Call exactly once per record leaving `Running`
    /// (or `Launching` on rejection).
    pub fn release(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        metrics::in_flight().record(self.in_flight() as u64, &[]);
        self.freed.notify_waiters();
    }

    /// Launch `record` against `template`.
    ///
    /// Waits up to `timeout` for a free slot.
    ///
    /// # Errors
    ///
    /// - `InvalidTransition` if the record is not `Pending` (or stopped being
    ///   so while we waited).
    /// - `CapacityExceeded` if no slot freed up in time.
    /// - `LaunchRejected` if the backend refused; the record is `Failed` and,
    ///   for retryable rejections within budget, already back in `Pending`.
    pub async fn launch(
        &self,
        record: &DispatchRecord,
        template: &TaskTemplate,
        timeout: Duration,
    ) -> Result<TaskHandle> {
        if record.state != State::Pending {
            return Err(Error::InvalidTransition {
                event_id: record.id().clone(),
                from: record.state.to_string(),
                to: State::Launching.to_string(),
            });
        }

        let span = start_dispatch_span(&template.name, record.id(), record.attempts);
        async {
            if let Err(e) = self.acquire(record.id(), timeout).await {
                metrics::launches().add(
                    1,
                    &[
                        KeyValue::new("template", template.name.clone()),
                        KeyValue::new("result", "capacity_exceeded"),
                    ],
                );
                return Err(e);
            }

            let handle = self.backend.new_handle();
            self.begin_launch(&handle);
            let launching = match self
                .ledger
                .transition(
                    record.id(),
                    State::Pending,
                    State::Launching,
                    Patch::new().handle(handle.clone()),
                )
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    self.end_launch(&handle);
                    self.release();
                    return Err(e);
                }
            };
            record_state_transition(&span, State::Pending, State::Launching);

            let request = LaunchRequest::new(&launching, template);
            match self.backend.run_task(&handle, &request).await {
                Ok(()) => self.mark_running(&launching, template, handle, &span).await,
                Err(rejection) => {
                    self.end_launch(&handle);
                    self.mark_rejected(&launching, template, rejection, &span).await
                }
            }
        }
        .instrument(span.clone())
        .await
    }

    async fn mark_running(
        &self,
        record: &DispatchRecord,
        template: &TaskTemplate,
        handle: TaskHandle,
        span: &tracing::Span,
    ) -> Result<TaskHandle> {
        if let Err(e) = self
            .ledger
            .transition(record.id(), State::Launching, State::Running, Patch::new())
            .await
        {
            // The backend is running work the ledger cannot see; stop it.
            self.end_launch(&handle);
            warn!(
                event_id = record.id().short(),
                %handle,
                "ledger update failed after launch: {e}"
            );
            if let Err(stop_err) = self.backend.stop_task(&handle, "ledger update failed").await {
                error!(%handle, "failed to stop orphaned task: {stop_err}");
            }
            self.release();
            return Err(e);
        }

        // Only after the commit, so a signal is either held here or finds
        // the record `Running`.
        if let Some(early) = self.end_launch(&handle) {
            lock(&self.deferred).push(early);
        }
        record_state_transition(span, State::Launching, State::Running);
        record_task_handle(span, &handle.0);
        metrics::launches().add(
            1,
            &[
                KeyValue::new("template", template.name.clone()),
                KeyValue::new("result", "started"),
            ],
        );
        info!(
            event_id = record.id().short(),
            %handle,
            template = %template.name,
            backend = self.backend.name(),
            attempt = record.attempts,
            "task launched"
        );
        Ok(handle)
    }

    async fn mark_rejected(
        &self,
        record: &DispatchRecord,
        template: &TaskTemplate,
        rejection: Rejection,
        span: &tracing::Span,
    ) -> Result<TaskHandle> {
        metrics::launches().add(
            1,
            &[
                KeyValue::new("template", template.name.clone()),
                KeyValue::new("result", "rejected"),
            ],
        );
        let transition = self
            .ledger
            .transition(
                record.id(),
                State::Launching,
                State::Failed,
                Patch::new()
                    .clear_handle()
                    .error(format!("launch rejected: {}", rejection.reason)),
            )
            .await;
        self.release();
        let failed = transition?;
        record_state_transition(span, State::Launching, State::Failed);

        if rejection.retryable {
            warn!(
                event_id = record.id().short(),
                reason = %rejection.reason,
                "launch rejected, retrying"
            );
            requeue_within_budget(self.ledger.as_ref(), failed, &rejection.reason).await?;
        } else {
            error!(
                event_id = record.id().short(),
                template = %template.name,
                reason = %rejection.reason,
                "launch rejected permanently"
            );
        }

        Err(Error::LaunchRejected {
            event_id: record.id().clone(),
            reason: rejection.reason,
        })
    }
}
