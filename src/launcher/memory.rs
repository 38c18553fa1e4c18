//! In-memory execution backend for testing.
//!
//! Hands out sequential handles, remembers every request, and lets the test
//! decide when a task completes or is interrupted.
//!
//! ## Limitations
//!
//! - Nothing runs. Completion happens only when the test calls
//!   [`InMemoryBackend::complete`] or [`InMemoryBackend::interrupt`].
//! - Queued rejections are consumed in order, one per `run_task` call.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use super::{ExecutionBackend, LaunchRequest, Rejection};
use crate::error::{Error, Result};
use crate::model::{ExecutionSignal, InterruptionSignal, TaskHandle};

#[derive(Debug, Default)]
struct BackendState {
    launched: Vec<(TaskHandle, LaunchRequest)>,
    stopped: Vec<(TaskHandle, String)>,
    rejections: VecDeque<Rejection>,
}

#[derive(Debug)]
pub struct InMemoryBackend {
    state: Mutex<BackendState>,
    next_id: AtomicU64,
    signals: mpsc::UnboundedSender<ExecutionSignal>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::Other("backend lock poisoned".to_string())
}

impl InMemoryBackend {
    /// Create a backend and the receiving end of its signal channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExecutionSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Mutex::new(BackendState::default()),
                next_id: AtomicU64::new(0),
                signals: tx,
            },
            rx,
        )
    }

    fn lock(&self) -> Result<MutexGuard<'_, BackendState>> {
        self.state.lock().map_err(poison_err)
    }

    /// Refuse the next `run_task` call with `rejection`.
    pub fn reject_next(&self, rejection: Rejection) -> Result<()> {
        self.lock()?.rejections.push_back(rejection);
        Ok(())
    }

    /// Every accepted request, in launch order.
    pub fn launched(&self) -> Result<Vec<(TaskHandle, LaunchRequest)>> {
        Ok(self.lock()?.launched.clone())
    }

    /// Every `stop_task` call, in order.
    pub fn stopped(&self) -> Result<Vec<(TaskHandle, String)>> {
        Ok(self.lock()?.stopped.clone())
    }

    /// Report that `handle` finished.
    pub fn complete(&self, handle: &TaskHandle, success: bool) {
        let _ = self.signals.send(ExecutionSignal::Exited {
            handle: handle.clone(),
            success,
            detail: (!success).then(|| "exit status 1".to_string()),
        });
    }

    /// Report that the capacity behind `handle` was reclaimed.
    pub fn interrupt(&self, handle: &TaskHandle, reason: &str) {
        let _ = self
            .signals
            .send(ExecutionSignal::Interrupted(InterruptionSignal {
                task_handle: handle.clone(),
                reason: reason.to_string(),
            }));
    }
}

#[async_trait]
impl ExecutionBackend for InMemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn new_handle(&self) -> TaskHandle {
        TaskHandle(format!("mem-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1))
    }

    async fn run_task(
        &self,
        handle: &TaskHandle,
        request: &LaunchRequest,
    ) -> std::result::Result<(), Rejection> {
        let mut state = self
            .lock()
            .map_err(|e| Rejection::retryable(e.to_string()))?;
        if let Some(rejection) = state.rejections.pop_front() {
            return Err(rejection);
        }
        state.launched.push((handle.clone(), request.clone()));
        Ok(())
    }

    async fn stop_task(&self, handle: &TaskHandle, reason: &str) -> Result<()> {
        self.lock()?
            .stopped
            .push((handle.clone(), reason.to_string()));
        Ok(())
    }
}
