//! Local process backend: each task is a child process running the
//! template's reference as a command.
//!
//! Every task gets its own working directory holding `launch.json` (the
//! request). The child sees the request's environment bindings plus
//! `DISPATCH_TASK_DIR` and `DISPATCH_IDENTITY`. A child killed by a signal it
//! did not get from us is reported as an interruption, the local stand-in
//! for reclaimed capacity.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ExecutionBackend, LaunchRequest, Rejection};
use crate::error::{Error, Result};
use crate::model::{ExecutionSignal, InterruptionSignal, TaskHandle};

type StopSenders = Arc<Mutex<HashMap<TaskHandle, oneshot::Sender<String>>>>;

pub struct ProcessBackend {
    base_dir: PathBuf,
    running: StopSenders,
    signals: mpsc::UnboundedSender<ExecutionSignal>,
}

impl ProcessBackend {
    /// Create a backend rooted at `base_dir` and the receiving end of its
    /// signal channel.
    pub fn new(base_dir: impl Into<PathBuf>) -> (Self, mpsc::UnboundedReceiver<ExecutionSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                base_dir: base_dir.into(),
                running: Arc::new(Mutex::new(HashMap::new())),
                signals: tx,
            },
            rx,
        )
    }

    /// Number of children currently alive.
    pub fn running(&self) -> usize {
        self.running.lock().map(|m| m.len()).unwrap_or(0)
    }

    async fn prepare_dir(&self, handle: &TaskHandle, request: &LaunchRequest) -> Result<PathBuf> {
        let dir = self.base_dir.join(&handle.0);
        tokio::fs::create_dir_all(&dir).await?;
        let json = serde_json::to_string_pretty(request)
            .map_err(|e| Error::Other(format!("serialize launch request: {e}")))?;
        tokio::fs::write(dir.join("launch.json"), json).await?;
        Ok(dir)
    }
}

/// Resolve relative commands against the process CWD rather than the task
/// dir; `Command::current_dir` would otherwise make them relative to it.
fn resolve_command(reference: &str) -> std::io::Result<PathBuf> {
    let command = Path::new(reference);
    if command.is_relative() && command.components().count() > 1 {
        Ok(std::env::current_dir()?.join(command))
    } else {
        Ok(command.to_path_buf())
    }
}

#[cfg(unix)]
fn killed_by_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt as _;
    status.signal()
}

#[cfg(not(unix))]
fn killed_by_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    fn new_handle(&self) -> TaskHandle {
        TaskHandle(format!("proc-{}", Uuid::new_v4().simple()))
    }

    async fn run_task(
        &self,
        handle: &TaskHandle,
        request: &LaunchRequest,
    ) -> std::result::Result<(), Rejection> {
        let command = resolve_command(&request.template_reference)
            .map_err(|e| Rejection::retryable(format!("resolve command: {e}")))?;
        let dir = self
            .prepare_dir(handle, request)
            .await
            .map_err(|e| Rejection::retryable(format!("prepare task dir: {e}")))?;

        let spawned = Command::new(&command)
            .current_dir(&dir)
            .envs(&request.environment)
            .env("DISPATCH_TASK_DIR", &dir)
            .env("DISPATCH_IDENTITY", &request.identity)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                    warn!(%handle, "cleanup error: {cleanup}");
                }
                return Err(match e.kind() {
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                        Rejection::fatal(format!("cannot execute {}: {e}", command.display()))
                    }
                    _ => Rejection::retryable(format!("spawn {}: {e}", command.display())),
                });
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel::<String>();
        if let Ok(mut running) = self.running.lock() {
            running.insert(handle.clone(), stop_tx);
        }

        debug!(%handle, command = %command.display(), dir = %dir.display(), "child spawned");

        let running = Arc::clone(&self.running);
        let signals = self.signals.clone();
        let task_handle = handle.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let signal = tokio::select! {
                status = child.wait() => Some(match status {
                    Ok(status) => match killed_by_signal(&status) {
                        Some(sig) => ExecutionSignal::Interrupted(InterruptionSignal {
                            task_handle: task_handle.clone(),
                            reason: format!("terminated by signal {sig}"),
                        }),
                        None => ExecutionSignal::Exited {
                            handle: task_handle.clone(),
                            success: status.success(),
                            detail: (!status.success())
                                .then(|| format!("exit status {}", status.code().unwrap_or(-1))),
                        },
                    },
                    Err(e) => ExecutionSignal::Exited {
                        handle: task_handle.clone(),
                        success: false,
                        detail: Some(format!("wait failed: {e}")),
                    },
                }),
                Ok(reason) = stop_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(handle = %task_handle, "kill failed: {e}");
                    }
                    info!(handle = %task_handle, %reason, "child stopped");
                    None
                }
            };

            if let Ok(mut running) = running.lock() {
                running.remove(&task_handle);
            }
            debug!(
                handle = %task_handle,
                duration_ms = started.elapsed().as_millis() as u64,
                "child exited"
            );
            if let Some(signal) = signal {
                let _ = signals.send(signal);
            }
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!(handle = %task_handle, "cleanup error: {e}");
            }
        });

        Ok(())
    }

    async fn stop_task(&self, handle: &TaskHandle, reason: &str) -> Result<()> {
        let sender = self
            .running
            .lock()
            .map_err(|_| Error::Other("process table lock poisoned".to_string()))?
            .remove(handle);
        match sender {
            Some(tx) => {
                let _ = tx.send(reason.to_string());
            }
            None => debug!(%handle, "stop requested for a task that is not running"),
        }
        Ok(())
    }
}
