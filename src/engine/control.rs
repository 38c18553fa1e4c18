//! Control plane: runs the launch, reclaim and autoscale loops and routes
//! inbound messages and backend signals to them.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::dispatcher::Dispatcher;
use crate::autoscale::AutoscaleAdvisor;
use crate::error::{Error, Result};
use crate::model::{ExecutionSignal, InboundMessage, InterruptionSignal, UtilizationSample};

/// Capacity of the internal channels feeding the reclaimer and advisor.
const CHANNEL_DEPTH: usize = 256;

pub struct ControlPlane {
    dispatcher: Arc<Dispatcher>,
    advisor: Arc<AutoscaleAdvisor>,
    shutdown: watch::Sender<bool>,
}

impl ControlPlane {
    pub fn new(dispatcher: Arc<Dispatcher>, advisor: Arc<AutoscaleAdvisor>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            dispatcher,
            advisor,
            shutdown,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Signal every loop to stop. Safe to call more than once.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// A receiver that flips to `true` on shutdown, for loops feeding the
    /// inbox from outside.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Run until [`ControlPlane::shutdown`] is called.
    ///
    /// `inbox` carries events and operator signals; `signals` is the
    /// execution backend's completion/interruption channel.
    pub async fn run(
        &self,
        mut inbox: mpsc::Receiver<InboundMessage>,
        mut signals: mpsc::UnboundedReceiver<ExecutionSignal>,
    ) -> Result<()> {
        let launcher = self.dispatcher.launcher();
        let in_flight = launcher.seed_in_flight().await?;
        info!(
            in_flight,
            ceiling = launcher.ceiling().get(),
            backend = launcher.backend().name(),
            "control plane started"
        );

        let (interrupt_tx, interrupt_rx) = mpsc::channel::<InterruptionSignal>(CHANNEL_DEPTH);
        let (sample_tx, sample_rx) = mpsc::channel::<UtilizationSample>(CHANNEL_DEPTH);

        let reclaimer = Arc::clone(self.dispatcher.reclaimer());
        let reclaim_shutdown = self.shutdown.subscribe();
        let reclaim_task =
            tokio::spawn(async move { reclaimer.run(interrupt_rx, reclaim_shutdown).await });

        let advisor = Arc::clone(&self.advisor);
        let advisor_shutdown = self.shutdown.subscribe();
        let advisor_task =
            tokio::spawn(async move { advisor.run(sample_rx, advisor_shutdown).await });

        let dispatcher = Arc::clone(&self.dispatcher);
        let launch_shutdown = self.shutdown.subscribe();
        let launch_task =
            tokio::spawn(async move { dispatcher.run_launch_loop(launch_shutdown).await });

        let mut shutdown = self.shutdown.subscribe();
        let mut inbox_open = true;
        while !*shutdown.borrow() {
            tokio::select! {
                _ = shutdown.changed() => {}
                message = inbox.recv(), if inbox_open => match message {
                    Some(message) => self.route(message, &interrupt_tx, &sample_tx).await,
                    None => {
                        info!("inbox closed, still serving running tasks");
                        inbox_open = false;
                    }
                },
                signal = signals.recv() => match signal {
                    Some(signal) => self.on_execution_signal(signal, &interrupt_tx).await,
                    None => {
                        warn!("execution backend signal channel closed");
                        break;
                    }
                },
            }
        }

        info!("control plane shutting down");
        self.shutdown();
        for (name, task) in [
            ("reclaimer", reclaim_task),
            ("autoscale", advisor_task),
            ("launch", launch_task),
        ] {
            match task.await {
                Ok(Ok(())) => debug!(loop_name = name, "loop stopped"),
                Ok(Err(e)) => error!(loop_name = name, "loop failed: {e}"),
                Err(e) => error!(loop_name = name, "loop panicked: {e}"),
            }
        }
        Ok(())
    }

    async fn route(
        &self,
        message: InboundMessage,
        interrupts: &mpsc::Sender<InterruptionSignal>,
        samples: &mpsc::Sender<UtilizationSample>,
    ) {
        match message {
            InboundMessage::Event {
                declared_account,
                event,
            } => match self.dispatcher.ingest_wire(event, &declared_account).await {
                Ok(_) => {}
                // Audited by the gate and the dispatcher respectively.
                Err(Error::Denied { .. } | Error::MalformedEvent(_)) => {}
                Err(e @ Error::Unroutable { .. }) => {
                    warn!(%declared_account, "event dropped: {e}");
                }
                Err(e) => error!(%declared_account, "ingest failed: {e}"),
            },
            InboundMessage::Interruption(signal) => {
                if interrupts.send(signal).await.is_err() {
                    warn!("reclaimer gone, interruption dropped");
                }
            }
            InboundMessage::Completion {
                task_handle,
                success,
                detail,
            } => {
                if let Err(e) = self.dispatcher.finish(&task_handle, success, detail).await {
                    error!(handle = %task_handle, "completion handling failed: {e}");
                }
            }
            InboundMessage::Utilization(sample) => {
                if samples.send(sample).await.is_err() {
                    warn!("autoscale advisor gone, sample dropped");
                }
            }
            InboundMessage::Cancel { event_id, reason } => {
                if let Err(e) = self.dispatcher.cancel(&event_id, &reason).await {
                    warn!(event_id = event_id.short(), "cancel failed: {e}");
                }
            }
        }
    }

    async fn on_execution_signal(
        &self,
        signal: ExecutionSignal,
        interrupts: &mpsc::Sender<InterruptionSignal>,
    ) {
        match signal {
            ExecutionSignal::Exited {
                handle,
                success,
                detail,
            } => {
                if let Err(e) = self.dispatcher.finish(&handle, success, detail).await {
                    error!(%handle, "completion handling failed: {e}");
                }
            }
            ExecutionSignal::Interrupted(signal) => {
                if interrupts.send(signal).await.is_err() {
                    warn!("reclaimer gone, interruption dropped");
                }
            }
        }
    }
}
