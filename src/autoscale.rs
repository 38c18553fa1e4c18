//! Autoscale advisor: turns utilization samples and the pending backlog into
//! a new concurrency ceiling.
//!
//! Backlog is the only thing that raises the ceiling, so a minimum of zero
//! means "launch nothing until an event arrives".

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::ceiling::ConcurrencyCeiling;
use crate::error::Result;
use crate::ledger::DispatchLedger;
use crate::model::{State, UtilizationSample};

#[derive(Debug, Clone)]
pub struct AutoscalePolicy {
    pub target_cpu_pct: f64,
    pub target_mem_pct: f64,
    /// How far the ceiling moves per decision.
    pub step: usize,
    /// Re-evaluate this often even without new samples.
    pub tick_interval: Duration,
}

impl Default for AutoscalePolicy {
    fn default() -> Self {
        Self {
            target_cpu_pct: 70.0,
            target_mem_pct: 70.0,
            step: 1,
            tick_interval: Duration::from_secs(15),
        }
    }
}

/// Direction of one advisor decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    /// Headroom and work waiting.
    Increase,
    /// Over target on CPU or memory.
    Decrease,
    /// Nothing waiting; drift back toward the minimum.
    Decay,
    Hold,
}

impl AutoscalePolicy {
    pub fn decide(&self, sample: UtilizationSample, backlog: usize) -> Adjustment {
        let over = sample.cpu_pct > self.target_cpu_pct || sample.mem_pct > self.target_mem_pct;
        let under = sample.cpu_pct < self.target_cpu_pct && sample.mem_pct < self.target_mem_pct;
        if over {
            Adjustment::Decrease
        } else if under && backlog > 0 {
            Adjustment::Increase
        } else if under && backlog == 0 {
            Adjustment::Decay
        } else {
            Adjustment::Hold
        }
    }

    /// The ceiling after applying `adjustment` to `current`, before clamping.
    pub fn apply(&self, current: usize, adjustment: Adjustment) -> usize {
        match adjustment {
            Adjustment::Increase => current.saturating_add(self.step),
            Adjustment::Decrease | Adjustment::Decay => current.saturating_sub(self.step),
            Adjustment::Hold => current,
        }
    }
}

pub struct AutoscaleAdvisor {
    ceiling: Arc<ConcurrencyCeiling>,
    ledger: Arc<dyn DispatchLedger>,
    policy: AutoscalePolicy,
    last_sample: Mutex<UtilizationSample>,
}

impl AutoscaleAdvisor {
    pub fn new(
        ceiling: Arc<ConcurrencyCeiling>,
        ledger: Arc<dyn DispatchLedger>,
        policy: AutoscalePolicy,
    ) -> Self {
        Self {
            ceiling,
            ledger,
            policy,
            last_sample: Mutex::new(UtilizationSample::default()),
        }
    }

    pub fn policy(&self) -> &AutoscalePolicy {
        &self.policy
    }

    /// Remember `sample` and recompute the ceiling.
    pub async fn observe(&self, sample: UtilizationSample) -> Result<usize> {
        if let Ok(mut last) = self.last_sample.lock() {
            *last = sample;
        }
        self.tick().await
    }

    /// Recompute the ceiling from the latest sample and current backlog.
    /// Returns the ceiling now in force.
    pub async fn tick(&self) -> Result<usize> {
        let sample = self
            .last_sample
            .lock()
            .map(|s| *s)
            .unwrap_or_default();
        let backlog = self.ledger.count_by_state(&[State::Pending]).await?;
        let current = self.ceiling.get();
        let adjustment = self.policy.decide(sample, backlog);
        let mut target = self.policy.apply(current, adjustment);
        if adjustment == Adjustment::Decay {
            // Idle decay never drops below work already running.
            let in_flight = self
                .ledger
                .count_by_state(&[State::Launching, State::Running])
                .await?;
            target = target.max(in_flight.min(current));
        }
        let next = self.ceiling.set(target);
        debug!(
            cpu_pct = sample.cpu_pct,
            mem_pct = sample.mem_pct,
            backlog,
            ?adjustment,
            from = current,
            to = next,
            "autoscale tick"
        );
        Ok(next)
    }

    /// Consume samples and tick periodically until shutdown.
    pub async fn run(
        &self,
        mut samples: mpsc::Receiver<UtilizationSample>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(self.policy.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            min = self.ceiling.min(),
            max = self.ceiling.max(),
            target_cpu_pct = self.policy.target_cpu_pct,
            target_mem_pct = self.policy.target_mem_pct,
            "autoscale advisor started"
        );

        loop {
            let result = tokio::select! {
                _ = shutdown.changed() => {
                    info!("autoscale advisor shutting down");
                    return Ok(());
                }
                sample = samples.recv() => match sample {
                    Some(sample) => self.observe(sample).await,
                    None => return Ok(()),
                },
                _ = ticker.tick() => self.tick().await,
            };
            if let Err(e) = result {
                error!("autoscale tick failed: {e}");
            }
        }
    }
}
