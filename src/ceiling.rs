//! The process-wide concurrency ceiling.
//!
//! One atomically-updated integer bounded by a configured `[min, max]`.
//! The autoscale advisor writes it; the launcher reads it before every
//! launch decision and waits on [`ConcurrencyCeiling::changed`] when full.

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use tracing::info;

use crate::error::{Error, Result};
use crate::telemetry::metrics;

#[derive(Debug)]
pub struct ConcurrencyCeiling {
    value: AtomicUsize,
    min: usize,
    max: usize,
    changed: Notify,
}

impl ConcurrencyCeiling {
    /// Create a ceiling starting at `initial`, clamped into `[min, max]`.
    pub fn new(initial: usize, min: usize, max: usize) -> Result<Self> {
        if min > max {
            return Err(Error::Config(format!(
                "ceiling minimum {min} exceeds maximum {max}"
            )));
        }
        Ok(Self {
            value: AtomicUsize::new(initial.clamp(min, max)),
            min,
            max,
            changed: Notify::new(),
        })
    }

    pub fn get(&self) -> usize {
        self.value.load(Ordering::Acquire)
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Set the ceiling, clamped into bounds. Returns the value stored.
    pub fn set(&self, value: usize) -> usize {
        let value = value.clamp(self.min, self.max);
        let previous = self.value.swap(value, Ordering::AcqRel);
        if previous != value {
            info!(from = previous, to = value, "concurrency ceiling changed");
            metrics::concurrency_ceiling().record(value as u64, &[]);
            self.changed.notify_waiters();
        }
        value
    }

    /// Resolves on the next change. Create it before checking capacity so a
    /// change in between is not missed.
    pub fn changed(&self) -> tokio::sync::futures::Notified<'_> {
        self.changed.notified()
    }
}
