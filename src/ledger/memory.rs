//! In-process ledger.
//!
//! A single mutex guards both the records and the handle index, so admit
//! and every transition are atomic. Not durable: records vanish with the
//! process. Used by tests and by `serve --stdin`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{Admission, DispatchLedger, HandleChange, Patch, check_transition, count_transition};
use crate::error::{Error, Result};
use crate::model::{CanonicalEvent, DispatchRecord, EventId, State, TaskHandle};

#[derive(Debug, Default)]
struct LedgerState {
    records: HashMap<EventId, DispatchRecord>,
    by_handle: HashMap<TaskHandle, EventId>,
}

#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::Other("ledger lock poisoned".to_string())
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerState>> {
        self.state.lock().map_err(poison_err)
    }
}

#[async_trait]
impl DispatchLedger for MemoryLedger {
    async fn admit(
        &self,
        event: CanonicalEvent,
        template: &str,
        retry_ceiling: u32,
    ) -> Result<Admission> {
        let mut state = self.lock()?;
        if let Some(existing) = state.records.get(&event.id) {
            return Ok(Admission::Duplicate(existing.clone()));
        }
        let record = DispatchRecord::pending(event, template, retry_ceiling);
        state.records.insert(record.id().clone(), record.clone());
        Ok(Admission::Accepted(record))
    }

    async fn get(&self, id: &EventId) -> Result<DispatchRecord> {
        self.lock()?
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("dispatch record {id}")))
    }

    async fn find_by_handle(&self, handle: &TaskHandle) -> Result<Option<DispatchRecord>> {
        let state = self.lock()?;
        Ok(state
            .by_handle
            .get(handle)
            .and_then(|id| state.records.get(id))
            .cloned())
    }

    async fn transition(
        &self,
        id: &EventId,
        from: State,
        to: State,
        patch: Patch,
    ) -> Result<DispatchRecord> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("dispatch record {id}")))?;
        check_transition(record, from, to)?;

        let now = Utc::now();
        record.state = to;
        record.updated_at = now;
        if State::is_requeue(from, to) {
            record.attempts += 1;
        }
        if to == State::Launching {
            record.last_attempt_at = Some(now);
        }
        if let Some(error) = patch.error {
            record.last_error = Some(error);
        }
        match patch.handle {
            HandleChange::Keep => {}
            HandleChange::Set(handle) => {
                if let Some(old) = record.task_handle.replace(handle.clone()) {
                    state.by_handle.remove(&old);
                }
                state.by_handle.insert(handle, id.clone());
            }
            HandleChange::Clear => {
                if let Some(old) = record.task_handle.take() {
                    state.by_handle.remove(&old);
                }
            }
        }

        count_transition(from, to);
        Ok(record.clone())
    }

    async fn find_by_id_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<DispatchRecord>> {
        let prefix = prefix.to_ascii_lowercase();
        let guard = self.lock()?;
        let mut records: Vec<DispatchRecord> = guard
            .records
            .values()
            .filter(|r| r.id().0.starts_with(&prefix))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id().cmp(b.id()));
        records.truncate(limit);
        Ok(records)
    }

    async fn list(&self, state: Option<State>, limit: usize) -> Result<Vec<DispatchRecord>> {
        let guard = self.lock()?;
        let mut records: Vec<DispatchRecord> = guard
            .records
            .values()
            .filter(|r| state.is_none_or(|s| r.state == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id().cmp(b.id()))
        });
        records.truncate(limit);
        Ok(records)
    }

    async fn count_by_state(&self, states: &[State]) -> Result<usize> {
        Ok(self
            .lock()?
            .records
            .values()
            .filter(|r| states.contains(&r.state))
            .count())
    }

    async fn attempted_before(
        &self,
        state: State,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DispatchRecord>> {
        let mut records: Vec<DispatchRecord> = self
            .lock()?
            .records
            .values()
            .filter(|r| r.state == state && r.last_attempt_at.is_some_and(|t| t < cutoff))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.last_attempt_at);
        Ok(records)
    }
}
