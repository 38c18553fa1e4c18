//! Postgres-backed dispatch ledger.
//!
//! Admission relies on the primary key: `INSERT … ON CONFLICT DO NOTHING`
//! either creates the row or tells us someone else did. Transitions are
//! optimistic: `UPDATE … WHERE event_id = $id AND state = $from`, so of two
//! racing callers exactly one sees a row change.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::Db;
use crate::error::{Error, Result};
use crate::ledger::{
    Admission, DispatchLedger, HandleChange, Patch, check_transition, count_transition,
};
use crate::model::{CanonicalEvent, DispatchRecord, EventId, ResourceRef, State, TaskHandle};

const COLUMNS: &str = "event_id, source_account, bucket, object_key, event_kind, occurred_at, received_at, template, state, attempts, retry_ceiling, last_attempt_at, task_handle, last_error, created_at, updated_at";

/// Ledger stored in the `dispatch_records` table.
#[derive(Clone)]
pub struct PgLedger {
    db: Db,
}

impl PgLedger {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    async fn fetch(&self, id: &EventId) -> Result<Option<DispatchRecord>> {
        let row: Option<RecordRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM dispatch_records WHERE event_id = $1"
        ))
        .bind(&id.0)
        .fetch_optional(self.db.pool())
        .await?;
        row.map(RecordRow::try_into_record).transpose()
    }
}

#[async_trait]
impl DispatchLedger for PgLedger {
    async fn admit(
        &self,
        event: CanonicalEvent,
        template: &str,
        retry_ceiling: u32,
    ) -> Result<Admission> {
        let record = DispatchRecord::pending(event, template, retry_ceiling);
        let inserted: Option<(String,)> = sqlx::query_as(
            "INSERT INTO dispatch_records (event_id, source_account, bucket, object_key, event_kind, occurred_at, received_at, template, state, attempts, retry_ceiling, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', 0, $9, $10, $10)
             ON CONFLICT (event_id) DO NOTHING
             RETURNING event_id",
        )
        .bind(&record.event.id.0)
        .bind(&record.event.source_account)
        .bind(&record.event.resource.bucket)
        .bind(&record.event.resource.key)
        .bind(record.event.kind.to_string())
        .bind(record.event.occurred_at)
        .bind(record.event.received_at)
        .bind(&record.template)
        .bind(record.retry_ceiling as i32)
        .bind(record.created_at)
        .fetch_optional(self.db.pool())
        .await?;

        if inserted.is_some() {
            return Ok(Admission::Accepted(record));
        }
        let existing = self
            .fetch(record.id())
            .await?
            .ok_or_else(|| Error::NotFound(format!("dispatch record {}", record.id())))?;
        Ok(Admission::Duplicate(existing))
    }

    async fn get(&self, id: &EventId) -> Result<DispatchRecord> {
        self.fetch(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("dispatch record {id}")))
    }

    async fn find_by_handle(&self, handle: &TaskHandle) -> Result<Option<DispatchRecord>> {
        let row: Option<RecordRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM dispatch_records WHERE task_handle = $1"
        ))
        .bind(&handle.0)
        .fetch_optional(self.db.pool())
        .await?;
        row.map(RecordRow::try_into_record).transpose()
    }

    async fn transition(
        &self,
        id: &EventId,
        from: State,
        to: State,
        patch: Patch,
    ) -> Result<DispatchRecord> {
        // Validate against a fresh read first so callers get a precise error;
        // the WHERE clause below is what actually guards the race.
        let current = self.get(id).await?;
        check_transition(&current, from, to)?;

        let bump = i32::from(State::is_requeue(from, to));
        let (set_handle, handle) = match patch.handle {
            HandleChange::Keep => (false, current.task_handle.map(|h| h.0)),
            HandleChange::Set(h) => (true, Some(h.0)),
            HandleChange::Clear => (true, None),
        };

        let rows_affected = sqlx::query(
            "UPDATE dispatch_records
             SET state = $1,
                 attempts = attempts + $2,
                 last_attempt_at = CASE WHEN $1 = 'launching' THEN now() ELSE last_attempt_at END,
                 task_handle = CASE WHEN $3 THEN $4 ELSE task_handle END,
                 last_error = COALESCE($5, last_error),
                 updated_at = now()
             WHERE event_id = $6 AND state = $7 AND attempts + $2 <= retry_ceiling",
        )
        .bind(to.to_string())
        .bind(bump)
        .bind(set_handle)
        .bind(handle)
        .bind(patch.error)
        .bind(&id.0)
        .bind(from.to_string())
        .execute(self.db.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::InvalidTransition {
                event_id: id.clone(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        count_transition(from, to);
        self.get(id).await
    }

    async fn find_by_id_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<DispatchRecord>> {
        // Event ids are hex, so only the LIKE metacharacters need escaping.
        let pattern = format!(
            "{}%",
            prefix
                .to_ascii_lowercase()
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_")
        );
        let rows: Vec<RecordRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM dispatch_records
             WHERE event_id LIKE $1
             ORDER BY event_id
             LIMIT $2"
        ))
        .bind(pattern)
        .bind(limit as i64)
        .fetch_all(self.db.pool())
        .await?;
        rows.into_iter().map(RecordRow::try_into_record).collect()
    }

    async fn list(&self, state: Option<State>, limit: usize) -> Result<Vec<DispatchRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM dispatch_records
             WHERE ($1::text IS NULL OR state = $1)
             ORDER BY created_at, event_id
             LIMIT $2"
        ))
        .bind(state.map(|s| s.to_string()))
        .bind(limit as i64)
        .fetch_all(self.db.pool())
        .await?;
        rows.into_iter().map(RecordRow::try_into_record).collect()
    }

    async fn count_by_state(&self, states: &[State]) -> Result<usize> {
        let names: Vec<String> = states.iter().map(ToString::to_string).collect();
        let (count,): (i64,) =
            sqlx::query_as("SELECT count(*) FROM dispatch_records WHERE state = ANY($1)")
                .bind(&names)
                .fetch_one(self.db.pool())
                .await?;
        Ok(count as usize)
    }

    async fn attempted_before(
        &self,
        state: State,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DispatchRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM dispatch_records
             WHERE state = $1 AND last_attempt_at < $2
             ORDER BY last_attempt_at"
        ))
        .bind(state.to_string())
        .bind(cutoff)
        .fetch_all(self.db.pool())
        .await?;
        rows.into_iter().map(RecordRow::try_into_record).collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct RecordRow {
    event_id: String,
    source_account: String,
    bucket: String,
    object_key: String,
    event_kind: String,
    occurred_at: DateTime<Utc>,
    received_at: DateTime<Utc>,
    template: String,
    state: String,
    attempts: i32,
    retry_ceiling: i32,
    last_attempt_at: Option<DateTime<Utc>>,
    task_handle: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RecordRow {
    fn try_into_record(self) -> Result<DispatchRecord> {
        Ok(DispatchRecord {
            event: CanonicalEvent {
                id: EventId(self.event_id),
                source_account: self.source_account,
                resource: ResourceRef {
                    bucket: self.bucket,
                    key: self.object_key,
                },
                kind: self.event_kind.parse()?,
                occurred_at: self.occurred_at,
                received_at: self.received_at,
            },
            template: self.template,
            state: self.state.parse()?,
            attempts: self.attempts as u32,
            retry_ceiling: self.retry_ceiling as u32,
            last_attempt_at: self.last_attempt_at,
            task_handle: self.task_handle.map(TaskHandle),
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
