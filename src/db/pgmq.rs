//! pgmq queue operations via direct SQLx.
//!
//! Calls pgmq's SQL functions. Handled messages are archived, never
//! deleted.

use crate::error::Result;

/// Queue carrying [`crate::model::InboundMessage`] payloads.
pub const INBOX_QUEUE: &str = "dispatch_inbox";

/// A message read from a pgmq queue.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PgmqMessage {
    pub msg_id: i64,
    /// Times this message has been handed out, including this read.
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub message: serde_json::Value,
}

impl super::Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Enqueue for immediate delivery. Returns the message ID.
    pub async fn send_to_queue(
        &self,
        queue_name: &str,
        payload: &serde_json::Value,
    ) -> Result<i64> {
        let (msg_id,): (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, 0)")
            .bind(queue_name)
            .bind(payload)
            .fetch_one(self.pool())
            .await?;
        Ok(msg_id)
    }

    /// Read up to `batch` messages, hiding them from other readers for
    /// `vt_seconds`. An empty queue yields an empty vec.
    pub async fn read_from_queue(
        &self,
        queue_name: &str,
        vt_seconds: i32,
        batch: i32,
    ) -> Result<Vec<PgmqMessage>> {
        let messages = sqlx::query_as::<_, PgmqMessage>(
            "SELECT msg_id, read_ct, enqueued_at, message FROM pgmq.read($1, $2, $3)",
        )
        .bind(queue_name)
        .bind(vt_seconds)
        .bind(batch)
        .fetch_all(self.pool())
        .await?;
        Ok(messages)
    }

    /// Move a handled message to the queue's archive table.
    pub async fn archive_message(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
