//! Bridge from the pgmq inbox to the control plane's channel.
//!
//! Each message is archived once it has been handed to the channel. A
//! payload that does not parse is archived too (it would never parse on a
//! later read) and logged at error level.

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::Db;
use super::pgmq::INBOX_QUEUE;
use crate::error::Result;
use crate::model::InboundMessage;

/// How the inbox is polled.
#[derive(Debug, Clone)]
pub struct InboxConfig {
    /// Visibility timeout for reads, in seconds.
    pub visibility_timeout: i32,
    pub batch: i32,
    pub poll_interval: Duration,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: 30,
            batch: 16,
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl Db {
    /// Enqueue an inbound message.
    pub async fn push_inbox(&self, message: &InboundMessage) -> Result<i64> {
        let payload = serde_json::to_value(message)
            .map_err(|e| crate::error::Error::Other(format!("serialize inbox message: {e}")))?;
        self.send_to_queue(INBOX_QUEUE, &payload).await
    }

    /// Drain one batch into `tx`. Returns how many messages were forwarded.
    pub async fn drain_inbox(
        &self,
        config: &InboxConfig,
        tx: &mpsc::Sender<InboundMessage>,
    ) -> Result<usize> {
        let messages = self
            .read_from_queue(INBOX_QUEUE, config.visibility_timeout, config.batch)
            .await?;
        let mut forwarded = 0;
        for msg in messages {
            match serde_json::from_value::<InboundMessage>(msg.message) {
                Ok(inbound) => {
                    if tx.send(inbound).await.is_err() {
                        // Receiver gone; leave the message for the next process.
                        return Ok(forwarded);
                    }
                    forwarded += 1;
                }
                Err(e) => {
                    error!(
                        msg_id = msg.msg_id,
                        read_ct = msg.read_ct,
                        "unparsable inbox message: {e}"
                    );
                }
            }
            self.archive_message(INBOX_QUEUE, msg.msg_id).await?;
        }
        if forwarded > 0 {
            debug!(forwarded, "inbox drained");
        }
        Ok(forwarded)
    }

    /// Poll the inbox until `shutdown` flips or the receiver is dropped.
    pub async fn run_inbox(
        &self,
        config: InboxConfig,
        tx: mpsc::Sender<InboundMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(queue = INBOX_QUEUE, "inbox poller started");
        loop {
            if tx.is_closed() || *shutdown.borrow() {
                return Ok(());
            }
            let forwarded = match self.drain_inbox(&config, &tx).await {
                Ok(n) => n,
                Err(e) => {
                    warn!("inbox read failed: {e}");
                    0
                }
            };
            if forwarded > 0 {
                continue;
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("inbox poller shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(config.poll_interval) => {}
            }
        }
    }
}
