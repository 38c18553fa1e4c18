//! Raw notification → canonical event.
//!
//! The event id is a hash over (source account, resource id, sequence token),
//! so a redelivered notification normalizes to the same id and the ledger
//! can drop it.

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::model::{CanonicalEvent, EventId, EventKind, RawEvent, ResourceRef};

/// Field separator inside the hashed material. Cannot appear in account ids
/// or sequence tokens, so ("a", "b/c") and ("a/b", "c") never collide.
const UNIT_SEPARATOR: u8 = 0x1f;

/// Deterministic id for a notification.
pub fn event_id(source_account: &str, resource_id: &str, sequence_token: &str) -> EventId {
    let mut hasher = Sha256::new();
    hasher.update(source_account.as_bytes());
    hasher.update([UNIT_SEPARATOR]);
    hasher.update(resource_id.as_bytes());
    hasher.update([UNIT_SEPARATOR]);
    hasher.update(sequence_token.as_bytes());
    EventId(format!("{:x}", hasher.finalize()))
}

/// Convert a raw event into exactly one canonical event.
///
/// # Errors
///
/// `MalformedEvent` when the sequence token is missing or blank, the
/// resource id is not `bucket/key`, or the event type is unknown.
pub fn normalize(raw: &RawEvent) -> Result<CanonicalEvent> {
    let sequence_token = raw
        .sequence_token
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| {
            Error::MalformedEvent(format!(
                "missing sequence token for {} from {}",
                raw.resource_id, raw.source_account
            ))
        })?;

    let resource = ResourceRef::parse(&raw.resource_id)?;
    let kind: EventKind = raw.event_type.parse()?;

    Ok(CanonicalEvent {
        id: event_id(&raw.source_account, &raw.resource_id, sequence_token),
        source_account: raw.source_account.clone(),
        resource,
        kind,
        occurred_at: raw.timestamp,
        received_at: Utc::now(),
    })
}
