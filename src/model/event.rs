//! Inbound notification types: wire form, raw form, canonical form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Wire / Raw
// ---------------------------------------------------------------------------

/// A storage-change notification exactly as it arrived. Every field is
/// optional here; [`RawEvent::from_wire`] enforces presence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireEvent {
    pub source_account: Option<String>,
    pub resource_id: Option<String>,
    pub event_type: Option<String>,
    pub sequence_token: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Signature over the notification, issued in the source account.
    pub assertion: Option<String>,
}

/// An unprocessed notification from the source account's object store.
///
/// Immutable once received. The sequence token stays optional at this layer;
/// the normalizer is the one that refuses to work without it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub source_account: String,
    pub resource_id: String,
    pub event_type: String,
    pub sequence_token: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub assertion: Option<String>,
}

impl RawEvent {
    /// Validate required fields on a wire event.
    pub fn from_wire(wire: WireEvent) -> Result<Self> {
        Ok(Self {
            source_account: required(wire.source_account, "source_account")?,
            resource_id: required(wire.resource_id, "resource_id")?,
            event_type: required(wire.event_type, "event_type")?,
            sequence_token: wire.sequence_token,
            timestamp: wire
                .timestamp
                .ok_or_else(|| Error::MalformedEvent("missing field: timestamp".to_string()))?,
            assertion: wire.assertion,
        })
    }
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(Error::MalformedEvent(format!("missing field: {field}"))),
    }
}

// ---------------------------------------------------------------------------
// Canonical
// ---------------------------------------------------------------------------

/// Deterministic event identifier (hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    /// Short form for log fields: first 12 hex chars. `Display` prints the
    /// full id.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for EventId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(Self(s.to_ascii_lowercase()))
        } else {
            Err(Error::Other(format!("not an event id: {s}")))
        }
    }
}

/// What happened to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Removed,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Created => "created",
            EventKind::Removed => "removed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for EventKind {
    type Err = Error;

    /// Accepts the short names plus storage-style names such as
    /// `ObjectCreated:Put` or `ObjectRemoved:Delete`.
    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        if lower == "created" || lower.starts_with("objectcreated") {
            Ok(EventKind::Created)
        } else if lower == "removed" || lower.starts_with("objectremoved") {
            Ok(EventKind::Removed)
        } else {
            Err(Error::MalformedEvent(format!("unknown event type: {s}")))
        }
    }
}

/// Bucket + key of the object an event refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub bucket: String,
    pub key: String,
}

impl ResourceRef {
    /// Parse `bucket/key`. Both halves must be non-empty; the key may itself
    /// contain slashes.
    pub fn parse(resource_id: &str) -> Result<Self> {
        match resource_id.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok(Self {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            _ => Err(Error::MalformedEvent(format!(
                "resource id must be bucket/key: {resource_id}"
            ))),
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Normalized internal form of a notification. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub id: EventId,
    pub source_account: String,
    pub resource: ResourceRef,
    pub kind: EventKind,
    /// When the object store says the change happened.
    pub occurred_at: DateTime<Utc>,
    /// When this process normalized it.
    pub received_at: DateTime<Utc>,
}
