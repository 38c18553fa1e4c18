//! Integration tests for event normalization and identity.

use chrono::{TimeZone, Utc};
use dispatchd::error::Error;
use dispatchd::model::{EventId, EventKind, RawEvent, WireEvent};
use dispatchd::normalize::{event_id, normalize};

fn raw(account: &str, resource: &str, seq: Option<&str>) -> RawEvent {
    RawEvent {
        source_account: account.to_string(),
        resource_id: resource.to_string(),
        event_type: "ObjectCreated:Put".to_string(),
        sequence_token: seq.map(str::to_string),
        timestamp: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        assertion: None,
    }
}

#[test]
fn same_identity_normalizes_to_same_id() {
    let first = normalize(&raw("111122223333", "ingest/a.csv", Some("0001"))).unwrap();
    let mut later = raw("111122223333", "ingest/a.csv", Some("0001"));
    later.timestamp = Utc::now();
    let second = normalize(&later).unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.id.0.len(), 64);
}

#[test]
fn different_sequence_token_gives_different_id() {
    let a = normalize(&raw("111122223333", "ingest/a.csv", Some("0001"))).unwrap();
    let b = normalize(&raw("111122223333", "ingest/a.csv", Some("0002"))).unwrap();
    assert_ne!(a.id, b.id);
}

#[test]
fn field_boundaries_do_not_collide() {
    assert_ne!(event_id("a", "b/c", "1"), event_id("a/b", "c", "1"));
    assert_ne!(event_id("acct", "b/k", "12"), event_id("acct", "b/k1", "2"));
}

#[test]
fn missing_sequence_token_is_malformed() {
    let err = normalize(&raw("111122223333", "ingest/a.csv", None)).unwrap_err();
    assert!(matches!(err, Error::MalformedEvent(_)));

    let err = normalize(&raw("111122223333", "ingest/a.csv", Some("  "))).unwrap_err();
    assert!(matches!(err, Error::MalformedEvent(_)));
}

#[test]
fn resource_without_key_is_malformed() {
    let err = normalize(&raw("111122223333", "ingest", Some("1"))).unwrap_err();
    assert!(matches!(err, Error::MalformedEvent(_)));
    let err = normalize(&raw("111122223333", "ingest/", Some("1"))).unwrap_err();
    assert!(matches!(err, Error::MalformedEvent(_)));
}

#[test]
fn canonical_event_carries_parsed_fields() {
    let source = raw("111122223333", "ingest/2025/03/a.csv", Some("0001"));
    let event = normalize(&source).unwrap();

    assert_eq!(event.source_account, "111122223333");
    assert_eq!(event.resource.bucket, "ingest");
    assert_eq!(event.resource.key, "2025/03/a.csv");
    assert_eq!(event.kind, EventKind::Created);
    assert_eq!(event.occurred_at, source.timestamp);
    assert!(event.received_at >= event.occurred_at);
}

#[test]
fn event_kinds_parse_short_and_storage_names() {
    assert_eq!("created".parse::<EventKind>().unwrap(), EventKind::Created);
    assert_eq!(
        "ObjectRemoved:Delete".parse::<EventKind>().unwrap(),
        EventKind::Removed
    );
    assert!("ObjectRestore:Post".parse::<EventKind>().is_err());
}

#[test]
fn wire_event_requires_core_fields() {
    let wire = WireEvent {
        source_account: Some("111122223333".to_string()),
        resource_id: Some("ingest/a.csv".to_string()),
        event_type: None,
        sequence_token: Some("1".to_string()),
        timestamp: Some(Utc::now()),
        assertion: None,
    };
    let err = RawEvent::from_wire(wire).unwrap_err();
    assert!(matches!(err, Error::MalformedEvent(msg) if msg.contains("event_type")));
}

#[test]
fn event_id_parses_only_full_hex() {
    let id = event_id("a", "b/c", "1");
    let parsed: EventId = id.0.to_uppercase().parse().unwrap();
    assert_eq!(parsed, id);
    assert_eq!(id.to_string(), id.0);
    assert_eq!(id.short(), &id.0[..12]);
    assert!("abc123".parse::<EventId>().is_err());
}
