//! Integration tests for the cross-account policy gate.

use chrono::Utc;
use dispatchd::gate::{
    AccountPolicy, AssertionVerifier, Authorizer, Decision, DenyReason, PolicyGate,
};
use dispatchd::model::RawEvent;
use secrecy::SecretString;

const PARTNER: &str = "111122223333";

fn raw(account: &str, resource: &str) -> RawEvent {
    RawEvent {
        source_account: account.to_string(),
        resource_id: resource.to_string(),
        event_type: "ObjectCreated:Put".to_string(),
        sequence_token: Some("0001".to_string()),
        timestamp: Utc::now(),
        assertion: None,
    }
}

fn policy() -> AccountPolicy {
    AccountPolicy::new().allow(PARTNER, ["ingest/incoming/", "reports/"])
}

#[test]
fn allowed_account_and_prefix_is_authorized() {
    let gate = PolicyGate::new(policy(), None);
    let decision = gate.authorize(&raw(PARTNER, "ingest/incoming/a.csv"), PARTNER);
    assert_eq!(decision, Decision::Authorized);
    assert!(decision.is_authorized());
}

#[test]
fn declared_account_mismatch_is_denied() {
    let gate = PolicyGate::new(policy(), None);
    let decision = gate.authorize(&raw(PARTNER, "ingest/incoming/a.csv"), "999999999999");
    assert_eq!(
        decision,
        Decision::Denied(DenyReason::AccountMismatch {
            declared: "999999999999".to_string()
        })
    );
}

#[test]
fn unknown_account_is_denied() {
    let gate = PolicyGate::new(policy(), None);
    let decision = gate.authorize(&raw("444455556666", "ingest/incoming/a.csv"), "444455556666");
    assert_eq!(decision, Decision::Denied(DenyReason::UnknownAccount));
}

#[test]
fn resource_outside_prefixes_is_denied() {
    let gate = PolicyGate::new(policy(), None);
    let decision = gate.authorize(&raw(PARTNER, "ingest/archive/a.csv"), PARTNER);
    assert_eq!(decision, Decision::Denied(DenyReason::PrefixNotAllowed));
}

#[test]
fn policy_loads_from_toml() {
    let policy = AccountPolicy::from_toml(
        r#"
[[account]]
id = "111122223333"
prefixes = ["ingest/"]

[[account]]
id = "444455556666"
prefixes = ["reports/daily/", "reports/weekly/"]
"#,
    )
    .unwrap();

    assert_eq!(policy.len(), 2);
    assert_eq!(policy.prefixes("444455556666").unwrap().len(), 2);
    assert!(policy.prefixes("000000000000").is_none());
}

#[test]
fn policy_file_that_does_not_parse_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("policy.toml");
    std::fs::write(&path, "[[account]]\nid = 12\n").unwrap();
    assert!(AccountPolicy::load_from_file(&path).is_err());
}

#[test]
fn signed_event_passes_assertion_check() {
    let key = SecretString::from("test-signing-key".to_string());
    let signer = AssertionVerifier::new(key.clone());
    let gate = PolicyGate::new(policy(), Some(AssertionVerifier::new(key)));

    let mut event = raw(PARTNER, "reports/q1.pdf");
    event.assertion = signer.sign(&event);
    assert!(event.assertion.is_some());

    assert_eq!(gate.authorize(&event, PARTNER), Decision::Authorized);
}

#[test]
fn missing_or_forged_assertion_is_denied() {
    let gate = PolicyGate::new(
        policy(),
        Some(AssertionVerifier::new(SecretString::from("test-signing-key".to_string()))),
    );

    let unsigned = raw(PARTNER, "reports/q1.pdf");
    assert_eq!(
        gate.authorize(&unsigned, PARTNER),
        Decision::Denied(DenyReason::MissingAssertion)
    );

    let mut forged = raw(PARTNER, "reports/q1.pdf");
    forged.assertion =
        AssertionVerifier::new(SecretString::from("some-other-key".to_string())).sign(&forged);
    assert!(matches!(
        gate.authorize(&forged, PARTNER),
        Decision::Denied(DenyReason::InvalidAssertion(_))
    ));
}

#[test]
fn assertion_is_bound_to_the_event() {
    let key = SecretString::from("test-signing-key".to_string());
    let verifier = AssertionVerifier::new(key);

    let original = raw(PARTNER, "reports/q1.pdf");
    let assertion = verifier.sign(&original).unwrap();

    let mut replayed = raw(PARTNER, "reports/q2.pdf");
    replayed.timestamp = original.timestamp;
    assert!(verifier.verify(&original, &assertion).is_ok());
    assert!(verifier.verify(&replayed, &assertion).is_err());
}

/// Test double: a predicate that denies everything.
struct DenyAll;

impl Authorizer for DenyAll {
    fn evaluate(&self, _raw: &RawEvent, _declared_account: &str) -> Decision {
        Decision::Denied(DenyReason::UnknownAccount)
    }
}

#[test]
fn authorizer_is_swappable() {
    let gate: Box<dyn Authorizer> = Box::new(DenyAll);
    assert!(!gate.authorize(&raw(PARTNER, "ingest/incoming/a.csv"), PARTNER).is_authorized());
}
