//! Credential/policy gate for events crossing the account boundary.
//!
//! The gate is injected into the dispatcher as a trait object so tests can
//! swap in a double that allows or denies deterministically. Every decision
//! goes through [`Authorizer::authorize`], which writes the audit entry.

pub mod assertion;

use opentelemetry::KeyValue;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::RawEvent;
use crate::telemetry::metrics;

pub use assertion::AssertionVerifier;

/// Outcome of a gate check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Authorized,
    Denied(DenyReason),
}

impl Decision {
    pub fn is_authorized(&self) -> bool {
        matches!(self, Decision::Authorized)
    }
}

/// Why an event was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// The transport's account differs from the one inside the event.
    AccountMismatch { declared: String },
    /// The source account is not on the allow-list.
    UnknownAccount,
    /// The account may not trigger work for this resource.
    PrefixNotAllowed,
    /// An assertion is required and none was attached.
    MissingAssertion,
    /// The attached assertion failed validation.
    InvalidAssertion(String),
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::AccountMismatch { declared } => {
                write!(f, "declared account {declared} does not match event")
            }
            DenyReason::UnknownAccount => write!(f, "account not on allow-list"),
            DenyReason::PrefixNotAllowed => write!(f, "resource outside allowed prefixes"),
            DenyReason::MissingAssertion => write!(f, "missing identity assertion"),
            DenyReason::InvalidAssertion(e) => write!(f, "invalid identity assertion: {e}"),
        }
    }
}

impl DenyReason {
    fn label(&self) -> &'static str {
        match self {
            DenyReason::AccountMismatch { .. } => "account_mismatch",
            DenyReason::UnknownAccount => "unknown_account",
            DenyReason::PrefixNotAllowed => "prefix_not_allowed",
            DenyReason::MissingAssertion => "missing_assertion",
            DenyReason::InvalidAssertion(_) => "invalid_assertion",
        }
    }
}

/// Decides whether an event may cross into this account.
pub trait Authorizer: Send + Sync {
    /// Evaluate the event. No side effects.
    fn evaluate(&self, raw: &RawEvent, declared_account: &str) -> Decision;

    /// Evaluate and write the audit entry.
    fn authorize(&self, raw: &RawEvent, declared_account: &str) -> Decision {
        let decision = self.evaluate(raw, declared_account);
        audit(raw, declared_account, &decision);
        decision
    }
}

fn audit(raw: &RawEvent, declared_account: &str, decision: &Decision) {
    match decision {
        Decision::Authorized => {
            info!(
                target: "audit",
                account = %raw.source_account,
                declared_account,
                resource_id = %raw.resource_id,
                sequence_token = raw.sequence_token.as_deref().unwrap_or("-"),
                decision = "authorized",
                "gate decision"
            );
            metrics::gate_decisions().add(1, &[KeyValue::new("decision", "authorized")]);
        }
        Decision::Denied(reason) => {
            warn!(
                target: "audit",
                account = %raw.source_account,
                declared_account,
                resource_id = %raw.resource_id,
                sequence_token = raw.sequence_token.as_deref().unwrap_or("-"),
                decision = "denied",
                %reason,
                alert = true,
                "gate decision"
            );
            metrics::gate_decisions().add(
                1,
                &[
                    KeyValue::new("decision", "denied"),
                    KeyValue::new("reason", reason.label()),
                ],
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Account policy
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    account: Vec<AccountEntry>,
}

#[derive(Debug, Deserialize)]
struct AccountEntry {
    id: String,
    prefixes: Vec<String>,
}

/// Mapping of source account → resource-id prefixes it may trigger work for.
#[derive(Debug, Clone, Default)]
pub struct AccountPolicy {
    accounts: HashMap<String, Vec<String>>,
}

impl AccountPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `account` to trigger work under each of `prefixes`.
    pub fn allow<I, S>(mut self, account: impl Into<String>, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accounts
            .entry(account.into())
            .or_default()
            .extend(prefixes.into_iter().map(Into::into));
        self
    }

    /// Load a TOML policy file made of `[[account]]` tables.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read policy file {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad policy file {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        let file: PolicyFile = toml::from_str(content)?;
        Ok(file
            .account
            .into_iter()
            .fold(Self::new(), |policy, entry| policy.allow(entry.id, entry.prefixes)))
    }

    pub fn prefixes(&self, account: &str) -> Option<&[String]> {
        self.accounts.get(account).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Policy gate
// ---------------------------------------------------------------------------

/// Allow-list + prefix policy, with an optional assertion check.
///
/// When a verifier is configured every event must carry a valid assertion.
#[derive(Debug)]
pub struct PolicyGate {
    policy: AccountPolicy,
    verifier: Option<AssertionVerifier>,
}

impl PolicyGate {
    pub fn new(policy: AccountPolicy, verifier: Option<AssertionVerifier>) -> Self {
        Self { policy, verifier }
    }
}

impl Authorizer for PolicyGate {
    fn evaluate(&self, raw: &RawEvent, declared_account: &str) -> Decision {
        if raw.source_account != declared_account {
            return Decision::Denied(DenyReason::AccountMismatch {
                declared: declared_account.to_string(),
            });
        }

        let Some(prefixes) = self.policy.prefixes(&raw.source_account) else {
            return Decision::Denied(DenyReason::UnknownAccount);
        };
        if !prefixes.iter().any(|p| raw.resource_id.starts_with(p.as_str())) {
            return Decision::Denied(DenyReason::PrefixNotAllowed);
        }

        if let Some(ref verifier) = self.verifier {
            let Some(ref assertion) = raw.assertion else {
                return Decision::Denied(DenyReason::MissingAssertion);
            };
            if let Err(e) = verifier.verify(raw, assertion) {
                return Decision::Denied(DenyReason::InvalidAssertion(e));
            }
        }

        Decision::Authorized
    }
}
