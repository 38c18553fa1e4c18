//! Identity assertions: HMAC-SHA256 over the notification's identifying
//! fields, issued in the source account and checked here.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::secrets::{ExposeSecret, SecretString};
use crate::model::RawEvent;

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies assertions with a shared key.
pub struct AssertionVerifier {
    key: SecretString,
}

impl AssertionVerifier {
    pub fn new(key: SecretString) -> Self {
        Self { key }
    }

    fn mac(&self, raw: &RawEvent) -> Option<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.key.expose_secret().as_bytes()).ok()?;
        mac.update(raw.source_account.as_bytes());
        mac.update(b"\n");
        mac.update(raw.resource_id.as_bytes());
        mac.update(b"\n");
        mac.update(raw.event_type.as_bytes());
        mac.update(b"\n");
        mac.update(raw.sequence_token.as_deref().unwrap_or_default().as_bytes());
        mac.update(b"\n");
        mac.update(raw.timestamp.timestamp_millis().to_string().as_bytes());
        Some(mac)
    }

    /// Produce the assertion the source side would attach to `raw`.
    pub fn sign(&self, raw: &RawEvent) -> Option<String> {
        self.mac(raw)
            .map(|mac| URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    /// Check `assertion` against `raw` in constant time.
    pub fn verify(&self, raw: &RawEvent, assertion: &str) -> Result<(), String> {
        let signature = URL_SAFE_NO_PAD
            .decode(assertion.trim())
            .map_err(|e| format!("assertion is not base64url: {e}"))?;
        let mac = self
            .mac(raw)
            .ok_or_else(|| "failed to initialize hmac".to_string())?;
        mac.verify_slice(&signature)
            .map_err(|_| "signature mismatch".to_string())
    }
}

impl std::fmt::Debug for AssertionVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssertionVerifier").finish_non_exhaustive()
    }
}
