//! Signed, self-expiring session labels.
//!
//! A lease is minted as `s=<svc>;i=<inst>;e=<ms>;g=<sig>` and must fit in the
//! 63-byte session-label budget Postgres enforces on `application_name`.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::Error;

type HmacSha256 = Hmac<Sha256>;

/// Hard limit imposed by the database session-label column.
pub const MAX_LABEL_LEN: usize = 63;
/// Length, in bytes, of the raw signature before encoding.
const SIGNATURE_BYTES: usize = 8;
/// Length, in chars, of the base64url-no-pad encoding of [`SIGNATURE_BYTES`].
const SIGNATURE_LEN: usize = 11;

const ALLOWED_EXTRA: [char; 3] = [':', '_', '-'];

fn is_allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || ALLOWED_EXTRA.contains(&c)
}

/// Replace any character outside `[A-Za-z0-9:_-]` with `_`.
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if is_allowed_char(c) { c } else { '_' })
        .collect()
}

fn hash8(raw: &str) -> String {
    let digest = Sha1::digest(raw.as_bytes());
    hex::encode(digest)[..8].to_string()
}

/// Normalize a raw service name to fit the label budget, disambiguating
/// truncation/sanitization collisions with a content hash of the original.
///
/// `24 + len(sanitized_instance) + 11` is the fixed overhead of
/// `s=;i=;e=;g=` plus a millisecond timestamp plus the signature; whatever
/// is left over is the budget available to the service name.
pub fn normalize_service_name(raw: &str, sanitized_instance: &str) -> String {
    let sanitized = sanitize(raw);
    let overhead = 24 + sanitized_instance.len() + SIGNATURE_LEN;
    let max_len = MAX_LABEL_LEN.saturating_sub(overhead);

    let changed = sanitized != raw;
    let too_long = sanitized.chars().count() > max_len;

    if !changed && !too_long {
        return sanitized;
    }

    let hash = hash8(raw);
    // "<prefix>-<hash8>", prefix sanitized and truncated to fit.
    let suffix_len = 1 + hash.len(); // '-' + hash
    let prefix_budget = max_len.saturating_sub(suffix_len);
    let prefix: String = sanitized.chars().take(prefix_budget).collect();
    format!("{prefix}-{hash}")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedLease {
    pub service: String,
    pub instance: String,
    pub expires_at_ms: i64,
    pub is_expired: bool,
}

/// Mints and verifies lease labels for a single coordination secret.
#[derive(Clone)]
pub struct LeaseManager {
    secret: Vec<u8>,
}

impl LeaseManager {
    /// Construct a manager. `secret` must be at least 16 bytes; shorter
    /// secrets are a configuration error, not a runtime one, so this fails
    /// at construction rather than at mint time.
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, Error> {
        let secret = secret.into();
        if secret.len() < 16 {
            return Err(Error::Configuration(
                "coordination secret must be at least 16 bytes".to_string(),
            ));
        }
        Ok(Self { secret })
    }

    fn sign(&self, base: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts a key of any length");
        mac.update(base.as_bytes());
        let full = mac.finalize().into_bytes();
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&full[..SIGNATURE_BYTES])
    }

    /// Mint a signed label for `service`/`instance`, expiring at
    /// `expires_at_ms`. Panics-as-error (via [`Error::InvariantViolation`])
    /// if the result would exceed [`MAX_LABEL_LEN`]; a silently truncated
    /// label would be a different, unverifiable lease, so we fail loud
    /// instead.
    pub fn mint(
        &self,
        service: &str,
        instance: &str,
        expires_at_ms: i64,
    ) -> Result<String, Error> {
        let sanitized_instance = sanitize(instance);
        let sanitized_service = normalize_service_name(service, &sanitized_instance);

        let base = format!(
            "s={};i={};e={}",
            sanitized_service, sanitized_instance, expires_at_ms
        );
        let sig = self.sign(&base);
        let label = format!("{base};g={sig}");

        if label.len() > MAX_LABEL_LEN {
            return Err(Error::InvariantViolation(format!(
                "minted label is {} bytes, exceeds {}-byte budget: {label:?}",
                label.len(),
                MAX_LABEL_LEN
            )));
        }
        Ok(label)
    }

    /// Parse and verify a label. Returns `None` on any structural mismatch,
    /// bad signature, or non-finite expiry -- including labels signed by a
    /// different secret (which we must treat as "not ours", not as an
    /// error).
    pub fn parse_and_verify(&self, label: &str, now_ms: i64) -> Option<ParsedLease> {
        let rest = label.strip_prefix("s=")?;
        let (service, rest) = rest.split_once(";i=")?;
        let (instance, rest) = rest.split_once(";e=")?;
        let (expires_str, sig) = rest.split_once(";g=")?;

        if service.is_empty() || instance.is_empty() || sig.is_empty() {
            return None;
        }
        // Reject anything with a stray delimiter inside the signature field --
        // a well-formed label never has one there.
        if sig.contains(';') {
            return None;
        }

        let expires_at_ms: i64 = expires_str.parse().ok()?;

        let base = format!("s={service};i={instance};e={expires_str}");
        let expected_sig = self.sign(&base);
        if !constant_time_eq(sig.as_bytes(), expected_sig.as_bytes()) {
            return None;
        }

        Some(ParsedLease {
            service: service.to_string(),
            instance: instance.to_string(),
            expires_at_ms,
            is_expired: now_ms > expires_at_ms,
        })
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> LeaseManager {
        LeaseManager::new(b"0123456789abcdef".to_vec()).unwrap()
    }

    #[test]
    fn mint_then_verify_round_trips() {
        let lm = manager();
        let label = lm.mint("mysvc", "inst-1", 1_000_000).unwrap();
        assert!(label.len() <= MAX_LABEL_LEN);
        let parsed = lm.parse_and_verify(&label, 0).unwrap();
        assert_eq!(parsed.instance, "inst-1");
        assert!(!parsed.is_expired);
    }

    #[test]
    fn expiration_is_evaluated_against_now() {
        let lm = manager();
        let label = lm.mint("mysvc", "inst-1", 1_000).unwrap();
        let parsed = lm.parse_and_verify(&label, 2_000).unwrap();
        assert!(parsed.is_expired);
    }

    #[test]
    fn tampering_with_instance_invalidates_signature() {
        let lm = manager();
        let label = lm.mint("mysvc", "inst-1", 1_000_000).unwrap();
        let tampered = label.replace("i=inst-1", "i=hacker-");
        assert_ne!(tampered, label);
        assert!(lm.parse_and_verify(&tampered, 0).is_none());
    }

    #[test]
    fn different_secret_does_not_verify() {
        let lm1 = LeaseManager::new(b"0123456789abcdef".to_vec()).unwrap();
        let lm2 = LeaseManager::new(b"fedcba9876543210".to_vec()).unwrap();
        let label = lm1.mint("mysvc", "inst-1", 1_000_000).unwrap();
        assert!(lm2.parse_and_verify(&label, 0).is_none());
    }

    #[test]
    fn short_secret_is_rejected_at_construction() {
        assert!(LeaseManager::new(b"short".to_vec()).is_err());
    }

    #[test]
    fn long_service_name_is_normalized() {
        let lm = manager();
        let raw_service = "a".repeat(100);
        let label = lm.mint(&raw_service, "inst-1", 1_000_000).unwrap();
        assert!(label.len() <= MAX_LABEL_LEN);
        let parsed = lm.parse_and_verify(&label, 0).unwrap();
        assert_ne!(parsed.service, raw_service);
    }

    #[test]
    fn sanitizes_disallowed_characters() {
        assert_eq!(sanitize("svc name/v1"), "svc_name_v1");
    }

    #[test]
    fn two_colliding_raw_names_disambiguate() {
        let lm = manager();
        let long_a = format!("{}A", "x".repeat(60));
        let long_b = format!("{}B", "x".repeat(60));
        let label_a = lm.mint(&long_a, "inst", 1_000_000).unwrap();
        let label_b = lm.mint(&long_b, "inst", 1_000_000).unwrap();
        assert_ne!(label_a, label_b);
    }
}
