//! The token service (spec.md §4.1, C1): mints and verifies the signed,
//! time-bounded egress tokens that bind a session to its network policy.
//!
//! The wire format is intentionally JWT-shaped (three dot-separated,
//! URL-safe-base64 segments: header, payload, MAC) because that's what the
//! original implementation produces and what `sandbox-proxy` must parse out
//! of `Proxy-Authorization: Basic base64("sandbox:jwt_<token>")`. Encoding
//! and verification are hand-rolled rather than delegated to a generic JWT
//! library so that the canonicalization and constant-time comparison called
//! out in spec.md §4.1/§9 are explicit, auditable steps rather than
//! library-internal behavior.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sandbox_proto::hosts::Allowlist;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Four hours, the original implementation's proxy-token TTL
/// (SPEC_FULL.md §C.2).
pub const DEFAULT_TTL_SECONDS: i64 = 4 * 3600;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token is not in header.payload.mac form")]
    Malformed,
    #[error("token MAC does not match")]
    BadMac,
    #[error("token expired")]
    Expired,
    #[error("token payload is not valid JSON: {0}")]
    InvalidPayload(String),
    #[error("token base64 segment is invalid: {0}")]
    InvalidBase64(String),
}

/// Canonical JWT header. Always the same two fields in the same order so
/// the encoded bytes are reproducible (spec.md §9, "Token canonicalization").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Header<'a> {
    typ: &'a str,
    alg: &'a str,
}

const HEADER: Header<'static> = Header {
    typ: "JWT",
    alg: "HS256",
};

/// The decoded payload of an egress token (spec.md §3 `EgressToken`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payload {
    pub iss: String,
    pub session_id: String,
    pub tenant_id: Option<String>,
    /// Comma-joined allowlist, as it travels on the wire.
    pub allowed_hosts: String,
    pub exp: i64,
}

impl Payload {
    pub fn allowlist(&self) -> Allowlist {
        Allowlist::from_comma_joined(&self.allowed_hosts)
    }
}

const ISSUER: &str = "sandbox-egress-control";

/// Holds the manager's symmetric signing key and performs mint/verify.
///
/// Immutable after construction (spec.md §5: "The signing key is immutable
/// after startup; token mint/verify are pure functions over it").
#[derive(Clone)]
pub struct TokenService {
    key: Vec<u8>,
}

impl TokenService {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    /// Mint a token for `session_id`/`tenant_id`/`allowed_hosts`, expiring
    /// `ttl_seconds` from `now`.
    pub fn mint(
        &self,
        session_id: &str,
        tenant_id: Option<&str>,
        allowed_hosts: &Allowlist,
        now: chrono::DateTime<chrono::Utc>,
        ttl_seconds: i64,
    ) -> String {
        let payload = Payload {
            iss: ISSUER.to_string(),
            session_id: session_id.to_string(),
            tenant_id: tenant_id.map(str::to_string),
            allowed_hosts: allowed_hosts.to_comma_joined(),
            exp: now.timestamp() + ttl_seconds,
        };

        let header_b64 = b64_encode_json(&HEADER);
        let payload_b64 = b64_encode_json(&payload);
        let message = format!("{header_b64}.{payload_b64}");
        let mac = self.compute_mac(message.as_bytes());
        let mac_b64 = URL_SAFE_NO_PAD.encode(mac);

        format!("{message}.{mac_b64}")
    }

    /// Verify `token` against `now`, returning its payload on success.
    pub fn verify(&self, token: &str, now: chrono::DateTime<chrono::Utc>) -> Result<Payload, TokenError> {
        let mut parts = token.split('.');
        let header_b64 = parts.next().ok_or(TokenError::Malformed)?;
        let payload_b64 = parts.next().ok_or(TokenError::Malformed)?;
        let mac_b64 = parts.next().ok_or(TokenError::Malformed)?;
        if parts.next().is_some() {
            return Err(TokenError::Malformed);
        }

        let message = format!("{header_b64}.{payload_b64}");
        let expected_mac = self.compute_mac(message.as_bytes());
        let given_mac = URL_SAFE_NO_PAD
            .decode(mac_b64)
            .map_err(|e| TokenError::InvalidBase64(e.to_string()))?;

        // Constant-time comparison guards against a timing oracle on the
        // MAC check (spec.md §4.1).
        if expected_mac.len() != given_mac.len() || expected_mac.ct_eq(&given_mac).unwrap_u8() != 1 {
            return Err(TokenError::BadMac);
        }

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|e| TokenError::InvalidBase64(e.to_string()))?;
        let payload: Payload =
            serde_json::from_slice(&payload_bytes).map_err(|e| TokenError::InvalidPayload(e.to_string()))?;

        if payload.exp <= now.timestamp() {
            return Err(TokenError::Expired);
        }

        Ok(payload)
    }

    fn compute_mac(&self, message: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(message);
        mac.finalize().into_bytes().to_vec()
    }
}

/// Canonical JSON: fixed key order (via field declaration order, which
/// `serde_json` preserves for structs) and no interstitial whitespace
/// (`serde_json::to_vec` is already compact). This is what makes the MAC
/// reproducible across mint/verify (spec.md §9).
fn b64_encode_json<T: Serialize>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).expect("header/payload structs always serialize");
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Extract the bearer token from a `Proxy-Authorization: Basic ...` header
/// value, per spec.md §6: `base64("sandbox:jwt_<token>")`.
pub fn decode_basic_auth_token(header_value: &str) -> Option<String> {
    let encoded = header_value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    if username != "sandbox" {
        return None;
    }
    password.strip_prefix("jwt_").map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn svc() -> TokenService {
        TokenService::new(b"test-signing-key".to_vec())
    }

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn mint_then_verify_round_trips() {
        let svc = svc();
        let hosts = Allowlist::new(vec![sandbox_proto::hosts::HostPattern::new("pypi.org")]);
        let token = svc.mint("sess-1", Some("tenant-a"), &hosts, now(), 60);
        let payload = svc.verify(&token, now()).unwrap();
        assert_eq!(payload.session_id, "sess-1");
        assert_eq!(payload.tenant_id.as_deref(), Some("tenant-a"));
        assert_eq!(payload.allowlist(), hosts);
        assert_eq!(payload.iss, "sandbox-egress-control");
    }

    #[test]
    fn expired_token_is_rejected() {
        let svc = svc();
        let token = svc.mint("sess-1", None, &Allowlist::none(), now(), -1);
        let err = svc.verify(&token, now()).unwrap_err();
        assert!(matches!(err, TokenError::Expired));
    }

    #[test]
    fn expiry_boundary_is_strict() {
        let svc = svc();
        let token = svc.mint("sess-1", None, &Allowlist::none(), now(), 10);
        // exp == now + 10; verifying exactly at exp must fail ("exp > now").
        let at_exp = now() + chrono::Duration::seconds(10);
        assert!(matches!(svc.verify(&token, at_exp), Err(TokenError::Expired)));
        let before_exp = now() + chrono::Duration::seconds(9);
        assert!(svc.verify(&token, before_exp).is_ok());
    }

    #[test]
    fn single_bit_mutation_breaks_verification() {
        let svc = svc();
        let token = svc.mint("sess-1", None, &Allowlist::default_registries(), now(), 60);
        let mut bytes = token.into_bytes();
        // Flip a bit well inside the payload segment.
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        let mutated = String::from_utf8(bytes).unwrap();
        let result = svc.verify(&mutated, now());
        assert!(result.is_err());
    }

    #[test]
    fn wrong_key_fails_verification() {
        let minted = TokenService::new(b"key-a".to_vec()).mint("sess-1", None, &Allowlist::none(), now(), 60);
        let err = TokenService::new(b"key-b".to_vec()).verify(&minted, now()).unwrap_err();
        assert!(matches!(err, TokenError::BadMac));
    }

    #[test]
    fn malformed_token_rejected() {
        let svc = svc();
        assert!(matches!(svc.verify("not-a-token", now()), Err(TokenError::Malformed)));
        assert!(matches!(svc.verify("a.b.c.d", now()), Err(TokenError::Malformed)));
    }

    #[test]
    fn basic_auth_token_extraction() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("sandbox:jwt_abc.def.ghi");
        let header = format!("Basic {encoded}");
        assert_eq!(decode_basic_auth_token(&header).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn basic_auth_rejects_wrong_username() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("admin:jwt_abc");
        let header = format!("Basic {encoded}");
        assert_eq!(decode_basic_auth_token(&header), None);
    }
}
