//! Allowlist resolution from proxy credentials (spec.md §4.3 "Policy
//! resolution").
//!
//! A request carries its policy in `Proxy-Authorization: Basic
//! base64("sandbox:jwt_<token>")`. Three cases:
//!
//! - No header at all → fall back to the proxy's configured default
//!   allowlist.
//! - Header present but not in the expected `sandbox:jwt_<token>` shape →
//!   also falls back to the default (nothing to verify against).
//! - Header present and a token was extracted, but verification fails
//!   (bad MAC, expired, malformed payload) → the request is rejected
//!   outright, not silently downgraded to the default allowlist. This is
//!   the one place SPEC_FULL.md's design diverges from
//!   `original_source/agentbox/egress_proxy.py`, which falls back to
//!   defaults even on a bad token; spec.md §4.3 calls for an explicit
//!   reject ("reject the request outright if credentials are present but
//!   invalid or expired") so a forged or stale token can never silently
//!   regress to a looser policy.

use sandbox_proto::hosts::Allowlist;
use sandbox_token::TokenService;

use crate::error::ProxyError;

#[derive(Debug, Clone)]
pub struct ResolvedPolicy {
    pub allowlist: Allowlist,
    pub session_id: Option<String>,
}

impl ResolvedPolicy {
    fn default_with(allowlist: Allowlist) -> Self {
        Self {
            allowlist,
            session_id: None,
        }
    }
}

/// Resolve the effective allowlist and session_id for a proxied request.
pub fn resolve(
    auth_header: Option<&str>,
    token_service: &TokenService,
    default_allowlist: &Allowlist,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<ResolvedPolicy, ProxyError> {
    let Some(header_value) = auth_header else {
        return Ok(ResolvedPolicy::default_with(default_allowlist.clone()));
    };

    let Some(token) = sandbox_token::decode_basic_auth_token(header_value) else {
        return Ok(ResolvedPolicy::default_with(default_allowlist.clone()));
    };

    match token_service.verify(&token, now) {
        Ok(payload) => Ok(ResolvedPolicy {
            allowlist: payload.allowlist(),
            session_id: Some(payload.session_id),
        }),
        Err(_) => Err(ProxyError::Unauthenticated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use sandbox_proto::hosts::HostPattern;

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn no_header_falls_back_to_default() {
        let svc = TokenService::new(b"key".to_vec());
        let default = Allowlist::default_registries();
        let resolved = resolve(None, &svc, &default, now()).unwrap();
        assert_eq!(resolved.allowlist, default);
        assert!(resolved.session_id.is_none());
    }

    #[test]
    fn malformed_header_falls_back_to_default() {
        let svc = TokenService::new(b"key".to_vec());
        let default = Allowlist::default_registries();
        let resolved = resolve(Some("Basic not-base64!!"), &svc, &default, now()).unwrap();
        assert_eq!(resolved.allowlist, default);
    }

    #[test]
    fn valid_token_resolves_session_allowlist() {
        let svc = TokenService::new(b"key".to_vec());
        let hosts = Allowlist::new(vec![HostPattern::new("example.com")]);
        let token = svc.mint("sess-1", None, &hosts, now(), 60);
        let header = format!(
            "Basic {}",
            base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                format!("sandbox:jwt_{token}")
            )
        );
        let resolved = resolve(Some(&header), &svc, &Allowlist::none(), now()).unwrap();
        assert_eq!(resolved.allowlist, hosts);
        assert_eq!(resolved.session_id.as_deref(), Some("sess-1"));
    }

    #[test]
    fn expired_token_is_rejected_outright() {
        let svc = TokenService::new(b"key".to_vec());
        let token = svc.mint("sess-1", None, &Allowlist::none(), now(), -1);
        let header = format!(
            "Basic {}",
            base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                format!("sandbox:jwt_{token}")
            )
        );
        let err = resolve(Some(&header), &svc, &Allowlist::default_registries(), now()).unwrap_err();
        assert!(matches!(err, ProxyError::Unauthenticated));
    }
}
