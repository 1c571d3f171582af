//! Egress proxy error taxonomy (spec.md §4.3, §7).

use hyper::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed proxy request: {0}")]
    MalformedRequest(String),

    #[error("host not allowed: {0}")]
    HostNotAllowed(String),

    #[error("proxy credentials invalid or expired")]
    Unauthenticated,

    #[error("upstream connection failed: {0}")]
    UpstreamUnavailable(String),
}

impl ProxyError {
    /// The HTTP status a denial of this kind is surfaced as (spec.md §4.3:
    /// a malformed request is a client error, a policy denial is a
    /// forbidden, an upstream dial/response failure is a bad gateway).
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::HostNotAllowed(_) => StatusCode::FORBIDDEN,
            ProxyError::Unauthenticated => StatusCode::FORBIDDEN,
            ProxyError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
        }
    }
}
