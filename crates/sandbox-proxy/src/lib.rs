//! The egress proxy (spec.md §4.3, C3): an HTTP forward proxy and CONNECT
//! tunneler that derives a per-session allowlist from the signed egress
//! token carried in proxy credentials.

pub mod error;
pub mod policy;
pub mod server;

pub use error::ProxyError;
pub use server::ProxyState;
