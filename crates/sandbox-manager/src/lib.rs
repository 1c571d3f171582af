//! Session manager (spec.md §4.5-4.7, C5-C6): container lifecycle, egress
//! token minting, and the `sandbox.v1.SandboxService` gRPC surface.

pub mod config;
pub mod error;
pub mod models;
pub mod rpc;
pub mod service;

pub use error::{ManagerError, ManagerResult};
pub use service::SessionManager;
