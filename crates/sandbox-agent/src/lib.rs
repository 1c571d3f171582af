//! The in-container PID-1 agent (spec.md §4.2, C2).

pub mod exec;
pub mod path_policy;
pub mod reaper;
pub mod rlimit;
pub mod server;

pub use server::router;
