//! Canonical domain types shared across the sandbox platform's crates.
//!
//! This crate plays the same role `octo-protocol` plays in the oqto
//! backend: the one place every other crate imports wire-shape types from,
//! so the session manager, the in-container agent, and the egress proxy
//! never drift out of sync on what an `ExecResult` or a host pattern means.
//!
//! The generated gRPC stubs (from `proto/sandbox.proto`) live in
//! [`rpc`]; [`hosts`] and the value types below are hand-written and
//! transport-agnostic.

pub mod hosts;

use serde::{Deserialize, Serialize};

/// Generated gRPC client/server code for `sandbox.v1.SandboxService`.
pub mod rpc {
    tonic::include_proto!("sandbox.v1");
}

/// Result of a unary command execution (spec.md §3 `ExecResult`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecResult {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: message.into(),
            timed_out: false,
        }
    }

    pub fn timeout() -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: "command timed out".to_string(),
            timed_out: true,
        }
    }
}

/// One event in a streaming exec's sequence (spec.md §3 `StreamEvent`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Stdout { data: String },
    Stderr { data: String },
    Exit { exit_code: i32 },
    Error { message: String },
}

/// Request body accepted by the in-container agent's `/exec`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: String,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Request body accepted by the in-container agent's `/exec/stream`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecStreamRequest {
    pub command: String,
    #[serde(default)]
    pub workdir: Option<String>,
}

/// File write mode, as carried on the wire (`"w"` or `"a"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    #[serde(rename = "w")]
    Write,
    #[serde(rename = "a")]
    Append,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFileRequest {
    pub path: String,
    pub content: String,
    #[serde(default = "default_write_mode")]
    pub mode: WriteMode,
}

fn default_write_mode() -> WriteMode {
    WriteMode::Write
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFileRequest {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFileResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFileResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
