//! Container creation spec and inspection results (spec.md §4.4).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ContainerError, ContainerResult};

/// OCI runtime selector. `Runsc` (gVisor) is the stronger-isolation option
/// and is preferred where the engine has it installed; `Runc` is the
/// universal fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OciRuntime {
    #[default]
    Runc,
    Runsc,
}

impl OciRuntime {
    pub fn flag_value(&self) -> &'static str {
        match self {
            OciRuntime::Runc => "runc",
            OciRuntime::Runsc => "runsc",
        }
    }
}

impl std::fmt::Display for OciRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.flag_value())
    }
}

/// Container network posture (spec.md §4.4 "Network mode").
///
/// `None` is used when the session's allowlist is empty; `Proxied` sets the
/// `HTTP(S)_PROXY` family of env vars pointing at the egress proxy with the
/// session's token embedded in the URL's userinfo. `Open` is the case the
/// distilled spec doesn't name but `original_source/agentbox/sandbox_manager.py`
/// does (`_create_container`'s "else: full network access (no proxy
/// configured but hosts allowed)"): a session whose allowlist is non-empty
/// but whose manager has no proxy configured gets unrestricted bridge
/// networking rather than a policy that can't be enforced.
#[derive(Debug, Clone)]
pub enum NetworkConfig {
    None,
    Proxied { proxy_url: String },
    Open,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig::None
    }
}

/// CPU quota expressed the way cgroups CFS bandwidth control takes it:
/// an allotment of `quota_micros` CPU-microseconds out of every
/// `period_micros` wall-clock microseconds.
#[derive(Debug, Clone, Copy)]
pub struct CpuLimit {
    pub period_micros: u32,
    pub quota_micros: u32,
}

impl CpuLimit {
    /// A `cpus`-CPU allotment at the period spec.md's example uses
    /// (period 100ms, quota 400ms for four CPUs).
    pub fn cpus(cpus: f64) -> Self {
        const PERIOD_MICROS: u32 = 100_000;
        Self {
            period_micros: PERIOD_MICROS,
            quota_micros: (PERIOD_MICROS as f64 * cpus) as u32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

impl PortMapping {
    /// Publish `container_port` to an engine-assigned ephemeral host port
    /// (spec.md §4.4: "publish the agent port to an ephemeral host port").
    pub fn ephemeral(container_port: u16) -> Self {
        Self {
            host_port: 0,
            container_port,
            protocol: default_protocol(),
        }
    }
}

/// Everything the driver needs to create a session container
/// (spec.md §4.4 "`spec` fields the driver must honor").
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub oci_runtime: OciRuntime,
    /// Memory limit in bytes.
    pub memory_limit_bytes: Option<u64>,
    pub cpu_limit: Option<CpuLimit>,
    /// `--security-opt no-new-privileges`. Defaults to on.
    pub no_new_privileges: bool,
    pub network: NetworkConfig,
    pub ports: Vec<PortMapping>,
    pub volumes: Vec<(String, String)>,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            name: name.into(),
            no_new_privileges: true,
            ..Default::default()
        }
    }

    pub fn memory_limit_bytes(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = Some(bytes);
        self
    }

    pub fn cpu_limit(mut self, limit: CpuLimit) -> Self {
        self.cpu_limit = Some(limit);
        self
    }

    pub fn oci_runtime(mut self, runtime: OciRuntime) -> Self {
        self.oci_runtime = runtime;
        self
    }

    pub fn network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    pub fn port(mut self, mapping: PortMapping) -> Self {
        self.ports.push(mapping);
        self
    }

    pub fn volume(mut self, host_path: impl Into<String>, container_path: impl Into<String>) -> Self {
        self.volumes.push((host_path.into(), container_path.into()));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Validate every field before this spec reaches the shell, to prevent
    /// argument injection into the engine invocation.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;
        validate_container_name(&self.name)?;
        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }
        for (host_path, container_path) in &self.volumes {
            validate_volume_path(host_path, "host")?;
            validate_volume_path(container_path, "container")?;
        }
        Ok(())
    }
}

/// Container state as reported by `inspect`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    #[default]
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Restarting => "restarting",
            ContainerState::Removing => "removing",
            ContainerState::Exited => "exited",
            ContainerState::Dead => "dead",
            ContainerState::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Result of `Inspect(Handle)` (spec.md §4.4): the container's status and,
/// when the agent port was published, the ephemeral host port it landed on.
#[derive(Debug, Clone)]
pub struct InspectResult {
    pub status: ContainerState,
    pub agent_host_port: Option<u16>,
}

// ---------------------------------------------------------------------
// Input validation. Every value below can end up as an argv entry passed
// to `docker`/`podman`; none of it is ever interpolated into a shell
// string, but we still reject anything that looks like an attempt to
// smuggle engine flags or path traversal through session-controlled
// fields (tenant id, session id).
// ---------------------------------------------------------------------

pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput("image name cannot be empty".to_string()));
    }
    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }
    let valid_chars =
        |c: char| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' || c == '/' || c == ':' || c == '@';
    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{image}' contains invalid characters"
        )));
    }
    if image.contains("..") {
        return Err(ContainerError::InvalidInput("image name cannot contain '..'".to_string()));
    }
    Ok(())
}

fn validate_container_name(name: &str) -> ContainerResult<()> {
    if name.is_empty() {
        return Err(ContainerError::InvalidInput("container name cannot be empty".to_string()));
    }
    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container name exceeds maximum length of 128 characters".to_string(),
        ));
    }
    let first_char = name.chars().next().unwrap();
    if !first_char.is_ascii_alphanumeric() && first_char != '_' {
        return Err(ContainerError::InvalidInput(
            "container name must start with an alphanumeric character or underscore".to_string(),
        ));
    }
    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{name}' contains invalid characters"
        )));
    }
    Ok(())
}

fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    if key.is_empty() {
        return Err(ContainerError::InvalidInput(
            "environment variable key cannot be empty".to_string(),
        ));
    }
    let first_char = key.chars().next().unwrap();
    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{key}' must start with a letter or underscore"
        )));
    }
    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '_';
    if !key.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{key}' contains invalid characters"
        )));
    }
    Ok(())
}

fn validate_volume_path(path: &str, side: &str) -> ContainerResult<()> {
    if path.is_empty() {
        return Err(ContainerError::InvalidInput(format!("{side} volume path cannot be empty")));
    }
    if path.contains('\0') {
        return Err(ContainerError::InvalidInput(format!(
            "{side} volume path cannot contain null bytes"
        )));
    }
    let dangerous_chars = [
        '$', '`', '!', '&', '|', ';', '<', '>', '(', ')', '{', '}', '[', ']', '*', '?', '\\', '"', '\'', '\n', '\r',
    ];
    for c in dangerous_chars {
        if path.contains(c) {
            return Err(ContainerError::InvalidInput(format!(
                "{side} volume path contains dangerous character '{c}'"
            )));
        }
    }
    Ok(())
}

pub fn validate_container_id_or_name(id: &str) -> ContainerResult<()> {
    if id.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }
    if id.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }
    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !id.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container ID or name '{id}' contains invalid characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_name_rejects_traversal() {
        assert!(validate_image_name("../etc/passwd").is_err());
    }

    #[test]
    fn image_name_accepts_registry_tag_digest() {
        assert!(validate_image_name("registry.example.com/sandbox/agent:v1.2").is_ok());
    }

    #[test]
    fn volume_path_rejects_shell_metacharacters() {
        let spec = ContainerSpec::new("img", "sandbox-abc123").volume("/host/$(whoami)", "/workspace");
        assert!(spec.validate().is_err());
    }

    #[test]
    fn env_key_rejects_leading_digit() {
        let spec = ContainerSpec::new("img", "sandbox-abc123").env("1BAD", "x");
        assert!(spec.validate().is_err());
    }

    #[test]
    fn cpu_limit_four_cpus_matches_spec_example() {
        let limit = CpuLimit::cpus(4.0);
        assert_eq!(limit.period_micros, 100_000);
        assert_eq!(limit.quota_micros, 400_000);
    }
}
