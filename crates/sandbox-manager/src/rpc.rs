//! The gRPC surface (spec.md §4.6, C6): translates `sandbox.v1.SandboxService`
//! requests into [`SessionManager`] calls and maps [`ManagerError`] onto
//! `tonic::Status` codes, grounded on
//! `original_source/agentbox/grpc_server.py`'s `SandboxServicer`.

use std::sync::Arc;

use sandbox_proto::hosts::{Allowlist, HostPattern};
use sandbox_proto::rpc::sandbox_service_server::SandboxService;
use sandbox_proto::rpc::{
    self, CreateSessionRequest, DestroySessionRequest, DestroySessionResponse, ExecRequest as RpcExecRequest, ExecResponse,
    ExecStreamRequest as RpcExecStreamRequest, GetSessionRequest, ListSessionsRequest, ListSessionsResponse, PipInstallRequest,
    ReadFileRequest as RpcReadFileRequest, ReadFileResponse as RpcReadFileResponse, SessionInfo as RpcSessionInfo, StreamEvent as RpcStreamEvent,
    WriteFileRequest as RpcWriteFileRequest, WriteFileResponse as RpcWriteFileResponse,
};
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status};

use crate::error::ManagerError;
use crate::models::SessionInfo;
use crate::service::SessionManager;

pub struct SandboxRpc {
    manager: Arc<SessionManager>,
}

impl SandboxRpc {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }
}

#[tonic::async_trait]
impl SandboxService for SandboxRpc {
    async fn create_session(&self, request: Request<CreateSessionRequest>) -> Result<Response<RpcSessionInfo>, Status> {
        let req = request.into_inner();
        let session_id = non_empty(req.session_id);
        let tenant_id = non_empty(req.tenant_id);
        let allowed_hosts = req.allowed_hosts.map(|list| {
            Allowlist::new(list.hosts.into_iter().map(HostPattern::new).collect())
        });

        let info = self
            .manager
            .create_session(session_id, tenant_id, allowed_hosts)
            .await
            .map_err(status_from_error)?;
        Ok(Response::new(session_info_to_rpc(info)))
    }

    async fn destroy_session(&self, request: Request<DestroySessionRequest>) -> Result<Response<DestroySessionResponse>, Status> {
        let session_id = request.into_inner().session_id;
        let success = self.manager.destroy_session(&session_id).await.map_err(status_from_error)?;
        Ok(Response::new(DestroySessionResponse { success }))
    }

    async fn get_session(&self, request: Request<GetSessionRequest>) -> Result<Response<RpcSessionInfo>, Status> {
        let session_id = request.into_inner().session_id;
        let info = self.manager.get_session(&session_id).map_err(status_from_error)?;
        Ok(Response::new(session_info_to_rpc(info)))
    }

    async fn list_sessions(&self, _request: Request<ListSessionsRequest>) -> Result<Response<ListSessionsResponse>, Status> {
        let sessions = self.manager.list_sessions().into_iter().map(session_info_to_rpc).collect();
        Ok(Response::new(ListSessionsResponse { sessions }))
    }

    async fn exec(&self, request: Request<RpcExecRequest>) -> Result<Response<ExecResponse>, Status> {
        let req = request.into_inner();
        let workdir = non_empty(req.workdir);
        let timeout = if req.timeout_seconds == 0 { None } else { Some(req.timeout_seconds as u64) };
        let result = self
            .manager
            .exec(&req.session_id, &req.command, workdir, timeout)
            .await
            .map_err(status_from_error)?;
        Ok(Response::new(ExecResponse {
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
            timed_out: result.timed_out,
        }))
    }

    type ExecStreamStream = std::pin::Pin<Box<dyn tokio_stream::Stream<Item = Result<RpcStreamEvent, Status>> + Send + 'static>>;

    async fn exec_stream(&self, request: Request<RpcExecStreamRequest>) -> Result<Response<Self::ExecStreamStream>, Status> {
        let req = request.into_inner();
        let workdir = non_empty(req.workdir);
        let events = self
            .manager
            .exec_stream(&req.session_id, &req.command, workdir)
            .await
            .map_err(status_from_error)?;

        let mapped = events.map(|event| Ok(stream_event_to_rpc(event)));
        Ok(Response::new(Box::pin(mapped)))
    }

    async fn write_file(&self, request: Request<RpcWriteFileRequest>) -> Result<Response<RpcWriteFileResponse>, Status> {
        let req = request.into_inner();
        let append = req.mode == "a";
        match self.manager.write_file(&req.session_id, &req.path, &req.content, append).await {
            Ok(()) => Ok(Response::new(RpcWriteFileResponse {
                success: true,
                error: String::new(),
            })),
            Err(ManagerError::SessionNotFound(id)) => Err(Status::not_found(id)),
            Err(e) => Ok(Response::new(RpcWriteFileResponse {
                success: false,
                error: e.to_string(),
            })),
        }
    }

    async fn read_file(&self, request: Request<RpcReadFileRequest>) -> Result<Response<RpcReadFileResponse>, Status> {
        let req = request.into_inner();
        match self.manager.read_file(&req.session_id, &req.path).await {
            Ok(content) => Ok(Response::new(RpcReadFileResponse {
                success: true,
                content,
                error: String::new(),
            })),
            Err(ManagerError::SessionNotFound(id)) => Err(Status::not_found(id)),
            Err(e) => Ok(Response::new(RpcReadFileResponse {
                success: false,
                content: String::new(),
                error: e.to_string(),
            })),
        }
    }

    async fn pip_install(&self, request: Request<PipInstallRequest>) -> Result<Response<ExecResponse>, Status> {
        let req = request.into_inner();
        let timeout = if req.timeout_seconds == 0 { None } else { Some(req.timeout_seconds as u64) };
        let result = self
            .manager
            .pip_install(&req.session_id, &req.packages, timeout)
            .await
            .map_err(status_from_error)?;
        Ok(Response::new(ExecResponse {
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
            timed_out: result.timed_out,
        }))
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

fn session_info_to_rpc(info: SessionInfo) -> RpcSessionInfo {
    RpcSessionInfo {
        session_id: info.session_id,
        tenant_id: info.tenant_id.unwrap_or_default(),
        container_id: info.container_id,
        allowed_hosts: info.allowed_hosts.patterns().iter().map(|p| p.as_str().to_string()).collect(),
        created_at_unix: info.created_at.timestamp(),
        last_activity_unix: info.last_activity.timestamp(),
    }
}

fn stream_event_to_rpc(event: sandbox_proto::StreamEvent) -> RpcStreamEvent {
    use sandbox_proto::StreamEvent as Se;
    let inner = match event {
        Se::Stdout { data } => rpc::stream_event::Event::Stdout(rpc::Chunk { data: data.into_bytes() }),
        Se::Stderr { data } => rpc::stream_event::Event::Stderr(rpc::Chunk { data: data.into_bytes() }),
        Se::Exit { exit_code } => rpc::stream_event::Event::Exit(rpc::ExitEvent { exit_code }),
        Se::Error { message } => rpc::stream_event::Event::Error(rpc::ErrorEvent { message }),
    };
    RpcStreamEvent { event: Some(inner) }
}

/// Maps [`ManagerError`] onto `tonic::Status` (spec.md §7's taxonomy table).
fn status_from_error(e: ManagerError) -> Status {
    match e {
        ManagerError::SessionNotFound(id) => Status::not_found(id),
        ManagerError::InvalidArgument(msg) => Status::invalid_argument(msg),
        ManagerError::AgentUnready(msg) => Status::unavailable(msg),
        ManagerError::Unavailable(msg) => Status::unavailable(msg),
        ManagerError::DeadlineExceeded => Status::deadline_exceeded("operation deadline exceeded"),
        ManagerError::Internal(msg) => Status::internal(msg),
    }
}
