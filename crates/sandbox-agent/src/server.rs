//! The agent's HTTP control surface (spec.md §4.2): `/health`, `/exec`,
//! `/exec/stream`, `/file/write`, `/file/read`.

use std::convert::Infallible;

use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use sandbox_proto::{ExecRequest, ExecStreamRequest, ReadFileRequest, ReadFileResponse, WriteFileRequest, WriteFileResponse, WriteMode};
use serde_json::json;
use tokio_stream::StreamExt;

use crate::{exec, path_policy};

#[derive(Clone, Default)]
pub struct AppState;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/health", get(health))
        .route("/exec", post(exec_unary))
        .route("/exec/stream", post(exec_stream))
        .route("/file/write", post(file_write))
        .route("/file/read", post(file_read))
        .with_state(AppState)
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn exec_unary(State(_): State<AppState>, body: Result<Json<ExecRequest>, axum::extract::rejection::JsonRejection>) -> impl IntoResponse {
    let Json(req) = match body {
        Ok(req) => req,
        Err(_) => return (axum::http::StatusCode::BAD_REQUEST, Json(json!({"error": "Invalid JSON"}))).into_response(),
    };

    if req.command.trim().is_empty() {
        return (
            axum::http::StatusCode::BAD_REQUEST,
            Json(json!({"error": "Missing 'command' field"})),
        )
            .into_response();
    }

    let result = exec::run_exec(&req.command, req.workdir.as_deref(), req.timeout).await;
    Json(result).into_response()
}

async fn exec_stream(
    State(_): State<AppState>,
    body: Result<Json<ExecStreamRequest>, axum::extract::rejection::JsonRejection>,
) -> impl IntoResponse {
    let Json(req) = match body {
        Ok(req) => req,
        Err(_) => return (axum::http::StatusCode::BAD_REQUEST, Json(json!({"error": "Invalid JSON"}))).into_response(),
    };

    if req.command.trim().is_empty() {
        return (
            axum::http::StatusCode::BAD_REQUEST,
            Json(json!({"error": "Missing 'command' field"})),
        )
            .into_response();
    }

    let events = exec::run_exec_stream(req.command, req.workdir);
    let sse_stream = events.map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok::<_, Infallible>(Event::default().data(data))
    });

    Sse::new(sse_stream)
        .keep_alive(axum::response::sse::KeepAlive::new())
        .into_response()
}

async fn file_write(
    State(_): State<AppState>,
    body: Result<Json<WriteFileRequest>, axum::extract::rejection::JsonRejection>,
) -> impl IntoResponse {
    let Json(req) = match body {
        Ok(req) => req,
        Err(_) => return (axum::http::StatusCode::BAD_REQUEST, Json(json!({"error": "Invalid JSON"}))).into_response(),
    };

    let resolved = match path_policy::check_write_path(&req.path) {
        Ok(p) => p,
        Err(path_policy::PathPolicyError::NotAllowed) => {
            return Json(WriteFileResponse {
                success: false,
                error: Some("Path not allowed".to_string()),
            })
            .into_response();
        }
        Err(e) => {
            return Json(WriteFileResponse {
                success: false,
                error: Some(e.to_string()),
            })
            .into_response();
        }
    };

    let write_result = async {
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match req.mode {
            WriteMode::Write => tokio::fs::write(&resolved, &req.content).await,
            WriteMode::Append => {
                use tokio::io::AsyncWriteExt;
                let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&resolved).await?;
                file.write_all(req.content.as_bytes()).await
            }
        }
    }
    .await;

    match write_result {
        Ok(()) => Json(WriteFileResponse {
            success: true,
            error: None,
        })
        .into_response(),
        Err(e) => Json(WriteFileResponse {
            success: false,
            error: Some(e.to_string()),
        })
        .into_response(),
    }
}

async fn file_read(
    State(_): State<AppState>,
    body: Result<Json<ReadFileRequest>, axum::extract::rejection::JsonRejection>,
) -> impl IntoResponse {
    let Json(req) = match body {
        Ok(req) => req,
        Err(_) => return (axum::http::StatusCode::BAD_REQUEST, Json(json!({"error": "Invalid JSON"}))).into_response(),
    };

    let resolved = match path_policy::check_read_path(&req.path) {
        Ok(p) => p,
        Err(path_policy::PathPolicyError::NotAllowed) => {
            return Json(ReadFileResponse {
                success: false,
                content: None,
                error: Some("Path not allowed".to_string()),
            })
            .into_response();
        }
        Err(e) => {
            return Json(ReadFileResponse {
                success: false,
                content: None,
                error: Some(e.to_string()),
            })
            .into_response();
        }
    };

    match tokio::fs::read_to_string(&resolved).await {
        Ok(content) => Json(ReadFileResponse {
            success: true,
            content: Some(content),
            error: None,
        })
        .into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Json(ReadFileResponse {
            success: false,
            content: None,
            error: Some("File not found".to_string()),
        })
        .into_response(),
        Err(e) => Json(ReadFileResponse {
            success: false,
            content: None,
            error: Some(e.to_string()),
        })
        .into_response(),
    }
}
