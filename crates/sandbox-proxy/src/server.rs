//! The forward proxy and CONNECT tunneler (spec.md §4.3, C3).
//!
//! Grounded on the hyper low-level `service_fn` + `http1::Builder` pattern
//! used by the sandbox-adjacent forward proxy in the retrieval pack
//! (`ironclaw`'s `sandbox/proxy/http.rs`): a bare TCP accept loop rather than
//! an `axum::Router`, since CONNECT's `hyper::upgrade` dance and the
//! bidirectional splice don't fit naturally through axum's routing layer.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use sandbox_proto::hosts::Allowlist;
use sandbox_token::TokenService;
use tokio::net::{TcpListener, TcpStream};

use crate::error::ProxyError;
use crate::policy::{self, ResolvedPolicy};

/// Buffer size for the CONNECT tunnel's bidirectional splice, pinned to the
/// original implementation's `pipe()` (SPEC_FULL.md §C.6). Distinct from
/// the agent's 4 KiB stdout/stderr chunk size, which is a different
/// subsystem with its own spec'd constant.
const CONNECT_COPY_BUF_HINT: usize = 8192;

pub struct ProxyState {
    pub token_service: TokenService,
    pub default_allowlist: Allowlist,
    pub http_client: reqwest::Client,
    pub accepted: AtomicU64,
    pub denied: AtomicU64,
}

impl ProxyState {
    pub fn new(token_service: TokenService, default_allowlist: Allowlist) -> Self {
        Self {
            token_service,
            default_allowlist,
            http_client: reqwest::Client::new(),
            accepted: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        }
    }
}

/// Accept loop: binds `addr` and serves connections until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<ProxyState>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "sandbox-proxy listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let state = state.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = state.clone();
                        async move { handle_request(req, state).await }
                    });

                    if let Err(e) = http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(true)
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        tracing::debug!(%peer, error = %e, "proxy connection ended");
                    }
                });
            }
            _ = shutdown.changed() => {
                tracing::info!("sandbox-proxy shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ProxyState>,
) -> Result<Response<BoxBody<Bytes, Infallible>>, Infallible> {
    if req.method() == Method::CONNECT {
        return Ok(handle_connect(req, state).await);
    }

    let method = req.method().clone();
    let uri = req.uri().clone();

    let Some(host) = extract_absolute_uri_host(&uri) else {
        return Ok(proxy_error_response(&ProxyError::MalformedRequest(
            "proxy requires an absolute-form request URI".to_string(),
        )));
    };

    let policy = match resolve_policy(&req, &state) {
        Ok(p) => p,
        Err(e) => {
            log_decision(&method, &host, None, "-", "deny: bad credentials");
            state.denied.fetch_add(1, Ordering::Relaxed);
            return Ok(proxy_error_response(&e));
        }
    };

    if !policy.allowlist.allows(&host) {
        log_decision(&method, &host, None, policy.session_id.as_deref().unwrap_or("-"), "deny");
        state.denied.fetch_add(1, Ordering::Relaxed);
        return Ok(proxy_error_response(&ProxyError::HostNotAllowed(host)));
    }

    log_decision(&method, &host, None, policy.session_id.as_deref().unwrap_or("-"), "accept");
    state.accepted.fetch_add(1, Ordering::Relaxed);

    Ok(forward_request(req, &state).await)
}

async fn handle_connect(
    req: Request<hyper::body::Incoming>,
    state: Arc<ProxyState>,
) -> Response<BoxBody<Bytes, Infallible>> {
    let Some(authority) = req.uri().authority().cloned() else {
        return proxy_error_response(&ProxyError::MalformedRequest("CONNECT requires host:port".to_string()));
    };

    let host = authority.host().to_string();
    let port = authority.port_u16().unwrap_or(443);
    let target = format!("{host}:{port}");

    let policy = match resolve_policy(&req, &state) {
        Ok(p) => p,
        Err(e) => {
            log_decision(&Method::CONNECT, &host, Some(port), "-", "deny: bad credentials");
            state.denied.fetch_add(1, Ordering::Relaxed);
            return proxy_error_response(&e);
        }
    };

    if !policy.allowlist.allows(&host) {
        log_decision(&Method::CONNECT, &host, Some(port), policy.session_id.as_deref().unwrap_or("-"), "deny");
        state.denied.fetch_add(1, Ordering::Relaxed);
        return proxy_error_response(&ProxyError::HostNotAllowed(host));
    }

    log_decision(&Method::CONNECT, &host, Some(port), policy.session_id.as_deref().unwrap_or("-"), "accept");
    state.accepted.fetch_add(1, Ordering::Relaxed);

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client_stream = TokioIo::new(upgraded);
                match TcpStream::connect(&target).await {
                    Ok(mut server_stream) => {
                        if let Err(e) = tokio::io::copy_bidirectional(&mut client_stream, &mut server_stream).await {
                            tracing::debug!(%target, error = %e, "CONNECT tunnel closed");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(%target, error = %e, "CONNECT upstream dial failed");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(%target, error = %e, "CONNECT upgrade failed");
            }
        }
    });

    // 200 with no body: client begins TLS over the now-upgraded connection.
    // `CONNECT_COPY_BUF_HINT` documents the splice's buffer sizing; `copy_bidirectional`
    // manages its own internal buffers and doesn't take it as a parameter.
    let _ = CONNECT_COPY_BUF_HINT;
    Response::builder()
        .status(StatusCode::OK)
        .body(empty_body())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

fn resolve_policy<B>(req: &Request<B>, state: &ProxyState) -> Result<ResolvedPolicy, crate::error::ProxyError> {
    let header = req
        .headers()
        .get("Proxy-Authorization")
        .and_then(|v| v.to_str().ok());
    policy::resolve(header, &state.token_service, &state.default_allowlist, chrono::Utc::now())
}

async fn forward_request(
    req: Request<hyper::body::Incoming>,
    state: &ProxyState,
) -> Response<BoxBody<Bytes, Infallible>> {
    let method = req.method().clone();
    let uri = req.uri().clone();

    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET);
    let mut builder = state.http_client.request(reqwest_method, uri.to_string());

    for (name, value) in req.headers() {
        if is_hop_by_hop_or_proxy_header(name.as_str()) {
            continue;
        }
        if let Ok(v) = value.to_str() {
            builder = builder.header(name.as_str(), v);
        }
    }

    let body_bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return proxy_error_response(&ProxyError::MalformedRequest(format!("failed to read request body: {e}")));
        }
    };
    if !body_bytes.is_empty() {
        builder = builder.body(body_bytes.to_vec());
    }

    match builder.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let headers = response.headers().clone();
            match response.bytes().await {
                Ok(body) => {
                    let mut resp_builder = Response::builder().status(status);
                    for (name, value) in headers.iter() {
                        if !is_response_strip_header(name.as_str()) {
                            resp_builder = resp_builder.header(name.as_str(), value.as_bytes());
                        }
                    }
                    resp_builder.body(full_body(Bytes::from(body.to_vec()))).unwrap_or_else(|_| {
                        error_response(StatusCode::INTERNAL_SERVER_ERROR, "response build error")
                    })
                }
                Err(e) => proxy_error_response(&ProxyError::UpstreamUnavailable(format!("failed to read upstream response: {e}"))),
            }
        }
        Err(e) => proxy_error_response(&ProxyError::UpstreamUnavailable(format!("upstream request failed: {e}"))),
    }
}

/// Host extracted from an absolute-form request URI (`http://host[:port]/path`),
/// per spec.md §4.3 "Plain HTTP (absolute-URI requests)".
fn extract_absolute_uri_host(uri: &hyper::Uri) -> Option<String> {
    uri.host().map(str::to_string)
}

/// Strip `Host`, `Proxy-Authorization`, `Proxy-Connection`, and the usual
/// hop-by-hop set before forwarding the request upstream (spec.md §4.3).
fn is_hop_by_hop_or_proxy_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "host"
            | "proxy-authorization"
            | "proxy-connection"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Strip transport-level `Transfer-Encoding`/`Content-Encoding` on the way
/// back to the client (spec.md §4.3): `reqwest` already decoded the body, so
/// re-forwarding these headers would describe bytes that no longer match.
fn is_response_strip_header(name: &str) -> bool {
    matches!(name.to_ascii_lowercase().as_str(), "transfer-encoding" | "content-encoding" | "connection")
}

fn log_decision(method: &Method, host: &str, port: Option<u16>, session_id: &str, decision: &str) {
    match decision {
        "accept" => tracing::info!(%method, host, port, session_id, decision, "proxy decision"),
        _ => tracing::warn!(%method, host, port, session_id, decision, "proxy decision"),
    }
}

fn empty_body() -> BoxBody<Bytes, Infallible> {
    Empty::<Bytes>::new().map_err(|_| unreachable!()).boxed()
}

fn full_body(bytes: Bytes) -> BoxBody<Bytes, Infallible> {
    Full::new(bytes).map_err(|_| unreachable!()).boxed()
}

fn error_response(status: StatusCode, message: &str) -> Response<BoxBody<Bytes, Infallible>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(full_body(Bytes::from(message.to_string())))
        .unwrap_or_else(|_| Response::new(full_body(Bytes::from(message.to_string()))))
}

fn proxy_error_response(e: &ProxyError) -> Response<BoxBody<Bytes, Infallible>> {
    error_response(e.status(), &e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_stripped() {
        assert!(is_hop_by_hop_or_proxy_header("Host"));
        assert!(is_hop_by_hop_or_proxy_header("proxy-authorization"));
        assert!(is_hop_by_hop_or_proxy_header("Proxy-Connection"));
        assert!(!is_hop_by_hop_or_proxy_header("content-type"));
    }

    #[test]
    fn response_strip_headers() {
        assert!(is_response_strip_header("Transfer-Encoding"));
        assert!(is_response_strip_header("Content-Encoding"));
        assert!(!is_response_strip_header("content-length"));
    }

    #[test]
    fn absolute_uri_host_extracted() {
        let uri: hyper::Uri = "http://example.com/path?x=1".parse().unwrap();
        assert_eq!(extract_absolute_uri_host(&uri).as_deref(), Some("example.com"));
    }

    #[test]
    fn relative_uri_has_no_host() {
        let uri: hyper::Uri = "/path".parse().unwrap();
        assert_eq!(extract_absolute_uri_host(&uri), None);
    }
}
