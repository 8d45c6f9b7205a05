//! Upstream capability: forwards requests to the real Docker socket.
//!
//! Each forward opens a fresh HTTP/1.1 connection over the upstream unix
//! socket. Response bodies are relayed lazily, so fixed-length and chunked
//! (streaming) responses like logs and events both work. Attach and exec
//! use HTTP upgrades (101 Switching Protocols); after the upgrade the two
//! streams are bridged with `copy_bidirectional`.

use std::path::PathBuf;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;

use crate::error::{AppError, Result};

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Forwards a request to the real backend. Method, headers, and body
    /// must arrive unchanged.
    async fn forward(&self, req: Request<Body>) -> Result<Response<Body>>;
}

pub struct UnixUpstream {
    socket_path: PathBuf,
}

impl UnixUpstream {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }
}

#[async_trait]
impl Upstream for UnixUpstream {
    async fn forward(&self, mut req: Request<Body>) -> Result<Response<Body>> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            AppError::Upstream(format!("connect {}: {e}", self.socket_path.display()))
        })?;

        let (mut sender, conn) = http1::Builder::new()
            .handshake(TokioIo::new(stream))
            .await
            .map_err(|e| AppError::Upstream(format!("handshake failed: {e}")))?;

        // The connection task must keep running for upgrades to work.
        tokio::spawn(async move {
            if let Err(err) = conn.with_upgrades().await {
                let msg = err.to_string().to_lowercase();
                if !msg.contains("canceled") && !msg.contains("incomplete") {
                    tracing::debug!("upstream connection ended: {}", err);
                }
            }
        });

        let wants_upgrade = req.headers().get(header::UPGRADE).is_some()
            || req
                .headers()
                .get(header::CONNECTION)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"));

        let path_and_query = req
            .uri()
            .path_and_query()
            .map_or("/", |pq| pq.as_str())
            .to_string();
        let method = req.method().clone();
        let headers = req.headers().clone();
        let body = std::mem::take(req.body_mut());

        let mut up_req = hyper::Request::builder()
            .method(method)
            .uri(path_and_query)
            .body(body)
            .map_err(|e| AppError::Upstream(format!("failed to build upstream request: {e}")))?;
        *up_req.headers_mut() = headers;

        let response = sender
            .send_request(up_req)
            .await
            .map_err(|e| AppError::Upstream(format!("upstream request failed: {e}")))?;

        if wants_upgrade && response.status() == StatusCode::SWITCHING_PROTOCOLS {
            return bridge_upgrade(req, response);
        }

        let (parts, incoming) = response.into_parts();
        Ok(Response::from_parts(parts, Body::new(incoming)))
    }
}

/// Returns the 101 to the client and bridges both upgraded connections in
/// the background. Both upgrade futures are prepared before the response
/// is handed back.
fn bridge_upgrade(
    mut client_req: Request<Body>,
    upstream_response: hyper::Response<hyper::body::Incoming>,
) -> Result<Response<Body>> {
    let response_headers = upstream_response.headers().clone();

    let client_upgrade = hyper::upgrade::on(&mut client_req);
    let upstream_upgrade = hyper::upgrade::on(upstream_response);

    tokio::spawn(async move {
        let (client_io, upstream_io) = match tokio::try_join!(client_upgrade, upstream_upgrade) {
            Ok(pair) => pair,
            Err(err) => {
                tracing::debug!("upgrade bridging setup failed: {}", err);
                return;
            }
        };
        let mut client_io = TokioIo::new(client_io);
        let mut upstream_io = TokioIo::new(upstream_io);
        if let Err(err) = tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
            let msg = err.to_string().to_lowercase();
            if !msg.contains("broken pipe") && !msg.contains("connection reset") {
                tracing::debug!("upgrade bridge error: {}", err);
            }
        }
    });

    let mut response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .body(Body::empty())
        .map_err(|e| AppError::Upstream(format!("failed to build upgrade response: {e}")))?;
    *response.headers_mut() = response_headers;
    Ok(response)
}
