//! Unix socket server for the guarded Docker-compatible endpoint.

use std::os::unix::fs::PermissionsExt;
use std::pin::pin;

use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::signal;
use tower::Service;
use tracing::{error, info};

use crate::config::SocketConfig;

/// Binds the guarded socket, applies ownership and permissions, and serves
/// connections until a shutdown signal arrives. The socket file is removed
/// on shutdown.
pub async fn serve(socket: &SocketConfig, app: Router) -> anyhow::Result<()> {
    // A stale socket from a previous run would make bind fail.
    let _ = std::fs::remove_file(&socket.path);
    if let Some(parent) = socket.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let listener = UnixListener::bind(&socket.path)?;

    // Ownership and permissions are applied before announcing readiness so
    // no client ever sees the socket in a more permissive state.
    if socket.uid.is_some() || socket.gid.is_some() {
        std::os::unix::fs::chown(&socket.path, socket.uid, socket.gid)?;
    }
    let mode = socket.mode_bits()?;
    std::fs::set_permissions(&socket.path, std::fs::Permissions::from_mode(mode))?;

    info!(
        path = %socket.path.display(),
        mode = %socket.mode,
        "listening on guarded socket"
    );

    let mut shutdown = pin!(shutdown_signal());
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let tower_service = app.clone();
                tokio::spawn(async move {
                    let hyper_service =
                        hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
                            tower_service.clone().call(request)
                        });

                    if let Err(err) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), hyper_service)
                        .with_upgrades()
                        .await
                    {
                        let msg = err.to_string().to_lowercase();
                        if !msg.contains("shutting down")
                            && !msg.contains("connection reset")
                            && !msg.contains("broken pipe")
                        {
                            error!("error serving connection: {}", err);
                        }
                    }
                });
            }
        }
    }

    let _ = std::fs::remove_file(&socket.path);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}
