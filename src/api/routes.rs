use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, Request, State},
    http::{StatusCode, Uri, header, uri::PathAndQuery},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};
use url::form_urlencoded;

use super::models::{DeleteResponse, ImageSummary, ProgressEvent, PullQuery};
use crate::error::{AppError, Result};
use crate::proxy::Upstream;
use crate::rules::{Route, RuleTable};
use crate::store::{ModelStore, PullProgress, StoreError};

/// State shared by every request task. The rule table is immutable after
/// startup; store and upstream are capabilities injected at construction.
#[derive(Clone)]
pub struct AppState {
    pub rules: Arc<RuleTable>,
    pub store: Arc<dyn ModelStore>,
    pub upstream: Arc<dyn Upstream>,
}

/// Builds the application router: one fallback dispatcher consulting the
/// rule table, since routing here is ordered pattern matching rather than
/// exact paths.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .fallback(dispatch)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn dispatch(State(state): State<AppState>, req: Request) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let result = match state.rules.direct(&method, &path) {
        Some(Route::Passthrough) => forward(state, req, false).await,
        Some(Route::PassthroughReencode) => forward(state, req, true).await,
        Some(Route::ImageList) => image_list(state).await,
        Some(Route::ImagePull) => image_pull(state, req).await,
        Some(Route::ImageDelete) => image_delete(state, req).await,
        Some(Route::NotImplemented) | None => Err(AppError::NotImplemented(format!(
            "{method} {path} not implemented yet"
        ))),
    };

    result.unwrap_or_else(|err| {
        warn!(error = %err, "handler returned error");
        err.into_response()
    })
}

async fn forward(state: AppState, mut req: Request, reencode: bool) -> Result<Response> {
    if reencode {
        reencode_query(&mut req)?;
    }
    state.upstream.forward(req).await
}

/// Rebuilds the query string in place. This is an identity transform kept
/// for wire compatibility; it must never filter or rewrite parameters.
fn reencode_query(req: &mut Request) -> Result<()> {
    let Some(query) = req.uri().query() else {
        return Ok(());
    };

    let pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    serializer.extend_pairs(pairs);
    let encoded = serializer.finish();

    let path_and_query = if encoded.is_empty() {
        req.uri().path().to_string()
    } else {
        format!("{}?{}", req.uri().path(), encoded)
    };

    let mut parts = req.uri().clone().into_parts();
    parts.path_and_query = Some(
        PathAndQuery::try_from(path_and_query.as_str())
            .map_err(|e| AppError::Internal(format!("failed to rebuild query string: {e}")))?,
    );
    *req.uri_mut() = Uri::from_parts(parts)
        .map_err(|e| AppError::Internal(format!("failed to rebuild request uri: {e}")))?;
    Ok(())
}

#[instrument(name = "image_list", skip_all)]
async fn image_list(state: AppState) -> Result<Response> {
    let entries = state
        .store
        .walk_manifests()
        .await
        .map_err(AppError::Store)?;

    let mut images = Vec::new();
    let mut skipped = 0usize;
    for entry in entries.into_iter().filter(|e| !e.is_dir) {
        let (repository, tag) = entry
            .rel_path
            .rsplit_once('/')
            .unwrap_or(("", entry.rel_path.as_str()));
        let reference = format!("{repository}:{tag}");

        match state.store.get_model(&reference).await {
            Ok(model) => images.push(ImageSummary {
                id: model.digest,
                repo_tags: vec![reference],
                size: model.size,
                created: entry.modified.timestamp(),
            }),
            Err(err) => {
                // Listing is best effort: a manifest that cannot be
                // resolved right now is skipped, not fatal.
                warn!(reference = %reference, error = %err, "skipping manifest entry");
                skipped += 1;
            }
        }
    }

    info!(count = images.len(), skipped, "listed models");
    Ok(Json(images).into_response())
}

#[instrument(name = "image_pull", skip_all)]
async fn image_pull(state: AppState, req: Request) -> Result<Response> {
    let Query(query) = Query::<PullQuery>::try_from_uri(req.uri())
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    let image = query.from_image.unwrap_or_default();
    let tag = query.tag.unwrap_or_else(|| "latest".to_string());
    let reference = format!("{image}:{tag}");
    info!(reference = %reference, "pulling model");

    let (tx, mut rx) = mpsc::channel::<PullProgress>(32);
    let cancel = CancellationToken::new();
    // The guard cancels the token when dropped, so a client disconnect
    // while still waiting for the first progress event (manifest fetch,
    // first chunk) aborts the pull instead of detaching it.
    let cancel_guard = cancel.clone().drop_guard();

    let store = Arc::clone(&state.store);
    let pull_reference = reference.clone();
    let pull_cancel = cancel.clone();
    let task =
        tokio::spawn(async move { store.pull(&pull_reference, pull_cancel, tx).await });

    // The status is committed at the first byte written, so wait for the
    // first progress event (or early completion) before choosing between a
    // plain error response and a streaming body.
    match rx.recv().await {
        None => match task.await.map_err(|e| AppError::Internal(e.to_string()))? {
            Ok(()) => Ok(json_stream(Body::empty())),
            Err(err) => Err(AppError::Store(err)),
        },
        Some(first) => {
            let (body_tx, body_rx) = mpsc::channel::<std::result::Result<Bytes, Infallible>>(32);
            tokio::spawn(stream_pull_events(first, rx, task, body_tx, cancel_guard));
            Ok(json_stream(Body::from_stream(ReceiverStream::new(body_rx))))
        }
    }
}

/// Relays progress events onto the response body as concatenated JSON
/// values. A failure after streaming has begun cannot change the committed
/// status; it is surfaced as one final error object on the same stream.
/// Returning drops the guard, which cancels the in-flight pull, so the
/// client going away (closed body channel or failed send) aborts the
/// download.
async fn stream_pull_events(
    first: PullProgress,
    mut rx: mpsc::Receiver<PullProgress>,
    task: JoinHandle<std::result::Result<(), StoreError>>,
    body_tx: mpsc::Sender<std::result::Result<Bytes, Infallible>>,
    _cancel_guard: DropGuard,
) {
    if !send_json(&body_tx, &ProgressEvent::from(first)).await {
        return;
    }
    loop {
        tokio::select! {
            _ = body_tx.closed() => {
                return;
            }
            next = rx.recv() => match next {
                Some(event) => {
                    if !send_json(&body_tx, &ProgressEvent::from(event)).await {
                        return;
                    }
                }
                None => break,
            }
        }
    }

    let outcome = match task.await {
        Ok(outcome) => outcome,
        Err(err) => {
            let _ = send_json(&body_tx, &serde_json::json!({"message": err.to_string()})).await;
            return;
        }
    };
    if let Err(err) = outcome {
        warn!(error = %err, "pull failed after streaming began");
        let _ = send_json(&body_tx, &serde_json::json!({"message": err.to_string()})).await;
    }
}

async fn send_json<T: Serialize>(
    tx: &mpsc::Sender<std::result::Result<Bytes, Infallible>>,
    value: &T,
) -> bool {
    let Ok(mut buf) = serde_json::to_vec(value) else {
        return true;
    };
    buf.push(b'\n');
    tx.send(Ok(Bytes::from(buf))).await.is_ok()
}

fn json_stream(body: Body) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

#[instrument(name = "image_delete", skip_all)]
async fn image_delete(state: AppState, req: Request) -> Result<Response> {
    let reference = req
        .uri()
        .path()
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    info!(reference = %reference, "deleting model");

    match state.store.delete(&reference).await {
        Ok(()) => {}
        Err(StoreError::NotFound(_)) => return Err(AppError::ModelNotFound(reference)),
        Err(err) => return Err(AppError::Store(err)),
    }

    // The manifest is already gone; a failed prune still reports 500 even
    // though the deletion stands.
    state.store.prune().await.map_err(AppError::Store)?;

    Ok(Json(vec![DeleteResponse { deleted: reference }]).into_response())
}
