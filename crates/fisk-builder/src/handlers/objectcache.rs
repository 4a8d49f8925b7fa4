//! Object cache over HTTP.
//!
//! - `GET /objectcache/{digest}`: the raw cache file, header included, with
//!   `Content-Length` set to its full size
//! - `GET /objectcache/info?objects=true&pending=true`: statistics as JSON

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::error::BuilderResult;
use crate::object_cache::{is_valid_digest, InfoQuery};
use crate::server::BuilderState;

pub fn router(state: Arc<BuilderState>) -> Router {
    Router::new()
        .route("/objectcache/info", get(info))
        .route("/objectcache/{digest}", get(object))
        .with_state(state)
}

pub async fn serve(
    state: Arc<BuilderState>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> BuilderResult<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "serving object cache");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn info(State(state): State<Arc<BuilderState>>, Query(query): Query<InfoQuery>) -> Response {
    match state.cache() {
        Some(cache) => Json(cache.info(query)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn object(State(state): State<Arc<BuilderState>>, Path(digest): Path<String>) -> Response {
    if !is_valid_digest(&digest) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let path = {
        let Some(mut cache) = state.cache() else {
            return StatusCode::NOT_FOUND.into_response();
        };
        if cache.get(&digest).is_none() {
            return StatusCode::NOT_FOUND.into_response();
        }
        cache.object_path(&digest)
    };

    // Evicted between lookup and open.
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    let len = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(e) => {
            tracing::warn!(%digest, error = %e, "cannot stat cached object");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    tracing::debug!(%digest, bytes = len, "serving cached object");

    (
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, len.to_string()),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response()
}
