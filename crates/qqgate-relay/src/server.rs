// SPDX-License-Identifier: MIT
//! The relay's axum HTTP server. Loopback-only by default (the operator
//! opts into a wider bind address through `relay.host` in config); every
//! response carries the same defensive headers regardless of bind address.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{info, warn};

use crate::registry::{now_unix, Registry};
use crate::sign::verify;

static NO_SNIFF: HeaderValue = HeaderValue::from_static("nosniff");
static DENY_FRAME: HeaderValue = HeaderValue::from_static("DENY");
static NO_REFERRER: HeaderValue = HeaderValue::from_static("no-referrer");

pub struct RelayState {
    pub registry: Arc<Registry>,
    pub mac_key: Vec<u8>,
}

#[derive(Deserialize)]
struct TokenQuery {
    exp: i64,
    sig: String,
}

async fn security_headers(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let mut resp = next.run(req).await;
    let h = resp.headers_mut();
    h.insert(axum::http::header::X_CONTENT_TYPE_OPTIONS, NO_SNIFF.clone());
    h.insert(axum::http::header::X_FRAME_OPTIONS, DENY_FRAME.clone());
    h.insert(axum::http::header::REFERRER_POLICY, NO_REFERRER.clone());
    resp
}

async fn serve_media(
    State(state): State<Arc<RelayState>>,
    AxumPath(id): AxumPath<String>,
    Query(q): Query<TokenQuery>,
) -> Response {
    let now = now_unix();
    if now > q.exp {
        return (StatusCode::GONE, "link expired").into_response();
    }
    if !verify(&state.mac_key, &id, q.exp, &q.sig) {
        warn!(%id, "relay signature verification failed");
        return (StatusCode::FORBIDDEN, "bad signature").into_response();
    }
    let Some(path) = state.registry.resolve(&id, now) else {
        return (StatusCode::NOT_FOUND, "unknown or expired media id").into_response();
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            ([(axum::http::header::CONTENT_TYPE, mime.as_ref().to_string())], bytes).into_response()
        }
        Err(err) => {
            warn!(error = %err, path = %path.display(), "relay file read failed");
            (StatusCode::NOT_FOUND, "file unavailable").into_response()
        }
    }
}

pub fn router(path_prefix: &str, state: Arc<RelayState>) -> Router {
    let route = format!("{}/:id", path_prefix.trim_end_matches('/'));
    Router::new()
        .route(&route, get(serve_media))
        .with_state(state)
        .layer(axum::middleware::from_fn(security_headers))
        // A relay URL is single-use-ish and already TTL'd; tell any
        // intermediate cache not to keep the bytes around past that.
        .layer(SetResponseHeaderLayer::if_not_present(
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
}

pub async fn serve(addr: SocketAddr, router: Router, shutdown: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
    info!(%addr, "media relay listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
