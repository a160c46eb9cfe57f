//! HTTP and WebSocket surface
//!
//! | Path              | Method | Description                        |
//! |-------------------|--------|------------------------------------|
//! | `/`, `/ws`        | GET    | WebSocket upgrade                  |
//! | `/upload`         | POST   | Multipart image upload             |
//! | `/hmr-retrigger`  | POST   | Re-touch changed files             |
//! | `/health`         | GET    | Liveness probe                     |
//!
//! Every non-OPTIONS request must carry `?secret=` when a secret is set.

use super::clients::Outbound;
use super::hmr;
use super::server::BrokerShared;
use crate::upload::{boundary_from_content_type, parse_multipart, save_uploads};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Query, Request, State,
    },
    http::{header, HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the broker router
pub(crate) fn router(shared: Arc<BrokerShared>) -> Router {
    let upload_limit = shared.config.server.upload_limit_bytes;
    Router::new()
        .route("/", get(ws_upgrade))
        .route("/ws", get(ws_upgrade))
        .route("/upload", post(upload))
        .route("/hmr-retrigger", post(hmr_retrigger))
        .route("/health", get(health_check))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(upload_limit))
        .layer(build_cors())
        .layer(middleware::from_fn_with_state(shared.clone(), require_secret))
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

fn build_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

#[derive(Deserialize)]
struct AuthParams {
    secret: Option<String>,
}

async fn require_secret(
    State(shared): State<Arc<BrokerShared>>,
    request: Request,
    next: Next,
) -> Response {
    // Preflight is answered by the CORS layer, always as 204
    if request.method() == Method::OPTIONS {
        let mut response = next.run(request).await;
        *response.status_mut() = StatusCode::NO_CONTENT;
        return response;
    }

    if let Some(expected) = shared
        .config
        .server
        .secret
        .as_deref()
        .filter(|s| !s.is_empty())
    {
        let provided = Query::<AuthParams>::try_from_uri(request.uri())
            .ok()
            .and_then(|Query(params)| params.secret);
        if provided.as_deref() != Some(expected) {
            tracing::warn!(path = %request.uri().path(), "Rejected unauthorized request");
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    }

    next.run(request).await
}

// =============================================================================
// WebSocket
// =============================================================================

async fn ws_upgrade(ws: WebSocketUpgrade, State(shared): State<Arc<BrokerShared>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, shared))
}

/// Pump one client socket until either side closes
async fn handle_socket(socket: WebSocket, shared: Arc<BrokerShared>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel for broker → client frames
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let client_id = shared.connect(tx).await;

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                Outbound::Text(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        tracing::debug!(client_id = %client_id, "WebSocket send failed");
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let recv_shared = shared.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => recv_shared.handle_text(client_id, &text).await,
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    shared.disconnect(&client_id).await;
}

// =============================================================================
// HTTP handlers
// =============================================================================

#[derive(Serialize)]
struct UploadResponse {
    paths: Vec<String>,
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

async fn upload(
    State(shared): State<Arc<BrokerShared>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.contains("multipart/form-data") {
        return json_error(StatusCode::BAD_REQUEST, "Expected multipart/form-data");
    }
    let Some(boundary) = boundary_from_content_type(content_type) else {
        return json_error(StatusCode::BAD_REQUEST, "No boundary in content-type");
    };

    let files = parse_multipart(&body, &boundary);
    match save_uploads(&shared.image_dir, &files).await {
        Ok(paths) => {
            tracing::info!(count = paths.len(), "Uploaded images");
            Json(UploadResponse {
                paths: paths
                    .iter()
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect(),
            })
            .into_response()
        }
        Err(e) => {
            tracing::error!("Upload failed: {}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn hmr_retrigger(State(shared): State<Arc<BrokerShared>>) -> impl IntoResponse {
    tokio::spawn(async move {
        hmr::retrigger(&shared.git, &shared.project_root).await;
    });
    "OK"
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn not_found() -> Response {
    json_error(StatusCode::NOT_FOUND, "Not found")
}
