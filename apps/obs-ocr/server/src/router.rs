use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use axum::{
    extract::{State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;

use crate::session::{ProxySession, SessionSettings};

pub use obs_ocr_core::wire::OBS_JSON_SUBPROTOCOL;

pub struct AppState {
    settings: Arc<SessionSettings>,
    metrics: Option<PrometheusHandle>,
    next_session_id: AtomicU64,
}

impl AppState {
    pub fn new(settings: SessionSettings, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            settings: Arc::new(settings),
            metrics,
            next_session_id: AtomicU64::new(1),
        }
    }

    fn allocate_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let limit = state.settings.upstream.max_frame_bytes;
    ws.protocols([OBS_JSON_SUBPROTOCOL])
        .max_frame_size(limit)
        .max_message_size(limit)
        .on_upgrade(move |socket| async move {
            let subprotocol = socket
                .protocol()
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);
            let session = ProxySession::new(state.allocate_session_id(), Arc::clone(&state.settings));
            session.serve(socket, subprotocol.as_deref()).await;
        })
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
