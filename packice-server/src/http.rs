use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use packice_core::transport::wire::{
    blobs_to_wire_paths, WireAcquireRequest, WireAcquireResponse, WireError, WireLeaseRequest,
    WireObject,
};
use packice_core::{PackError, Peer, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

/// Client-supplied dedup key for seal/release replays.
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// How long a deduplicated response is replayed.
pub const IDEMPOTENCY_WINDOW: Duration = Duration::from_secs(60);

/// One dedup slot per idempotency key. The cell is the in-flight marker:
/// it is published under the map lock before the operation dispatches, so
/// a concurrent retry with the same key awaits the first execution's
/// outcome instead of re-executing.
struct IdempotencyEntry {
    at: Instant,
    outcome: Arc<OnceCell<(u16, String)>>,
}

pub struct AppState {
    peer: Arc<dyn Peer>,
    idempotency: Mutex<HashMap<String, IdempotencyEntry>>,
}

impl AppState {
    fn idem_slot(&self, key: &str) -> Arc<OnceCell<(u16, String)>> {
        let mut cache = self.idempotency.lock().unwrap_or_else(|e| e.into_inner());
        cache.retain(|_, entry| entry.at.elapsed() < IDEMPOTENCY_WINDOW);
        cache
            .entry(key.to_string())
            .or_insert_with(|| IdempotencyEntry {
                at: Instant::now(),
                outcome: Arc::new(OnceCell::new()),
            })
            .outcome
            .clone()
    }
}

pub fn router(peer: Arc<dyn Peer>) -> Router {
    let state = Arc::new(AppState {
        peer,
        idempotency: Mutex::new(HashMap::new()),
    });
    Router::new()
        .route("/acquire", post(acquire))
        .route("/seal", post(seal))
        .route("/discard", post(discard))
        .route("/release", post(release))
        .route("/renew", post(renew))
        .with_state(state)
}

pub async fn run_http_server(peer: Arc<dyn Peer>, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP server listening on {}", addr);
    axum::serve(listener, router(peer))
        .await
        .map_err(|e| PackError::Internal(e.to_string()))
}

fn error_parts(err: &PackError) -> (u16, String) {
    let body = serde_json::to_string(&WireError::from_err(err))
        .unwrap_or_else(|_| r#"{"error":{"kind":"Internal","message":"encoding"}}"#.to_string());
    (err.http_status(), body)
}

fn parts_response(status: u16, body: String) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

async fn acquire(
    State(state): State<Arc<AppState>>,
    Json(req): Json<WireAcquireRequest>,
) -> Response {
    match state.peer.acquire(req.into_request()).await {
        Ok(result) => {
            let payload = WireAcquireResponse {
                lease_id: result.lease.lease_id.clone(),
                object: WireObject::from(&result.object),
                blobs: blobs_to_wire_paths(&result.object.object_id, &result.blobs),
            };
            (StatusCode::OK, Json(payload)).into_response()
        }
        Err(e) => {
            let (status, body) = error_parts(&e);
            parts_response(status, body)
        }
    }
}

/// Run a lease operation, deduplicating by idempotency key. A replayed key
/// inside the window returns the first outcome; a concurrent retry awaits
/// the in-flight execution rather than dispatching a second one.
async fn lease_op(
    state: &AppState,
    headers: &HeaderMap,
    op: &'static str,
    lease_id: &str,
    dedup: bool,
) -> Response {
    let idem_key = if dedup {
        headers
            .get(IDEMPOTENCY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|key| format!("{}:{}", op, key))
    } else {
        None
    };

    let Some(key) = idem_key else {
        let (status, body) = run_lease_op(state, op, lease_id).await;
        return parts_response(status, body);
    };

    let slot = state.idem_slot(&key);
    if slot.initialized() {
        tracing::debug!("replaying {} for idempotency key {}", op, key);
    }
    let (status, body) = slot
        .get_or_init(|| run_lease_op(state, op, lease_id))
        .await
        .clone();
    parts_response(status, body)
}

async fn run_lease_op(state: &AppState, op: &'static str, lease_id: &str) -> (u16, String) {
    let outcome = match op {
        "seal" => state.peer.seal(lease_id).await,
        "discard" => state.peer.discard(lease_id).await,
        "release" => state.peer.release(lease_id).await,
        "renew" => state.peer.renew(lease_id).await,
        _ => Err(PackError::Internal(format!("unknown op {}", op))),
    };
    match outcome {
        Ok(()) => (200, r#"{"status":"ok"}"#.to_string()),
        Err(e) => error_parts(&e),
    }
}

async fn seal(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<WireLeaseRequest>,
) -> Response {
    lease_op(&state, &headers, "seal", &req.lease_id, true).await
}

async fn discard(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<WireLeaseRequest>,
) -> Response {
    lease_op(&state, &headers, "discard", &req.lease_id, false).await
}

async fn release(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<WireLeaseRequest>,
) -> Response {
    lease_op(&state, &headers, "release", &req.lease_id, true).await
}

async fn renew(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<WireLeaseRequest>,
) -> Response {
    lease_op(&state, &headers, "renew", &req.lease_id, false).await
}
