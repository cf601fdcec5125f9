//! Local HTTP server backing endpoint-executor tests.
//!
//! Routes cover the behaviors the engine must handle: delays, error
//! statuses, rate limiting that recovers, and oversized bodies. The server
//! records call order and peak concurrency for timing assertions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use serde_json::json;

#[derive(Default)]
struct ServerState {
    hits: Mutex<HashMap<String, u64>>,
    call_order: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ServerState {
    fn enter(&self, path: &str) {
        self.hits
            .lock()
            .unwrap()
            .entry(path.to_string())
            .and_modify(|c| *c += 1)
            .or_insert(1);
        self.call_order.lock().unwrap().push(path.to_string());

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handle to a running endpoint server.
#[derive(Clone)]
pub struct EndpointServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
}

impl EndpointServer {
    /// Absolute URL for a path on this server.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// How many times a path was hit.
    pub fn hits(&self, path: &str) -> u64 {
        self.state
            .hits
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    /// Paths in arrival order.
    pub fn call_order(&self) -> Vec<String> {
        self.state.call_order.lock().unwrap().clone()
    }

    /// Peak number of requests in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
    state.enter("/health");
    state.leave();
    Json(json!({"ok": true}))
}

async fn slow(
    State(state): State<Arc<ServerState>>,
    Path(ms): Path<u64>,
) -> Json<serde_json::Value> {
    let path = format!("/slow/{ms}");
    state.enter(&path);
    tokio::time::sleep(Duration::from_millis(ms)).await;
    state.leave();
    Json(json!({"slept_ms": ms}))
}

async fn named_slow(
    State(state): State<Arc<ServerState>>,
    Path((name, ms)): Path<(String, u64)>,
) -> Json<serde_json::Value> {
    let path = format!("/named-slow/{name}/{ms}");
    state.enter(&path);
    tokio::time::sleep(Duration::from_millis(ms)).await;
    state.leave();
    Json(json!({"name": name, "slept_ms": ms}))
}

async fn fail(
    State(state): State<Arc<ServerState>>,
    Path(status): Path<u16>,
) -> (StatusCode, Json<serde_json::Value>) {
    let path = format!("/fail/{status}");
    state.enter(&path);
    state.leave();
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(json!({"error": format!("forced status {status}")})),
    )
}

/// Returns 429 for the first `failures` hits of a given key, 200 after.
async fn flaky(
    State(state): State<Arc<ServerState>>,
    Path((key, failures)): Path<(String, u64)>,
) -> (StatusCode, Json<serde_json::Value>) {
    let path = format!("/flaky/{key}/{failures}");
    state.enter(&path);
    let hit = state
        .hits
        .lock()
        .unwrap()
        .get(&path)
        .copied()
        .unwrap_or(0);
    state.leave();
    if hit <= failures {
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "rate limited"})),
        )
    } else {
        (StatusCode::OK, Json(json!({"recovered": true})))
    }
}

async fn big(State(state): State<Arc<ServerState>>, Path(bytes): Path<usize>) -> String {
    let path = format!("/big/{bytes}");
    state.enter(&path);
    state.leave();
    "x".repeat(bytes)
}

async fn echo(
    State(state): State<Arc<ServerState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    state.enter("/echo");
    state.leave();
    let headers: HashMap<String, String> = headers
        .iter()
        .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
        .collect();
    Json(json!({"body": body, "headers": headers}))
}

/// Spawn the server on an ephemeral port.
pub async fn spawn_endpoint_server() -> EndpointServer {
    let state = Arc::new(ServerState::default());

    let app = axum::Router::new()
        .route("/health", get(health))
        .route("/slow/{ms}", get(slow))
        .route("/named-slow/{name}/{ms}", get(named_slow))
        .route("/fail/{status}", get(fail))
        .route("/flaky/{key}/{failures}", get(flaky))
        .route("/big/{bytes}", get(big))
        .route("/echo", post(echo))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind endpoint server");
    let addr = listener.local_addr().expect("failed to read local addr");

    tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("endpoint server crashed");
    });

    EndpointServer { addr, state }
}
