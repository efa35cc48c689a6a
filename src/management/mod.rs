//! The management HTTP API: inspect and mutate the routing table at runtime,
//! and read back per-host traffic stats.
//!
//! Routes are mutated only through this surface once the process is up; the
//! startup snapshot load is the only other writer.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::routing::{Route, RoutingTable};
use crate::state::stats::StatsRegistry;

#[derive(Clone)]
struct ManagementState {
    routing: Arc<RoutingTable>,
    stats: Arc<StatsRegistry>,
}

/// Builds the management router: `GET /`, `PUT /<host>`, `DELETE /<host>`,
/// `GET /stats`, `GET /stats/<host>`.
pub fn router(routing: Arc<RoutingTable>, stats: Arc<StatsRegistry>) -> Router {
    let state = ManagementState { routing, stats };
    Router::new()
        .route("/", get(list_routes))
        .route("/stats", get(all_stats))
        .route("/stats/:host", get(host_stats))
        .route("/:host", put(set_route))
        .route("/:host", delete(delete_route))
        .with_state(state)
}

/// Serves the management API on `addr` until `shutdown` is cancelled.
async fn serve_one(
    addr: SocketAddr,
    routing: Arc<RoutingTable>,
    stats: Arc<StatsRegistry>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(
        component = "management",
        event = "listening",
        addr = %addr,
        "management API listening"
    );

    let router = router(routing, stats);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        })
        .await?;

    info!(component = "management", event = "stopped", addr = %addr, "management API stopped");
    Ok(())
}

/// Serves the management API on every address in `addrs` until `shutdown` is
/// cancelled. Each address gets its own listener task under a child token, so
/// one listener's bind/serve failure stops its siblings without reaching
/// back up to cancel the caller's (process-wide) shutdown.
pub async fn serve(
    addrs: Vec<SocketAddr>,
    routing: Arc<RoutingTable>,
    stats: Arc<StatsRegistry>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let children = shutdown.child_token();

    let mut tasks = tokio::task::JoinSet::new();
    for addr in addrs {
        let routing = routing.clone();
        let stats = stats.clone();
        let children = children.clone();
        tasks.spawn(async move { serve_one(addr, routing, stats, children).await });
    }

    let mut result = Ok(());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                children.cancel();
                result = Err(e);
            }
            Err(e) => {
                children.cancel();
                result = Err(e.into());
            }
        }
    }
    result
}

async fn list_routes(State(state): State<ManagementState>) -> impl IntoResponse {
    let snapshot = state.routing.snapshot();
    Json(snapshot)
}

async fn all_stats(State(state): State<ManagementState>) -> impl IntoResponse {
    Json(state.stats.snapshot())
}

async fn host_stats(
    Path(host): Path<String>,
    State(state): State<ManagementState>,
) -> impl IntoResponse {
    match state.stats.get(&host) {
        Some(stats) => (StatusCode::OK, Json(stats)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("no stats for host {host:?}") })),
        )
            .into_response(),
    }
}

async fn set_route(
    Path(host): Path<String>,
    State(state): State<ManagementState>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    match serde_json::from_value::<Route>(body) {
        Ok(route) => {
            state.routing.set(host.clone(), route);
            info!(component = "management", event = "route_set", host = %host, "route updated");
            (StatusCode::OK, Json(serde_json::json!({ "ok": true }))).into_response()
        }
        Err(e) => {
            error!(component = "management", event = "route_parse_failed", host = %host, error = %e, "malformed route body");
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn delete_route(
    Path(host): Path<String>,
    State(state): State<ManagementState>,
) -> impl IntoResponse {
    match state.routing.delete(&host) {
        Some(_) => (StatusCode::OK, Json(serde_json::json!({ "ok": true }))).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("no route for host {host:?}") })),
        )
            .into_response(),
    }
}
