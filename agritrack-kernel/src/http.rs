/**
 * HTTP API - Read access to the live fleet
 *
 * ROUTES :
 * - GET  /health                     liveness, no auth
 * - GET  /system/health              counters and transport status
 * - GET  /machines                   all snapshots
 * - GET  /machines/{id}              one snapshot
 * - GET  /machines/{id}/fuel?hours=  consumption report (default 24h)
 * - GET  /fleet/overview             counts, critical machines, fleet health
 * - POST /geofences/refresh          reload geofence assignments now
 * - DELETE /contacts/{machine_id}    drop a cached owner contact
 * - GET  /live                       SSE: `snapshot_set`, then `snapshot` events
 *
 * SECURITY :
 * Every route except /health requires the `x-api-key` header to match
 * AGRITRACK_API_KEY. Without a configured key the API is closed.
 */

use crate::fuel::ConsumptionReport;
use crate::health::KernelHealth;
use crate::kernel::Kernel;
use crate::models::MachineSnapshot;
use crate::snapshots::FleetOverview;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

const DEFAULT_FUEL_WINDOW_HOURS: u32 = 24;
const MAX_FUEL_WINDOW_HOURS: u32 = 24 * 30;

#[derive(Clone)]
pub struct AppState {
    pub kernel: Arc<Kernel>,
    pub api_key: Option<Arc<str>>,
}

impl AppState {
    pub fn new(kernel: Arc<Kernel>, api_key: Option<String>) -> Self {
        Self { kernel, api_key: api_key.filter(|k| !k.is_empty()).map(Arc::from) }
    }
}

async fn require_api_key(
    State(app): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref() else {
        warn!("AGRITRACK_API_KEY not set, API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/machines", get(list_machines))
        .route("/machines/{id}", get(get_machine))
        .route("/machines/{id}/fuel", get(get_fuel_report))
        .route("/fleet/overview", get(get_fleet_overview))
        .route("/geofences/refresh", post(refresh_geofences))
        .route("/contacts/{machine_id}", delete(invalidate_contact))
        .route("/live", get(live))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.kernel.health_report())
}

async fn list_machines(State(app): State<AppState>) -> Json<Vec<MachineSnapshot>> {
    Json(app.kernel.snapshots.all())
}

async fn get_machine(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MachineSnapshot>, StatusCode> {
    app.kernel.snapshots.get(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Deserialize)]
struct FuelParams {
    hours: Option<u32>,
}

async fn get_fuel_report(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<FuelParams>,
) -> Result<Json<ConsumptionReport>, StatusCode> {
    let hours = params.hours.unwrap_or(DEFAULT_FUEL_WINDOW_HOURS);
    if hours == 0 || hours > MAX_FUEL_WINDOW_HOURS {
        return Err(StatusCode::BAD_REQUEST);
    }
    if app.kernel.snapshots.get(&id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let kernel = &app.kernel;
    let window = time::Duration::hours(hours as i64);
    let report = kernel
        .fuel
        .consumption_report(&id, window, kernel.clock.now(), kernel.store.as_ref())
        .await;
    Ok(Json(report))
}

async fn get_fleet_overview(State(app): State<AppState>) -> Json<FleetOverview> {
    Json(app.kernel.snapshots.fleet_overview())
}

async fn refresh_geofences(State(app): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    match app.kernel.geofences.refresh_assignments(app.kernel.store.as_ref()).await {
        Ok(count) => (StatusCode::OK, Json(json!({ "ok": true, "assignments": count }))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ok": false, "error": e.to_string() })),
        ),
    }
}

async fn invalidate_contact(
    State(app): State<AppState>,
    Path(machine_id): Path<String>,
) -> Json<serde_json::Value> {
    let invalidated = app.kernel.contacts.invalidate(&machine_id);
    Json(json!({ "machine_id": machine_id, "invalidated": invalidated }))
}

async fn live(State(app): State<AppState>) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let (initial, receiver) = app.kernel.hub.subscribe(&app.kernel.snapshots);
    let first =
        stream::once(async move { Event::default().event("snapshot_set").json_data(initial) });

    let updates = stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(snapshot) => {
                    let event = Event::default().event("snapshot").json_data(snapshot);
                    return Some((event, receiver));
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "live subscriber lagging"),
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(first.chain(updates)).keep_alive(KeepAlive::default())
}
