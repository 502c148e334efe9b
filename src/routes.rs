use std::{future::Future, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json,
    Router,
};
use data_model::{ClaimRequest, DeviceDescriptor, PreparedDevice};
use serde::{Deserialize, Serialize};
use state_store::prepared_claims::PreparedClaim;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::{claims::ClaimHandler, errors::AllocatorError};

#[derive(Clone)]
pub struct RouteState {
    pub handler: Arc<ClaimHandler>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/claims", post(prepare_claim))
        .route("/v1/claims/{claim_id}", get(get_claim).delete(unprepare_claim))
        .route("/v1/devices", get(list_devices))
        .route("/v1/devices/{uid}/taints", post(taint_device))
        .route("/v1/devices/{uid}/taints/{reason}", delete(untaint_device))
        .layer(TraceLayer::new_for_http())
        .with_state(route_state)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareResponse {
    pub claim_id: String,
    pub devices: Vec<PreparedDevice>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaintRequest {
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    #[serde(flatten)]
    pub device: DeviceDescriptor,
    pub taints: Vec<String>,
    pub claims: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceList {
    pub devices: Vec<DeviceView>,
}

async fn healthz() -> &'static str {
    "ok"
}

/// Runs request work on its own task. If the client goes away the request
/// future is dropped, which cancels the token; the work then stops before
/// its next state write instead of being torn down halfway.
async fn run_cancellable<T, F, Fut>(work: F) -> Result<T, AllocatorError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, AllocatorError>> + Send + 'static,
    T: Send + 'static,
{
    let token = CancellationToken::new();
    let _guard = token.clone().drop_guard();
    tokio::spawn(work(token))
        .await
        .map_err(|e| AllocatorError::Environment(format!("request task failed: {e}")))?
}

async fn prepare_claim(
    State(state): State<RouteState>,
    Json(request): Json<ClaimRequest>,
) -> Result<Json<PrepareResponse>, AllocatorError> {
    let handler = state.handler.clone();
    let devices = run_cancellable(move |cancel| async move {
        handler.prepare(&request, &cancel).await.map(|devices| PrepareResponse {
            claim_id: request.claim_id.clone(),
            devices,
        })
    })
    .await?;
    Ok(Json(devices))
}

async fn unprepare_claim(
    State(state): State<RouteState>,
    Path(claim_id): Path<String>,
) -> Result<StatusCode, AllocatorError> {
    let handler = state.handler.clone();
    run_cancellable(move |cancel| async move { handler.unprepare(&claim_id, &cancel).await }).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_claim(
    State(state): State<RouteState>,
    Path(claim_id): Path<String>,
) -> Result<Json<PreparedClaim>, AllocatorError> {
    state
        .handler
        .prepared_claim(&claim_id)
        .await
        .map(Json)
        .ok_or_else(|| AllocatorError::not_found("claim", &claim_id))
}

async fn taint_device(
    State(state): State<RouteState>,
    Path(uid): Path<String>,
    Json(request): Json<TaintRequest>,
) -> Result<StatusCode, AllocatorError> {
    let added = state.handler.taint(&uid, &request.reason).await?;
    Ok(if added { StatusCode::CREATED } else { StatusCode::OK })
}

async fn untaint_device(
    State(state): State<RouteState>,
    Path((uid, reason)): Path<(String, String)>,
) -> Result<StatusCode, AllocatorError> {
    state.handler.untaint(&uid, &reason).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_devices(State(state): State<RouteState>) -> Result<Json<DeviceList>, AllocatorError> {
    let current = state.handler.state().await?.value;
    let devices = current
        .allocatable_devices
        .values()
        .map(|device| DeviceView {
            taints: current
                .tainted_devices
                .get(&device.uid)
                .map(|t| t.reasons.iter().cloned().collect())
                .unwrap_or_default(),
            claims: current
                .consumption(&device.uid, None)
                .holders
                .into_iter()
                .collect(),
            device: device.clone(),
        })
        .collect();
    Ok(Json(DeviceList { devices }))
}
