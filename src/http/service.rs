//! Standalone admission service.
//!
//! Exposes the gate over HTTP for callers that cannot embed the middleware,
//! plus operator endpoints for policy refresh and invalidation.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::response::{apply_quota_headers, rejection_body, status_for};
use crate::error::TollgateError;
use crate::mesh::Cluster;
use crate::ratelimit::{AdmissionGate, AdmissionRequest, Decision, MetricsSnapshot};

/// Shared state behind every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    pub gate: Arc<AdmissionGate>,
    pub cluster: Option<Arc<Cluster>>,
}

impl AppState {
    pub fn new(gate: Arc<AdmissionGate>) -> Self {
        Self {
            gate,
            cluster: None,
        }
    }

    pub fn with_cluster(mut self, cluster: Arc<Cluster>) -> Self {
        self.cluster = Some(cluster);
        self
    }
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/admission/check", post(check))
        .route("/v1/policies/refresh", post(refresh_policies))
        .route("/v1/policies/invalidate", post(invalidate_policies))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct CheckResponse<'a> {
    allowed: bool,
    #[serde(flatten)]
    decision: &'a Decision,
}

async fn check(
    State(state): State<AppState>,
    payload: Result<Json<AdmissionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) =
        payload.map_err(|e| ApiError(TollgateError::InvalidRequest(e.body_text())))?;
    Ok(decide(&state, request).await)
}

#[instrument(skip_all, fields(entity_type = %request.entity_type, endpoint = %request.endpoint))]
async fn decide(state: &AppState, request: AdmissionRequest) -> Response {
    debug!("Processing admission check");

    let decision = state.gate.admit(&request).await;
    let mut headers = HeaderMap::new();
    apply_quota_headers(&mut headers, &decision);

    if decision.is_allowed() {
        let body = CheckResponse {
            allowed: true,
            decision: &decision,
        };
        (status_for(&decision), headers, Json(body)).into_response()
    } else {
        let mut body = rejection_body(decision.quota());
        body["decision"] = json!(decision);
        (status_for(&decision), headers, Json(body)).into_response()
    }
}

async fn refresh_policies(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let snapshot = state.gate.resolver().cache().refresh().await?;
    info!(version = snapshot.version(), "Policies refreshed on request");

    Ok(Json(json!({
        "version": snapshot.version(),
        "active_policies": snapshot.len(),
    })))
}

async fn invalidate_policies(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cache = state.gate.resolver().cache();
    cache.invalidate();

    let epoch = match &state.cluster {
        Some(cluster) => Some(cluster.announce_invalidation().await),
        None => None,
    };
    info!(epoch = ?epoch, "Policies invalidated on request");

    Json(json!({
        "invalidated": true,
        "version": cache.version(),
        "epoch": epoch,
    }))
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "store": state.gate.store().name(),
        "node_id": state.cluster.as_ref().map(|c| c.node_id().to_string()),
    }))
}

#[derive(Debug, Serialize)]
struct MetricsResponse {
    #[serde(flatten)]
    gate: MetricsSnapshot,
    policy_version: u64,
}

async fn metrics(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        gate: state.gate.metrics().snapshot(),
        policy_version: state.gate.resolver().cache().version(),
    })
}

/// Error returned by operator endpoints.
#[derive(Debug)]
pub struct ApiError(TollgateError);

impl From<TollgateError> for ApiError {
    fn from(err: TollgateError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            TollgateError::InvalidPolicy(_) => (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_POLICY"),
            TollgateError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            TollgateError::PolicyStore(_) | TollgateError::StoreUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        warn!(error = %self.0, status = %status, "Request failed");

        (
            status,
            Json(json!({
                "success": false,
                "error": {
                    "code": code,
                    "message": self.0.to_string(),
                }
            })),
        )
            .into_response()
    }
}
