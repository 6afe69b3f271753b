// src/http.rs
//
// HTTP admin surface (spec.md §6): the exact shapes the core promises to
// serve, routed straight into `engine::admin::AdminOps`. Grounded on
// EvanL1-VoltageEMS/services/netsrv/src/config_api.rs's `State` extractor
// + `Router` + `Json` idiom — handlers here stay thin on purpose, since
// all the actual mutation/atomicity logic already lives in `AdminOps`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{delete, get, post};
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::engine::admin::AdminOps;
use crate::engine::error::EngineError;
use crate::engine::model::Device;
use crate::tlog;

#[derive(Clone)]
pub struct ApiState {
    pub admin: Arc<AdminOps>,
}

pub fn router(admin: Arc<AdminOps>) -> Router {
    Router::new()
        .route("/api/devices", get(list_devices).post(add_device))
        .route("/api/devices/:id", delete(remove_device))
        .route("/api/values", get(list_values))
        .route("/api/connections", get(list_connections))
        .route("/api/write", post(write_tag))
        .with_state(ApiState { admin })
}

/// Uniform mapping of `EngineError` onto a JSON body + status code
/// (spec.md §7).
#[derive(Serialize)]
struct ApiError {
    error: String,
}

fn error_response(err: EngineError) -> (StatusCode, Json<ApiError>) {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ApiError { error: err.to_string() }))
}

async fn list_devices(State(state): State<ApiState>) -> Json<Vec<Device>> {
    Json(state.admin.list_devices())
}

async fn add_device(
    State(state): State<ApiState>,
    Json(device): Json<Device>,
) -> Result<Json<Device>, (StatusCode, Json<ApiError>)> {
    state.admin.add_device(device).await.map(Json).map_err(error_response)
}

async fn remove_device(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    state
        .admin
        .remove_device(&id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(error_response)
}

async fn list_values(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.admin.values()).unwrap_or(serde_json::Value::Null))
}

async fn list_connections(State(state): State<ApiState>) -> Json<Vec<crate::engine::modem::ModemConnection>> {
    Json(state.admin.connections())
}

#[derive(Deserialize)]
struct WriteRequest {
    #[serde(rename = "deviceId")]
    device_id: String,
    #[serde(rename = "tagName")]
    tag_name: String,
    value: String,
}

async fn write_tag(
    State(state): State<ApiState>,
    Json(req): Json<WriteRequest>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    match state.admin.write_tag(&req.device_id, &req.tag_name, &req.value).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) => {
            tlog!("[Http] write {}.{} failed: {}", req.device_id, req.tag_name, e);
            Err(error_response(e))
        }
    }
}
