use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;

use crate::FgwState;
use crate::catalog::{CatalogError, CatalogStore as _, DeviceActionRecord};
use crate::extract::{CustomerToken, RequestId};
use crate::http::HttpError;
use crate::token::CustomerClaims;

pub fn make_router<S>(state: FgwState) -> Router<S> {
    Router::new()
        .route("/{id}/approve", post(approve_action))
        .route("/{id}/reject", post(reject_action))
        .with_state(state)
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub(super) struct DecisionRequest {
    #[serde(default)]
    reason: Option<String>,
}

pub(super) async fn approve_action(
    State(state): State<FgwState>,
    CustomerToken(claims): CustomerToken,
    RequestId(correlation_id): RequestId,
    Path(action_id): Path<String>,
    body: Option<Json<DecisionRequest>>,
) -> Result<Json<Value>, HttpError> {
    let reason = body.map(|Json(body)| body.reason).unwrap_or_default();
    let record = decide(&state, &claims, &action_id, true, reason).await?;

    // An approved action becomes a queued command for its device. Script
    // actions ship as a signed package the device verifies before running.
    let params = if record.action_type == "run_script" {
        build_script_package(&state, &record)?
    } else {
        record.params.clone()
    };

    if let Err(error) = state
        .queue
        .enqueue(&record.device_id, &record.tenant_id, &record.action_type, params, 5, correlation_id)
        .await
    {
        warn!(%error, action.id = %record.id, "Couldn't dispatch approved device action");
    }

    Ok(Json(json!({"id": record.id, "status": record.status})))
}

pub(super) async fn reject_action(
    State(state): State<FgwState>,
    CustomerToken(claims): CustomerToken,
    RequestId(_correlation_id): RequestId,
    Path(action_id): Path<String>,
    body: Option<Json<DecisionRequest>>,
) -> Result<Json<Value>, HttpError> {
    let reason = body.map(|Json(body)| body.reason).unwrap_or_default();
    let record = decide(&state, &claims, &action_id, false, reason).await?;

    Ok(Json(json!({"id": record.id, "status": record.status})))
}

fn build_script_package(state: &FgwState, record: &DeviceActionRecord) -> Result<Value, HttpError> {
    let script = record
        .params
        .get("script")
        .and_then(Value::as_str)
        .ok_or_else(|| HttpError::bad_request().msg("run_script action is missing its script"))?;

    let manifest: crate::integrity::ScriptManifest = record
        .params
        .get("manifest")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(HttpError::bad_request().with_msg("invalid script manifest").err())?
        .unwrap_or_else(|| crate::integrity::ScriptManifest {
            interpreter: "bash".to_owned(),
            timeout_secs: 300,
            capabilities: Vec::new(),
            env: Default::default(),
            working_dir: None,
            retry: None,
        });

    let package = state
        .signer
        .package(script.as_bytes(), manifest, Some(record.id.clone()))
        .map_err(HttpError::internal().err())?;

    Ok(json!({"package": package}))
}

async fn decide(
    state: &FgwState,
    claims: &CustomerClaims,
    action_id: &str,
    approved: bool,
    reason: Option<String>,
) -> Result<DeviceActionRecord, HttpError> {
    state
        .catalog
        .get_device_action(action_id)
        .await
        .map_err(HttpError::internal().err())?
        .filter(|record| record.tenant_id == claims.tid)
        .ok_or_else(|| HttpError::not_found().msg("device action not found"))?;

    state
        .catalog
        .decide_device_action(action_id, approved, reason)
        .await
        .map_err(|error| match error {
            CatalogError::NotFound => HttpError::not_found().msg("device action not found"),
            CatalogError::AlreadyDecided => HttpError::conflict()
                .with_code("ALREADY_DECIDED")
                .msg("device action already decided"),
            error => HttpError::internal().err()(error),
        })
}
