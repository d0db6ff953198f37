use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;

use crate::FgwState;
use crate::extract::{DeviceSession, RequestId};
use crate::http::HttpError;
use crate::queue::{
    CommandRecord, CommandResult, DEFAULT_VISIBILITY_MS, MAX_CLAIM_LIMIT, MAX_EXTENSION_MS,
    MAX_VISIBILITY_MS, MIN_CLAIM_LIMIT, MIN_EXTENSION_MS, MIN_VISIBILITY_MS, QueueError,
};

pub fn make_router<S>(state: FgwState) -> Router<S> {
    Router::new()
        .route("/claim", post(claim_commands))
        .route("/{id}/extend", post(extend_command))
        .route("/{id}/result", post(submit_result))
        .route("/{id}", get(get_command))
        .with_state(state)
}

pub(crate) fn map_queue_error(error: QueueError) -> HttpError {
    match error {
        QueueError::NotFound => HttpError::not_found().with_code("NOT_FOUND").msg("command not found"),
        QueueError::InvalidClaim => HttpError::forbidden()
            .with_code("INVALID_CLAIM")
            .msg("claim token mismatch or expired"),
        QueueError::AlreadyCompleted => HttpError::conflict()
            .with_code("ALREADY_COMPLETED")
            .msg("command already reached a terminal state"),
        error @ (QueueError::InvalidLimit(_) | QueueError::InvalidVisibility(_) | QueueError::InvalidExtension(_)) => {
            HttpError::bad_request().err()(error)
        }
        error @ QueueError::Broker { .. } => HttpError::internal().err()(error),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ClaimRequest {
    limit: Option<usize>,
    visibility_timeout: Option<u64>,
}

pub(super) async fn claim_commands(
    State(FgwState { queue, .. }): State<FgwState>,
    DeviceSession(claims): DeviceSession,
    Json(body): Json<ClaimRequest>,
) -> Result<Json<Value>, HttpError> {
    let limit = body.limit.unwrap_or(1);
    let visibility_ms = body.visibility_timeout.unwrap_or(DEFAULT_VISIBILITY_MS);

    // Bounds are rejected before the queue is ever consulted.
    if !(MIN_CLAIM_LIMIT..=MAX_CLAIM_LIMIT).contains(&limit) {
        return Err(HttpError::bad_request().msg("limit out of range"));
    }

    if !(MIN_VISIBILITY_MS..=MAX_VISIBILITY_MS).contains(&visibility_ms) {
        return Err(HttpError::bad_request().msg("visibilityTimeout out of range"));
    }

    let claimed = queue
        .claim(&claims.device_id, limit, visibility_ms)
        .await
        .map_err(map_queue_error)?;

    let commands: Vec<Value> = claimed
        .into_iter()
        .map(|claim| {
            json!({
                "command": claim.record,
                "claimToken": claim.claim_token,
            })
        })
        .collect();

    Ok(Json(json!({"commands": commands})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ExtendRequest {
    claim_token: String,
    extension_ms: Option<u64>,
}

pub(super) async fn extend_command(
    State(FgwState { queue, .. }): State<FgwState>,
    DeviceSession(claims): DeviceSession,
    Path(command_id): Path<String>,
    Json(body): Json<ExtendRequest>,
) -> Result<Json<Value>, HttpError> {
    let extension_ms = body.extension_ms.unwrap_or(MIN_EXTENSION_MS);

    if !(MIN_EXTENSION_MS..=MAX_EXTENSION_MS).contains(&extension_ms) {
        return Err(HttpError::bad_request().msg("extensionMs out of range"));
    }

    let new_visible_until = queue
        .extend(&command_id, &body.claim_token, &claims.device_id, extension_ms)
        .await
        .map_err(map_queue_error)?;

    let new_visible_until = new_visible_until
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(HttpError::internal().err())?;

    Ok(Json(json!({"ok": true, "newVisibleUntil": new_visible_until})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ResultRequest {
    claim_token: String,
    result: CommandResult,
}

pub(super) async fn submit_result(
    State(FgwState { queue, .. }): State<FgwState>,
    DeviceSession(claims): DeviceSession,
    RequestId(correlation_id): RequestId,
    Path(command_id): Path<String>,
    Json(body): Json<ResultRequest>,
) -> Result<Json<Value>, HttpError> {
    let record = queue
        .submit_result(&command_id, &body.claim_token, &claims.device_id, body.result, correlation_id)
        .await
        .map_err(map_queue_error)?;

    Ok(Json(json!({"ok": true, "status": record.status})))
}

pub(super) async fn get_command(
    State(FgwState { queue, .. }): State<FgwState>,
    DeviceSession(claims): DeviceSession,
    Path(command_id): Path<String>,
) -> Result<Json<CommandRecord>, HttpError> {
    let record = queue
        .get(&command_id)
        .await
        .map_err(map_queue_error)?
        // A foreign command reads as nonexistent.
        .filter(|record| record.device_id == claims.device_id)
        .ok_or_else(|| HttpError::not_found().with_code("NOT_FOUND").msg("command not found"))?;

    Ok(Json(record))
}
