use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use time::OffsetDateTime;

use crate::FgwState;
use crate::catalog::{CatalogError, CatalogStore as _, CustomerSessionRecord, SessionStatus};
use crate::extract::{CustomerToken, RequestId};
use crate::http::HttpError;

pub fn make_router<S>(state: FgwState) -> Router<S> {
    Router::new()
        .route("/", post(create_session))
        .route("/{id}", get(get_session))
        .route("/{id}/approve", post(approve_session_command))
        .with_state(state)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateSessionRequest {
    device_id: String,
}

pub(super) async fn create_session(
    State(FgwState { catalog, .. }): State<FgwState>,
    CustomerToken(claims): CustomerToken,
    Json(body): Json<CreateSessionRequest>,
) -> Result<Json<CustomerSessionRecord>, HttpError> {
    let device = catalog
        .get_device(&body.device_id)
        .await
        .map_err(HttpError::internal().err())?;

    // Unknown and foreign devices answer identically.
    let device = device
        .filter(|device| device.tenant_id == claims.tid)
        .ok_or_else(|| HttpError::forbidden().msg("Unauthorized"))?;

    let now = OffsetDateTime::now_utc();
    let record = CustomerSessionRecord {
        id: format!("cs_{}", uuid::Uuid::new_v4().simple()),
        tenant_id: claims.tid.clone(),
        device_id: device.id,
        status: SessionStatus::Active,
        commands: Vec::new(),
        created_at: now,
        updated_at: now,
    };

    catalog
        .create_customer_session(record.clone())
        .await
        .map_err(HttpError::internal().err())?;

    info!(session.id = %record.id, "Customer session created");

    Ok(Json(record))
}

pub(super) async fn get_session(
    State(FgwState { catalog, .. }): State<FgwState>,
    CustomerToken(claims): CustomerToken,
    Path(session_id): Path<String>,
) -> Result<Json<CustomerSessionRecord>, HttpError> {
    let session = catalog
        .get_customer_session(&session_id)
        .await
        .map_err(HttpError::internal().err())?
        .filter(|session| session.tenant_id == claims.tid)
        .ok_or_else(|| HttpError::not_found().msg("session not found"))?;

    Ok(Json(session))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ApproveCommandRequest {
    command_id: String,
    approved: bool,
    reason: Option<String>,
    /// Optimistic concurrency token: the `updatedAt` the client last saw.
    #[serde(with = "time::serde::rfc3339")]
    updated_at: OffsetDateTime,
}

pub(super) async fn approve_session_command(
    State(state): State<FgwState>,
    CustomerToken(claims): CustomerToken,
    RequestId(correlation_id): RequestId,
    Path(session_id): Path<String>,
    Json(body): Json<ApproveCommandRequest>,
) -> Result<Json<Value>, HttpError> {
    let session = state
        .catalog
        .get_customer_session(&session_id)
        .await
        .map_err(HttpError::internal().err())?
        .filter(|session| session.tenant_id == claims.tid)
        .ok_or_else(|| HttpError::not_found().msg("session not found"))?;

    let updated = state
        .catalog
        .decide_session_command(
            &session_id,
            &body.command_id,
            body.approved,
            body.reason,
            Some(body.updated_at),
        )
        .await
        .map_err(|error| match error {
            CatalogError::Conflict => HttpError::conflict()
                .with_code("CONCURRENT_UPDATE_CONFLICT")
                .msg("session was updated concurrently"),
            CatalogError::NotFound => HttpError::not_found().msg("command not found"),
            CatalogError::AlreadyDecided => HttpError::conflict()
                .with_code("ALREADY_DECIDED")
                .msg("command already decided"),
            error => HttpError::internal().err()(error),
        })?;

    if body.approved {
        if let Some(command) = updated.commands.iter().find(|command| command.id == body.command_id) {
            if let Err(error) = state
                .queue
                .enqueue(
                    &session.device_id,
                    &claims.tid,
                    &command.command_type,
                    command.params.clone(),
                    5,
                    correlation_id,
                )
                .await
            {
                warn!(%error, "Couldn't dispatch approved session command");
            }
        }
    }

    Ok(Json(json!({
        "sessionId": session_id,
        "commandId": body.command_id,
        "approved": body.approved,
        "updatedAt": updated.updated_at
            .format(&time::format_description::well_known::Rfc3339)
            .ok(),
    })))
}
