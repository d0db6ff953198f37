use axum::Json;
use axum::extract::State;
use serde_json::Value;

use crate::FgwState;
use crate::broker::Broker as _;
use crate::catalog::CatalogStore as _;
use crate::http::HttpError;

/// Liveness: always 200 while the process serves requests.
pub(super) async fn get_health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Readiness: 503 unless both the broker and the catalog store answer.
pub(super) async fn get_readiness(
    State(FgwState { broker, catalog, .. }): State<FgwState>,
) -> Result<Json<Value>, HttpError> {
    broker
        .ping()
        .await
        .map_err(HttpError::service_unavailable().with_msg("broker unreachable").err())?;

    catalog
        .ping()
        .await
        .map_err(HttpError::service_unavailable().with_msg("catalog store unreachable").err())?;

    Ok(Json(json!({"status": "ready"})))
}
