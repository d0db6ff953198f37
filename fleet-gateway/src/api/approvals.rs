use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::FgwState;
use crate::approval::PendingApprovalInfo;
use crate::extract::CustomerToken;
use crate::http::HttpError;

pub fn make_router<S>(state: FgwState) -> Router<S> {
    Router::new().route("/pending", get(get_pending)).with_state(state)
}

/// Polling fallback for the approval UI; the push path is the broadcast to
/// connected approver sessions.
pub(super) async fn get_pending(
    State(FgwState { approvals, .. }): State<FgwState>,
    CustomerToken(claims): CustomerToken,
) -> Result<Json<Vec<PendingApprovalInfo>>, HttpError> {
    Ok(Json(approvals.pending_for_tenant(&claims.tid)))
}
