use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use secrecy::ExposeSecret as _;
use serde_json::Value;

use crate::FgwState;
use crate::http::HttpError;

pub const INTERNAL_AUTH_HEADER: &str = "x-internal-auth";

/// Equality that does not short-circuit on the first mismatching byte, so
/// response timing leaks nothing about the expected token.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = a.len() ^ b.len();

    for (x, y) in a.iter().zip(b.iter()) {
        diff |= usize::from(x ^ y);
    }

    diff == 0
}

pub(super) async fn get_metrics(
    State(state): State<FgwState>,
    headers: HeaderMap,
) -> Result<Json<Value>, HttpError> {
    let conf = state.conf_handle.get_conf();

    let expected = conf
        .internal_auth_token
        .as_ref()
        .ok_or_else(|| HttpError::internal().msg("internal auth token is not configured"))?;

    let provided = headers
        .get(INTERNAL_AUTH_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| HttpError::unauthorized().msg("internal auth token required"))?;

    if !constant_time_eq(provided.as_bytes(), expected.expose_secret().as_bytes()) {
        return Err(HttpError::forbidden().msg("internal auth token mismatch"));
    }

    Ok(Json(json!({
        "hostname": conf.hostname,
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.connections.stats(),
        "pendingApprovals": state.approvals.pending_count(),
    })))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_semantics() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secret2"));
        assert!(!constant_time_eq(b"secret", "sécret".as_bytes()));
        assert!(!constant_time_eq(b"", b"x"));
        assert!(constant_time_eq(b"", b""));
    }
}
