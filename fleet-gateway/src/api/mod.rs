pub mod approvals;
pub mod commands;
pub mod connect;
pub mod device_actions;
pub mod health;
pub mod metrics;
pub mod sessions;

pub fn make_router<S>(state: crate::FgwState) -> axum::Router<S> {
    axum::Router::new()
        .route("/healthz", axum::routing::get(health::get_health))
        .route("/readyz", axum::routing::get(health::get_readiness))
        .nest("/api/v1/device/commands", commands::make_router(state.clone()))
        .nest("/api/v1/customer/sessions", sessions::make_router(state.clone()))
        .nest("/api/v1/device-actions", device_actions::make_router(state.clone()))
        .nest("/api/v1/approvals", approvals::make_router(state.clone()))
        .route("/api/v1/internal/metrics", axum::routing::get(metrics::get_metrics))
        .route("/api/v1/device/ws", axum::routing::get(connect::device_ws))
        .route("/api/v1/customer/ws", axum::routing::get(connect::customer_ws))
        .with_state(state)
}
