#[macro_use]
extern crate tracing;

#[macro_use]
extern crate serde;

#[macro_use]
extern crate serde_json;

pub mod api;
pub mod approval;
pub mod broker;
pub mod catalog;
pub mod config;
pub mod connection;
pub mod extract;
pub mod http;
pub mod integrity;
pub mod listener;
pub mod log;
pub mod metrics;
pub mod middleware;
pub mod queue;
pub mod router;
pub mod sanitize;
pub mod service;
pub mod token;
pub mod trace;
pub mod ws;

use std::sync::Arc;

use anyhow::Context as _;
use fleet_gateway_task::{ShutdownHandle, ShutdownSignal};

use crate::approval::ApprovalCoordinator;
use crate::broker::{DynBroker, MemoryBroker};
use crate::catalog::{DynCatalog, MemoryCatalog};
use crate::config::ConfHandle;
use crate::connection::ConnectionManager;
use crate::integrity::ScriptSigner;
use crate::metrics::MetricsSender;
use crate::queue::CommandQueue;

#[derive(Clone)]
pub struct FgwState {
    pub conf_handle: ConfHandle,
    pub broker: DynBroker,
    pub catalog: DynCatalog,
    pub connections: ConnectionManager,
    pub queue: CommandQueue,
    pub approvals: ApprovalCoordinator,
    pub signer: Arc<ScriptSigner>,
    pub metrics_tx: MetricsSender,
    pub shutdown_signal: ShutdownSignal,
}

pub struct MockHandles {
    pub shutdown_handle: ShutdownHandle,
}

impl FgwState {
    /// Builds an isolated state around in-memory backends; every test gets
    /// its own instances, nothing is process-wide.
    #[doc(hidden)]
    pub fn mock(json_config: &str) -> anyhow::Result<(Self, MockHandles)> {
        let conf_handle = ConfHandle::mock(json_config)?;
        let conf = conf_handle.get_conf();

        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

        let broker: DynBroker = Arc::new(MemoryBroker::new());
        let catalog: DynCatalog = Arc::new(MemoryCatalog::new());
        let connections = ConnectionManager::new();
        let queue = CommandQueue::new(Arc::clone(&broker));
        let approvals = ApprovalCoordinator::new(Arc::clone(&catalog), connections.clone(), conf.approval_timeout);

        // Key generation is expensive; mock instances share one per process.
        static MOCK_SIGNING_KEY: std::sync::LazyLock<anyhow::Result<picky::key::PrivateKey>> =
            std::sync::LazyLock::new(|| {
                picky::key::PrivateKey::generate_rsa(2048).context("RSA key generation failed")
            });

        let signer = MOCK_SIGNING_KEY
            .as_ref()
            .map_err(|error| anyhow::anyhow!("{error:#}"))
            .and_then(|key| ScriptSigner::from_private_key(key.clone()))
            .map(Arc::new)?;

        let state = FgwState {
            conf_handle,
            broker,
            catalog,
            connections,
            queue,
            approvals,
            signer,
            metrics_tx: metrics::metrics_channel(),
            shutdown_signal,
        };

        Ok((state, MockHandles { shutdown_handle }))
    }
}

pub fn make_http_service(state: FgwState) -> axum::Router {
    trace!("Make HTTP service");

    axum::Router::new()
        .merge(api::make_router(state.clone()))
        .layer(axum::middleware::from_fn_with_state(
            state,
            middleware::auth::auth_middleware,
        ))
        .layer(axum::middleware::from_fn(middleware::log::log_middleware))
        .layer(middleware::cors::make_middleware())
}
