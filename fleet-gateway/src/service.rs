use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use fleet_gateway_task::{ShutdownHandle, TaskCluster};
use tap::Pipe as _;
use tokio::runtime::{self, Runtime};

use crate::FgwState;
use crate::approval::ApprovalCoordinator;
use crate::broker::{DynBroker, MemoryBroker};
use crate::catalog::{DynCatalog, MemoryCatalog};
use crate::config::ConfHandle;
use crate::connection::ConnectionManager;
use crate::integrity::ScriptSigner;
use crate::listener::GatewayListener;
use crate::log::{self, LogDeleterTask, LoggerGuard};
use crate::metrics::{self, MetricsCollectorTask};
use crate::queue::{CommandQueue, LeaseReaperTask};

pub const SERVICE_NAME: &str = "fleet-gateway";
pub const DISPLAY_NAME: &str = "Fleet Gateway";

#[allow(clippy::large_enum_variant)] // `Running` variant is bigger than `Stopped` but we don't care
enum GatewayState {
    Stopped,
    Running {
        shutdown_handle: ShutdownHandle,
        runtime: Runtime,
        core: FgwState,
    },
}

pub struct GatewayService {
    conf_handle: ConfHandle,
    state: GatewayState,
    _logger_guard: LoggerGuard,
}

impl GatewayService {
    pub fn load(conf_handle: ConfHandle) -> anyhow::Result<Self> {
        let conf = conf_handle.get_conf();

        let logger_guard =
            log::init(&conf.log_file, conf.log_directive.as_deref()).context("failed to setup logger")?;

        info!(version = env!("CARGO_PKG_VERSION"));

        if !conf.debug.is_default() {
            warn!(
                ?conf.debug,
                "**DEBUG OPTIONS ARE ENABLED, PLEASE DO NOT USE IN PRODUCTION**",
            );
        }

        Ok(GatewayService {
            conf_handle,
            state: GatewayState::Stopped,
            _logger_guard: logger_guard,
        })
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to create runtime")?;

        let conf_handle = self.conf_handle.clone();

        // spawn_tasks needs to run in the runtime in order to bind the sockets.
        let (cluster, core) = runtime.block_on(spawn_tasks(conf_handle))?;

        trace!("Tasks created");

        let (shutdown_handle, children) = cluster.into_parts();

        let mut join_all = futures::future::select_all(children.into_iter().map(|child| Box::pin(child.join())));

        runtime.spawn(async {
            loop {
                let (result, _, rest) = join_all.await;

                match result {
                    Ok(Ok(())) => trace!("A task terminated gracefully"),
                    Ok(Err(error)) => error!(error = format!("{error:#}"), "A task failed"),
                    Err(error) => error!(%error, "Something went very wrong with a task"),
                }

                if rest.is_empty() {
                    break;
                } else {
                    join_all = futures::future::select_all(rest);
                }
            }
        });

        self.state = GatewayState::Running {
            shutdown_handle,
            runtime,
            core,
        };

        Ok(())
    }

    /// Blocks the calling thread until Ctrl-C is received.
    pub fn run_until_ctrl_c(&self) -> anyhow::Result<()> {
        match &self.state {
            GatewayState::Running { runtime, .. } => {
                runtime
                    .block_on(tokio::signal::ctrl_c())
                    .context("couldn't listen for the Ctrl-C signal")?;
                Ok(())
            }
            GatewayState::Stopped => anyhow::bail!("service is not running"),
        }
    }

    pub fn stop(&mut self) {
        match std::mem::replace(&mut self.state, GatewayState::Stopped) {
            GatewayState::Stopped => {
                info!("Attempted to stop gateway service, but it's already stopped");
            }
            GatewayState::Running {
                shutdown_handle,
                runtime,
                core,
            } => {
                info!("Stopping gateway service");

                runtime.block_on(async {
                    // Ordered teardown: pending approvals resolve with a
                    // terminal deny, then every connection closes, then the
                    // background tasks stop. The broker goes away last, when
                    // the core state drops below.
                    core.approvals.shutdown().await;
                    core.connections.close_all().await;

                    drop(core);

                    shutdown_handle.signal();

                    tokio::select! {
                        _ = shutdown_handle.all_closed() => {
                            debug!("All tasks closed gracefully");
                        }
                        _ = tokio::time::sleep(Duration::from_secs(10)) => {
                            warn!("Some tasks didn't terminate at all");
                        }
                    }
                });

                runtime.shutdown_timeout(Duration::from_secs(3));
            }
        }
    }
}

async fn spawn_tasks(conf_handle: ConfHandle) -> anyhow::Result<(TaskCluster, FgwState)> {
    let conf = conf_handle.get_conf();

    let broker: DynBroker = Arc::new(MemoryBroker::new());
    let catalog: DynCatalog = Arc::new(MemoryCatalog::new());
    let connections = ConnectionManager::new();
    let queue = CommandQueue::new(Arc::clone(&broker));
    let approvals = ApprovalCoordinator::new(Arc::clone(&catalog), connections.clone(), conf.approval_timeout);

    let signer = ScriptSigner::load_or_generate(&conf.signing_key_path)
        .context("failed to load the script signing key")?
        .pipe(Arc::new);

    let metrics_tx = metrics::metrics_channel();

    let mut cluster = TaskCluster::new();

    let state = FgwState {
        conf_handle,
        broker,
        catalog,
        connections: connections.clone(),
        queue: queue.clone(),
        approvals: approvals.clone(),
        signer,
        metrics_tx: metrics_tx.clone(),
        shutdown_signal: cluster.shutdown_signal(),
    };

    conf.listeners
        .iter()
        .map(|listener| {
            GatewayListener::init_and_bind(&listener.internal_url, state.clone())
                .with_context(|| format!("failed to initialize {}", listener.internal_url))
        })
        .collect::<anyhow::Result<Vec<GatewayListener>>>()
        .context("failed to bind listener")?
        .into_iter()
        .for_each(|listener| cluster.register(listener));

    cluster.register(LeaseReaperTask { queue });

    cluster.register(LogDeleterTask {
        prefix: conf.log_file.clone(),
    });

    cluster.register(MetricsCollectorTask {
        connections: connections.clone(),
        approvals,
        tx: metrics_tx,
    });

    connections.start_heartbeat(conf.heartbeat_interval);

    Ok((cluster, state))
}
