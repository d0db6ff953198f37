//! Periodic service metrics snapshot, fanned out on a typed broadcast
//! channel (bounded, lossy on slow consumers).

use std::time::Duration;

use async_trait::async_trait;
use fleet_gateway_task::{ShutdownSignal, Task};
use time::OffsetDateTime;
use tokio::sync::broadcast;

use crate::approval::ApprovalCoordinator;
use crate::connection::{ConnectionManager, ConnectionStats};

const COLLECTION_INTERVAL: Duration = Duration::from_secs(60);

pub const METRICS_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub collected_at: OffsetDateTime,
    pub connections: ConnectionStats,
    pub pending_approvals: usize,
}

pub type MetricsSender = broadcast::Sender<MetricsSnapshot>;

pub fn metrics_channel() -> MetricsSender {
    broadcast::channel(METRICS_CHANNEL_CAPACITY).0
}

pub struct MetricsCollectorTask {
    pub connections: ConnectionManager,
    pub approvals: ApprovalCoordinator,
    pub tx: MetricsSender,
}

#[async_trait]
impl Task for MetricsCollectorTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "metrics collector";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!("Task started");

        let mut interval = tokio::time::interval(COLLECTION_INTERVAL);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let snapshot = MetricsSnapshot {
                        collected_at: OffsetDateTime::now_utc(),
                        connections: self.connections.stats(),
                        pending_approvals: self.approvals.pending_count(),
                    };

                    trace!(?snapshot, "Metrics collected");

                    // A send error only means nobody is listening right now.
                    let _ = self.tx.send(snapshot);
                }
                () = shutdown_signal.wait() => {
                    break;
                }
            }
        }

        debug!("Task terminated");

        Ok(())
    }
}
