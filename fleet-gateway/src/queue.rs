//! Per-device command queue.
//!
//! All inter-caller serialization is delegated to the broker's atomic queue
//! primitives; this module holds no cross-request locks of its own.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_gateway_task::{ShutdownSignal, Task};
use serde_json::Value;
use time::OffsetDateTime;

use crate::broker::{self, Broker, ClaimedCommand, QueueWriteOutcome};
use crate::trace::CorrelationId;

pub const MIN_CLAIM_LIMIT: usize = 1;
pub const MAX_CLAIM_LIMIT: usize = 10;

pub const MIN_VISIBILITY_MS: u64 = 60_000;
pub const MAX_VISIBILITY_MS: u64 = 3_600_000;
pub const DEFAULT_VISIBILITY_MS: u64 = 300_000;

pub const MIN_EXTENSION_MS: u64 = 60_000;
pub const MAX_EXTENSION_MS: u64 = 300_000;

/// Result payload bounds; oversize fields are truncated, not rejected.
pub const MAX_RESULT_OUTPUT_BYTES: usize = 10 * 1024;
pub const MAX_RESULT_ERROR_BYTES: usize = 5 * 1024;

const REAPER_CADENCE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub executed_at: OffsetDateTime,
    pub duration_ms: u64,
}

impl CommandResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Success,
            output: Some(output.into()),
            error: None,
            executed_at: OffsetDateTime::now_utc(),
            duration_ms: 0,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failure,
            output: None,
            error: Some(error.into()),
            executed_at: OffsetDateTime::now_utc(),
            duration_ms: 0,
        }
    }
}

/// The broker-side command record (`cmd:<id>` key).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub id: String,
    pub device_id: String,
    pub tenant_id: String,
    pub command_type: String,
    pub params: Value,
    pub priority: i64,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_token_hash: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub visible_until: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CommandResult>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<OffsetDateTime>,
}

pub fn new_command_record(
    device_id: &str,
    tenant_id: &str,
    command_type: &str,
    params: Value,
    priority: i64,
) -> CommandRecord {
    use rand::RngCore as _;

    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);

    CommandRecord {
        id: format!("cmd_{}", hex::encode(bytes)),
        device_id: device_id.to_owned(),
        tenant_id: tenant_id.to_owned(),
        command_type: command_type.to_owned(),
        params,
        priority,
        status: CommandStatus::Pending,
        claim_token_hash: None,
        visible_until: None,
        result: None,
        created_at: OffsetDateTime::now_utc(),
        claimed_at: None,
        completed_at: None,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("command not found")]
    NotFound,
    #[error("claim token mismatch or expired")]
    InvalidClaim,
    #[error("command already reached a terminal state")]
    AlreadyCompleted,
    #[error("claim limit must be within [{MIN_CLAIM_LIMIT}, {MAX_CLAIM_LIMIT}], got {0}")]
    InvalidLimit(usize),
    #[error("visibility timeout must be within [{MIN_VISIBILITY_MS}, {MAX_VISIBILITY_MS}] ms, got {0}")]
    InvalidVisibility(u64),
    #[error("extension must be within [{MIN_EXTENSION_MS}, {MAX_EXTENSION_MS}] ms, got {0}")]
    InvalidExtension(u64),
    #[error("broker failure")]
    Broker {
        #[from]
        source: crate::broker::BrokerError,
    },
}

#[derive(Clone)]
pub struct CommandQueue {
    broker: Arc<dyn Broker>,
}

impl CommandQueue {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Creates a pending command and notifies the device's control channel.
    ///
    /// A publish failure is logged but does not revert the enqueue: the
    /// device's next poll will pick the command up regardless.
    #[instrument(skip(self, params), fields(device.id = %device_id))]
    pub async fn enqueue(
        &self,
        device_id: &str,
        tenant_id: &str,
        command_type: &str,
        params: Value,
        priority: i64,
        correlation_id: CorrelationId,
    ) -> Result<CommandRecord, QueueError> {
        let record = new_command_record(device_id, tenant_id, command_type, params, priority);

        self.broker.queue_enqueue(record.clone()).await?;

        let notification = json!({
            "type": "new_command",
            "commandId": record.id,
            "commandType": record.command_type,
            "priority": record.priority,
            "requestId": correlation_id,
        });

        if let Err(error) = self
            .broker
            .publish(&broker::device_control_channel(device_id), notification)
            .await
        {
            warn!(%error, command.id = %record.id, "Failed to publish new_command notification");
        }

        debug!(command.id = %record.id, "Command enqueued");

        Ok(record)
    }

    /// Atomically leases up to `limit` ready commands.
    pub async fn claim(
        &self,
        device_id: &str,
        limit: usize,
        visibility_ms: u64,
    ) -> Result<Vec<ClaimedCommand>, QueueError> {
        if !(MIN_CLAIM_LIMIT..=MAX_CLAIM_LIMIT).contains(&limit) {
            return Err(QueueError::InvalidLimit(limit));
        }

        if !(MIN_VISIBILITY_MS..=MAX_VISIBILITY_MS).contains(&visibility_ms) {
            return Err(QueueError::InvalidVisibility(visibility_ms));
        }

        let visible_until = OffsetDateTime::now_utc() + Duration::from_millis(visibility_ms);

        let claimed = self.broker.queue_claim(device_id, limit, visible_until).await?;

        if !claimed.is_empty() {
            debug!(device.id = %device_id, count = claimed.len(), "Commands claimed");
        }

        Ok(claimed)
    }

    /// Validates the claim token and applies the terminal result.
    #[instrument(skip(self, result, claim_token), fields(command.id = %command_id))]
    pub async fn submit_result(
        &self,
        command_id: &str,
        claim_token: &str,
        device_id: &str,
        mut result: CommandResult,
        correlation_id: CorrelationId,
    ) -> Result<CommandRecord, QueueError> {
        // Execution output is scrubbed before it is persisted or broadcast.
        result.output = result.output.map(|text| crate::sanitize::sanitize_text(&text));
        result.error = result.error.map(|text| crate::sanitize::sanitize_text(&text));

        truncate_in_place(&mut result.output, MAX_RESULT_OUTPUT_BYTES);
        truncate_in_place(&mut result.error, MAX_RESULT_ERROR_BYTES);

        let status = match result.status {
            ResultStatus::Success => CommandStatus::Completed,
            ResultStatus::Failure => CommandStatus::Failed,
        };

        let outcome = self
            .broker
            .queue_complete(command_id, claim_token, device_id, status, result)
            .await?;

        let record = match outcome {
            QueueWriteOutcome::Applied(record) => record,
            QueueWriteOutcome::NotFound => return Err(QueueError::NotFound),
            QueueWriteOutcome::InvalidClaim => return Err(QueueError::InvalidClaim),
            QueueWriteOutcome::AlreadyCompleted => return Err(QueueError::AlreadyCompleted),
        };

        let event = json!({
            "type": "command_completed",
            "commandId": record.id,
            "status": record.status,
            "result": record.result,
            "requestId": correlation_id,
        });

        if let Err(error) = self
            .broker
            .publish(&broker::device_updates_channel(device_id), event)
            .await
        {
            warn!(%error, command.id = %command_id, "Failed to publish command_completed event");
        }

        info!(status = ?record.status, "Command result recorded");

        Ok(record)
    }

    /// Pushes the visibility deadline of a claimed command forward.
    pub async fn extend(
        &self,
        command_id: &str,
        claim_token: &str,
        device_id: &str,
        extension_ms: u64,
    ) -> Result<OffsetDateTime, QueueError> {
        if !(MIN_EXTENSION_MS..=MAX_EXTENSION_MS).contains(&extension_ms) {
            return Err(QueueError::InvalidExtension(extension_ms));
        }

        let visible_until = OffsetDateTime::now_utc() + Duration::from_millis(extension_ms);

        let outcome = self
            .broker
            .queue_extend(command_id, claim_token, device_id, visible_until)
            .await?;

        match outcome {
            QueueWriteOutcome::Applied(record) => {
                Ok(record.visible_until.unwrap_or(visible_until))
            }
            QueueWriteOutcome::NotFound => Err(QueueError::NotFound),
            QueueWriteOutcome::InvalidClaim => Err(QueueError::InvalidClaim),
            QueueWriteOutcome::AlreadyCompleted => Err(QueueError::AlreadyCompleted),
        }
    }

    pub async fn get(&self, command_id: &str) -> Result<Option<CommandRecord>, QueueError> {
        Ok(self.broker.queue_get(command_id).await?)
    }

    /// Recycles every lease whose visibility deadline elapsed.
    ///
    /// Re-delivery is allowed by contract (at-most-one-in-flight, not
    /// exactly-once-execution); devices deduplicate on `commandId`.
    pub async fn requeue_expired(&self, now: OffsetDateTime) -> Result<usize, QueueError> {
        let requeued = self.broker.queue_requeue_expired(now).await?;
        let count = requeued.len();

        for record in requeued {
            warn!(
                command.id = %record.id,
                device.id = %record.device_id,
                "Lease expired, command returned to pending"
            );

            let notification = json!({
                "type": "command_requeued",
                "commandId": record.id,
                "commandType": record.command_type,
                "priority": record.priority,
            });

            if let Err(error) = self
                .broker
                .publish(&broker::device_control_channel(&record.device_id), notification)
                .await
            {
                warn!(%error, command.id = %record.id, "Failed to publish command_requeued notification");
            }
        }

        Ok(count)
    }
}

fn truncate_in_place(field: &mut Option<String>, max_bytes: usize) {
    if let Some(text) = field {
        if text.len() > max_bytes {
            let mut cut = max_bytes;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }
    }
}

/// Background task recycling expired leases at a fixed cadence.
pub struct LeaseReaperTask {
    pub queue: CommandQueue,
}

#[async_trait]
impl Task for LeaseReaperTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "lease reaper";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!("Task started");

        let mut interval = tokio::time::interval(REAPER_CADENCE);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.queue.requeue_expired(OffsetDateTime::now_utc()).await {
                        Ok(0) => {}
                        Ok(count) => debug!(count, "Expired leases recycled"),
                        Err(error) => {
                            // Retried on the next tick.
                            error!(%error, "Lease reaper pass failed");
                        }
                    }
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

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut field = Some(format!("{}é", "a".repeat(MAX_RESULT_ERROR_BYTES - 1)));
        truncate_in_place(&mut field, MAX_RESULT_ERROR_BYTES);

        let text = field.unwrap();
        assert_eq!(text.len(), MAX_RESULT_ERROR_BYTES - 1);
        assert!(text.chars().all(|c| c == 'a'));
    }

    #[test]
    fn bounds_are_validated_before_broker_calls() {
        let queue = CommandQueue::new(Arc::new(crate::broker::MemoryBroker::new()));

        let result = tokio_test::block_on(queue.claim("d1", 0, DEFAULT_VISIBILITY_MS));
        assert!(matches!(result, Err(QueueError::InvalidLimit(0))));

        let result = tokio_test::block_on(queue.claim("d1", 11, DEFAULT_VISIBILITY_MS));
        assert!(matches!(result, Err(QueueError::InvalidLimit(11))));

        let result = tokio_test::block_on(queue.claim("d1", 1, 1_000));
        assert!(matches!(result, Err(QueueError::InvalidVisibility(1_000))));

        let result = tokio_test::block_on(queue.extend("cmd_x", "tok", "d1", 1_000));
        assert!(matches!(result, Err(QueueError::InvalidExtension(1_000))));
    }
}
