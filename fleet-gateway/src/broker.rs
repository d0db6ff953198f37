//! Typed adapter over the key-value / pub-sub broker.
//!
//! Everything stored through this adapter is JSON-encoded and every key is
//! namespaced by purpose (see the `*_channel` / `*_key` helpers). Backends
//! must bound every operation with a connect timeout and a command timeout;
//! no adapter method is allowed to block indefinitely.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_gateway_task::ChildTask;
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::queue::{CommandRecord, CommandResult, CommandStatus};

pub const BROKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const BROKER_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Recent completed commands retained per device.
const COMPLETED_HISTORY_LIMIT: usize = 100;

const SUBSCRIPTION_BUFFER: usize = 256;

// ----- key namespace ----- //

pub fn device_control_channel(device_id: &str) -> String {
    format!("device:{device_id}:control")
}

pub fn device_updates_channel(device_id: &str) -> String {
    format!("device:{device_id}:updates")
}

pub fn chat_channel(session_id: &str) -> String {
    format!("chat:{session_id}")
}

pub fn device_session_key(token: &str) -> String {
    format!("session:{token}")
}

// Queue namespace, as laid out by networked backends. The in-memory
// backend keeps the same three-index structure in plain maps.

pub fn command_key(command_id: &str) -> String {
    format!("cmd:{command_id}")
}

pub fn pending_queue_key(device_id: &str) -> String {
    format!("cmd:{device_id}:pending")
}

pub fn claimed_queue_key(device_id: &str) -> String {
    format!("cmd:{device_id}:claimed")
}

pub fn completed_queue_key(device_id: &str) -> String {
    format!("cmd:{device_id}:completed")
}

// ----- claim tokens ----- //

/// Mints the opaque random secret handed to a claimant.
pub fn mint_claim_token() -> String {
    use rand::RngCore as _;

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Only the hash of a claim token is ever stored broker-side.
pub fn hash_claim_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

// ----- errors ----- //

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable")]
    Unavailable {
        #[source]
        source: anyhow::Error,
    },
    #[error("broker operation timed out")]
    Timeout,
    #[error("failed to encode broker value")]
    Encoding {
        #[from]
        source: serde_json::Error,
    },
}

// ----- queue primitive outcomes ----- //

/// A command handed out by `queue_claim`; the clear-text token exists only
/// in this value, the broker retains its hash.
#[derive(Debug, Clone)]
pub struct ClaimedCommand {
    pub record: CommandRecord,
    pub claim_token: String,
}

#[derive(Debug)]
pub enum QueueWriteOutcome {
    Applied(CommandRecord),
    NotFound,
    InvalidClaim,
    AlreadyCompleted,
}

// ----- subscriptions ----- //

/// Durable subscription to a single channel.
pub struct Subscription {
    channel: String,
    rx: broadcast::Receiver<Value>,
}

impl Subscription {
    /// Receives the next published value; `None` once the broker is gone.
    ///
    /// Values that cannot be decoded are logged and swallowed, never
    /// surfaced to the caller.
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            match self.rx.recv().await {
                Ok(value) => return Some(value),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped, "Subscription lagged, dropping messages");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

/// Multiplexed subscription over many channels sharing one underlying
/// broker connection. A customer following hundreds of devices gets one of
/// these rather than hundreds of dedicated connections.
pub struct MultiSubscription {
    rx: mpsc::Receiver<(String, Value)>,
    pumps: Vec<ChildTask<()>>,
}

impl MultiSubscription {
    /// Receives the next `(channel, value)` pair across all subscribed
    /// channels; `None` once every channel is gone.
    pub async fn recv(&mut self) -> Option<(String, Value)> {
        self.rx.recv().await
    }

    /// Tears down all channel subscriptions at once.
    pub fn disconnect(self) {
        drop(self.pumps);
    }
}

// ----- the adapter contract ----- //

#[async_trait]
pub trait Broker: Send + Sync {
    /// Fire-and-forget fan-out to all current subscribers.
    async fn publish(&self, channel: &str, value: Value) -> Result<(), BrokerError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError>;

    async fn subscribe_many(&self, channels: Vec<String>) -> Result<MultiSubscription, BrokerError>;

    async fn get(&self, key: &str) -> Result<Option<Value>, BrokerError>;

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), BrokerError>;

    async fn list_push(&self, key: &str, value: Value) -> Result<(), BrokerError>;

    /// Liveness probe used by the readiness endpoint.
    async fn ping(&self) -> Result<(), BrokerError>;

    // -- queue primitives, used only by the command queue -- //
    //
    // Each of these is a single atomic step: two callers observing the same
    // pending entry must never both claim it.

    async fn queue_enqueue(&self, record: CommandRecord) -> Result<(), BrokerError>;

    /// Moves up to `limit` entries from the pending set (priority
    /// ascending, then insertion order) into the claimed set with the given
    /// `visible_until`, minting a fresh random claim token per entry.
    async fn queue_claim(
        &self,
        device_id: &str,
        limit: usize,
        visible_until: OffsetDateTime,
    ) -> Result<Vec<ClaimedCommand>, BrokerError>;

    /// Verify-and-complete: applies the result iff the token matches and
    /// the command is still claimed by `device_id`.
    async fn queue_complete(
        &self,
        command_id: &str,
        claim_token: &str,
        device_id: &str,
        status: CommandStatus,
        result: CommandResult,
    ) -> Result<QueueWriteOutcome, BrokerError>;

    /// Extends the visibility window iff the token matches.
    async fn queue_extend(
        &self,
        command_id: &str,
        claim_token: &str,
        device_id: &str,
        visible_until: OffsetDateTime,
    ) -> Result<QueueWriteOutcome, BrokerError>;

    async fn queue_get(&self, command_id: &str) -> Result<Option<CommandRecord>, BrokerError>;

    /// Returns every claimed entry whose `visible_until` elapsed to the
    /// pending set, clearing its claim token. Used by the lease reaper.
    async fn queue_requeue_expired(&self, now: OffsetDateTime) -> Result<Vec<CommandRecord>, BrokerError>;
}

pub type DynBroker = Arc<dyn Broker>;

// ----- in-memory implementation ----- //

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone)]
struct PendingKey {
    priority: i64,
    created_at: OffsetDateTime,
    id: String,
}

#[derive(Default)]
struct QueueState {
    records: HashMap<String, CommandRecord>,
    pending: HashMap<String, BTreeSet<PendingKey>>,
    claimed: HashMap<String, HashMap<String, OffsetDateTime>>,
    completed: HashMap<String, VecDeque<String>>,
}

struct KvEntry {
    value: Value,
    expires_at: Option<Instant>,
}

/// Process-local broker backend.
///
/// Pub/sub rides on per-channel broadcast channels; the queue state sits
/// behind a single mutex, which is what makes each queue primitive atomic.
#[derive(Default)]
pub struct MemoryBroker {
    channels: Mutex<HashMap<String, broadcast::Sender<Value>>>,
    kv: Mutex<HashMap<String, KvEntry>>,
    lists: Mutex<HashMap<String, Vec<Value>>>,
    queue: Mutex<QueueState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<Value> {
        self.channels
            .lock()
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(SUBSCRIPTION_BUFFER).0)
            .clone()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, value: Value) -> Result<(), BrokerError> {
        // A send error only means nobody is subscribed right now.
        let _ = self.sender_for(channel).send(value);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        Ok(Subscription {
            channel: channel.to_owned(),
            rx: self.sender_for(channel).subscribe(),
        })
    }

    async fn subscribe_many(&self, channels: Vec<String>) -> Result<MultiSubscription, BrokerError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        let mut pumps = Vec::with_capacity(channels.len());

        for channel in channels {
            let mut sub = Subscription {
                channel: channel.clone(),
                rx: self.sender_for(&channel).subscribe(),
            };
            let tx = tx.clone();

            pumps.push(ChildTask::spawn(async move {
                while let Some(value) = sub.recv().await {
                    if tx.send((sub.channel().to_owned(), value)).await.is_err() {
                        break;
                    }
                }
            }));
        }

        Ok(MultiSubscription { rx, pumps })
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, BrokerError> {
        let mut kv = self.kv.lock();

        match kv.get(key) {
            Some(entry) => {
                if entry.expires_at.is_some_and(|deadline| deadline <= Instant::now()) {
                    kv.remove(key);
                    Ok(None)
                } else {
                    Ok(Some(entry.value.clone()))
                }
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), BrokerError> {
        self.kv.lock().insert(
            key.to_owned(),
            KvEntry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn list_push(&self, key: &str, value: Value) -> Result<(), BrokerError> {
        self.lists.lock().entry(key.to_owned()).or_default().push(value);
        Ok(())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn queue_enqueue(&self, record: CommandRecord) -> Result<(), BrokerError> {
        let mut queue = self.queue.lock();

        queue
            .pending
            .entry(record.device_id.clone())
            .or_default()
            .insert(PendingKey {
                priority: record.priority,
                created_at: record.created_at,
                id: record.id.clone(),
            });
        queue.records.insert(record.id.clone(), record);

        Ok(())
    }

    async fn queue_claim(
        &self,
        device_id: &str,
        limit: usize,
        visible_until: OffsetDateTime,
    ) -> Result<Vec<ClaimedCommand>, BrokerError> {
        let mut queue = self.queue.lock();

        let Some(pending) = queue.pending.get_mut(device_id) else {
            return Ok(Vec::new());
        };

        let mut taken = Vec::new();
        while taken.len() < limit {
            let Some(key) = pending.iter().next().cloned() else {
                break;
            };
            pending.remove(&key);
            taken.push(key.id);
        }

        let now = OffsetDateTime::now_utc();
        let mut claimed = Vec::with_capacity(taken.len());

        for id in taken {
            let Some(record) = queue.records.get_mut(&id) else {
                continue;
            };

            let token = mint_claim_token();
            record.status = CommandStatus::Claimed;
            record.claim_token_hash = Some(hash_claim_token(&token));
            record.visible_until = Some(visible_until);
            record.claimed_at = Some(now);

            let record = record.clone();
            queue
                .claimed
                .entry(device_id.to_owned())
                .or_default()
                .insert(id, visible_until);

            claimed.push(ClaimedCommand {
                record,
                claim_token: token,
            });
        }

        Ok(claimed)
    }

    async fn queue_complete(
        &self,
        command_id: &str,
        claim_token: &str,
        device_id: &str,
        status: CommandStatus,
        result: CommandResult,
    ) -> Result<QueueWriteOutcome, BrokerError> {
        let mut queue = self.queue.lock();
        let state = &mut *queue;

        let Some(record) = state.records.get_mut(command_id) else {
            return Ok(QueueWriteOutcome::NotFound);
        };

        if record.status != CommandStatus::Claimed {
            return Ok(QueueWriteOutcome::AlreadyCompleted);
        }

        // A claim token leaked across devices must not authorize anything;
        // existence is not leaked either.
        if record.device_id != device_id {
            return Ok(QueueWriteOutcome::NotFound);
        }

        if record.claim_token_hash.as_deref() != Some(hash_claim_token(claim_token).as_str()) {
            return Ok(QueueWriteOutcome::InvalidClaim);
        }

        record.status = status;
        record.result = Some(result);
        record.claim_token_hash = None;
        record.visible_until = None;
        record.completed_at = Some(OffsetDateTime::now_utc());

        let record = record.clone();

        if let Some(claimed) = state.claimed.get_mut(device_id) {
            claimed.remove(command_id);
        }

        let history = state.completed.entry(device_id.to_owned()).or_default();
        history.push_back(command_id.to_owned());
        while history.len() > COMPLETED_HISTORY_LIMIT {
            if let Some(evicted) = history.pop_front() {
                state.records.remove(&evicted);
            }
        }

        Ok(QueueWriteOutcome::Applied(record))
    }

    async fn queue_extend(
        &self,
        command_id: &str,
        claim_token: &str,
        device_id: &str,
        visible_until: OffsetDateTime,
    ) -> Result<QueueWriteOutcome, BrokerError> {
        let mut queue = self.queue.lock();

        let Some(record) = queue.records.get_mut(command_id) else {
            return Ok(QueueWriteOutcome::NotFound);
        };

        if record.status != CommandStatus::Claimed {
            return Ok(QueueWriteOutcome::AlreadyCompleted);
        }

        if record.device_id != device_id {
            return Ok(QueueWriteOutcome::NotFound);
        }

        if record.claim_token_hash.as_deref() != Some(hash_claim_token(claim_token).as_str()) {
            return Ok(QueueWriteOutcome::InvalidClaim);
        }

        record.visible_until = Some(visible_until);
        let record = record.clone();

        if let Some(claimed) = queue.claimed.get_mut(device_id) {
            claimed.insert(command_id.to_owned(), visible_until);
        }

        Ok(QueueWriteOutcome::Applied(record))
    }

    async fn queue_get(&self, command_id: &str) -> Result<Option<CommandRecord>, BrokerError> {
        Ok(self.queue.lock().records.get(command_id).cloned())
    }

    async fn queue_requeue_expired(&self, now: OffsetDateTime) -> Result<Vec<CommandRecord>, BrokerError> {
        let mut queue = self.queue.lock();
        let mut requeued = Vec::new();

        let expired: Vec<(String, String)> = queue
            .claimed
            .iter()
            .flat_map(|(device, entries)| {
                entries
                    .iter()
                    .filter(|(_, visible_until)| **visible_until < now)
                    .map(|(id, _)| (device.clone(), id.clone()))
            })
            .collect();

        for (device, id) in expired {
            if let Some(entries) = queue.claimed.get_mut(&device) {
                entries.remove(&id);
            }

            let Some(record) = queue.records.get_mut(&id) else {
                continue;
            };

            record.status = CommandStatus::Pending;
            record.claim_token_hash = None;
            record.visible_until = None;
            record.claimed_at = None;

            let key = PendingKey {
                priority: record.priority,
                created_at: record.created_at,
                id: id.clone(),
            };
            let record = record.clone();

            queue.pending.entry(device).or_default().insert(key);
            requeued.push(record);
        }

        Ok(requeued)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::queue::new_command_record;

    fn record(device: &str, priority: i64) -> CommandRecord {
        new_command_record(device, "tenant-1", "diagnostic", serde_json::json!({}), priority)
    }

    #[tokio::test]
    async fn pub_sub_round_trip() {
        let broker = MemoryBroker::new();

        let mut sub = broker.subscribe("device:d1:control").await.unwrap();
        broker
            .publish("device:d1:control", serde_json::json!({"type": "new_command"}))
            .await
            .unwrap();

        let value = sub.recv().await.unwrap();
        assert_eq!(value["type"], "new_command");
    }

    #[tokio::test]
    async fn kv_ttl_expires() {
        let broker = MemoryBroker::new();

        tokio::time::pause();

        broker
            .set("session:tok", serde_json::json!({"device_id": "d1"}), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(broker.get("session:tok").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(broker.get("session:tok").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_respects_priority_then_insertion_order() {
        let broker = MemoryBroker::new();

        let c1 = record("d1", 2);
        let c2 = record("d1", 1);
        let c3 = record("d1", 1);

        for r in [&c1, &c2, &c3] {
            broker.queue_enqueue(r.clone()).await.unwrap();
        }

        let visible_until = OffsetDateTime::now_utc() + Duration::from_secs(300);
        let claimed = broker.queue_claim("d1", 10, visible_until).await.unwrap();

        let ids: Vec<&str> = claimed.iter().map(|c| c.record.id.as_str()).collect();
        assert_eq!(ids, vec![c2.id.as_str(), c3.id.as_str(), c1.id.as_str()]);
    }

    #[tokio::test]
    async fn complete_rejects_foreign_device_and_bad_token() {
        let broker = MemoryBroker::new();

        broker.queue_enqueue(record("d1", 1)).await.unwrap();
        let visible_until = OffsetDateTime::now_utc() + Duration::from_secs(300);
        let claimed = broker.queue_claim("d1", 1, visible_until).await.unwrap();
        let claim = &claimed[0];

        let result = CommandResult::success("done");

        let outcome = broker
            .queue_complete(&claim.record.id, &claim.claim_token, "d2", CommandStatus::Completed, result.clone())
            .await
            .unwrap();
        assert!(matches!(outcome, QueueWriteOutcome::NotFound));

        let outcome = broker
            .queue_complete(&claim.record.id, "bogus", "d1", CommandStatus::Completed, result.clone())
            .await
            .unwrap();
        assert!(matches!(outcome, QueueWriteOutcome::InvalidClaim));

        let outcome = broker
            .queue_complete(&claim.record.id, &claim.claim_token, "d1", CommandStatus::Completed, result.clone())
            .await
            .unwrap();
        assert!(matches!(outcome, QueueWriteOutcome::Applied(_)));

        // Second submission observes the terminal state.
        let outcome = broker
            .queue_complete(&claim.record.id, &claim.claim_token, "d1", CommandStatus::Completed, result)
            .await
            .unwrap();
        assert!(matches!(outcome, QueueWriteOutcome::AlreadyCompleted));
    }

    #[tokio::test]
    async fn requeue_expired_restores_pending_ordering() {
        let broker = MemoryBroker::new();

        let c1 = record("d1", 1);
        broker.queue_enqueue(c1.clone()).await.unwrap();

        let visible_until = OffsetDateTime::now_utc() + Duration::from_secs(60);
        let claimed = broker.queue_claim("d1", 1, visible_until).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let requeued = broker
            .queue_requeue_expired(OffsetDateTime::now_utc() + Duration::from_secs(61))
            .await
            .unwrap();
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].status, CommandStatus::Pending);
        assert!(requeued[0].claim_token_hash.is_none());

        let reclaimed = broker.queue_claim("d1", 1, visible_until).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].record.id, c1.id);
    }
}
