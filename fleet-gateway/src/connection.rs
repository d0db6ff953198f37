//! Connection manager: tracks every open client session, delivers outbound
//! messages with backpressure, detects dead peers via heartbeat, and closes
//! everything on shutdown.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_gateway_task::ChildTask;
use parking_lot::Mutex;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use uuid::Uuid;

pub const MAX_MESSAGE_BYTES: usize = 100 * 1024;
pub const MAX_QUEUE_SIZE: usize = 10;
pub const MAX_QUEUE_BYTES: usize = 512 * 1024;
pub const HIGH_WATER_MARK: usize = 256 * 1024;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Close code sent to every session during graceful shutdown.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code sent on authentication failure.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Application close code for peers that stopped answering pings.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4000;

/// Pause applied by the drainer while the transport sits at or above the
/// high-water mark.
const DRAIN_BACKOFF: Duration = Duration::from_millis(25);

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionKind {
    Device,
    Customer,
    Approval,
    WebPortal,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subprotocol: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub connected_at: OffsetDateTime,
}

impl Default for ConnectionMetadata {
    fn default() -> Self {
        Self {
            tenant_id: None,
            principal_id: None,
            device_id: None,
            subprotocol: None,
            connected_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Fields applied by `update_metadata`; `None` leaves the field untouched.
#[derive(Debug, Default)]
pub struct MetadataPatch {
    pub tenant_id: Option<String>,
    pub principal_id: Option<String>,
    pub device_id: Option<String>,
    pub subprotocol: Option<String>,
    pub kind: Option<ConnectionKind>,
}

/// Write side of a client session.
///
/// Implemented over the WebSocket sink for real peers and mocked in tests;
/// the manager only ever holds this, never the socket itself.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    fn is_open(&self) -> bool;

    /// Bytes accepted but not yet flushed to the peer.
    fn buffered_amount(&self) -> usize;

    async fn send_text(&self, payload: String) -> bool;

    async fn send_ping(&self) -> bool;

    async fn close(&self, code: u16, reason: &str);
}

struct QueuedMessage {
    payload: String,
    size: usize,
    completion: oneshot::Sender<bool>,
}

struct ConnectionEntry {
    transport: Arc<dyn SessionTransport>,
    kind: ConnectionKind,
    metadata: ConnectionMetadata,
    alive: bool,
    send_queue: VecDeque<QueuedMessage>,
    queued_bytes: usize,
    draining: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub total: usize,
    pub devices: usize,
    pub customers: usize,
    pub approvals: usize,
    pub web_portals: usize,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    registry: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
    heartbeat: Mutex<Option<ChildTask<()>>>,
}

enum SendPath {
    Direct(Arc<dyn SessionTransport>, String),
    Queued {
        completion: oneshot::Receiver<bool>,
        dropped: Vec<QueuedMessage>,
        start_drainer: bool,
    },
    Rejected,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry: Mutex::new(HashMap::new()),
                heartbeat: Mutex::new(None),
            }),
        }
    }

    /// Records a new session. Always succeeds; the peer is considered alive
    /// until the first heartbeat interval elapses without a pong.
    pub fn add(
        &self,
        id: ConnectionId,
        transport: Arc<dyn SessionTransport>,
        kind: ConnectionKind,
        metadata: ConnectionMetadata,
    ) {
        let entry = ConnectionEntry {
            transport,
            kind,
            metadata,
            alive: true,
            send_queue: VecDeque::new(),
            queued_bytes: 0,
            draining: false,
        };

        self.inner.registry.lock().insert(id, entry);

        debug!(connection.id = %id, ?kind, "Connection registered");
    }

    /// Idempotent; any queued pending-send promise resolves false.
    pub fn remove(&self, id: ConnectionId) {
        let removed = self.inner.registry.lock().remove(&id);

        if let Some(mut entry) = removed {
            for message in entry.send_queue.drain(..) {
                let _ = message.completion.send(false);
            }
            debug!(connection.id = %id, "Connection removed");
        }
    }

    /// Used when a session authenticates after connect.
    pub fn update_metadata(&self, id: ConnectionId, patch: MetadataPatch) {
        let mut registry = self.inner.registry.lock();

        let Some(entry) = registry.get_mut(&id) else {
            return;
        };

        if let Some(tenant_id) = patch.tenant_id {
            entry.metadata.tenant_id = Some(tenant_id);
        }
        if let Some(principal_id) = patch.principal_id {
            entry.metadata.principal_id = Some(principal_id);
        }
        if let Some(device_id) = patch.device_id {
            entry.metadata.device_id = Some(device_id);
        }
        if let Some(subprotocol) = patch.subprotocol {
            entry.metadata.subprotocol = Some(subprotocol);
        }
        if let Some(kind) = patch.kind {
            entry.kind = kind;
        }
    }

    pub fn metadata(&self, id: ConnectionId) -> Option<ConnectionMetadata> {
        self.inner.registry.lock().get(&id).map(|entry| entry.metadata.clone())
    }

    /// A pong was received from the session.
    pub fn mark_alive(&self, id: ConnectionId) {
        if let Some(entry) = self.inner.registry.lock().get_mut(&id) {
            entry.alive = true;
        }
    }

    /// Serializes and delivers one message, true on handed-to-transport
    /// success, false on any rejection.
    pub async fn send(&self, id: ConnectionId, value: &Value) -> bool {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(connection.id = %id, %error, "Failed to serialize outbound message");
                return false;
            }
        };

        let size = payload.len();

        if size > MAX_MESSAGE_BYTES {
            warn!(connection.id = %id, size, "Oversize message dropped");
            return false;
        }

        let path = {
            let mut registry = self.inner.registry.lock();

            let Some(entry) = registry.get_mut(&id) else {
                return false;
            };

            if !entry.transport.is_open() {
                SendPath::Rejected
            } else if entry.transport.buffered_amount() < HIGH_WATER_MARK
                && entry.send_queue.is_empty()
                && !entry.draining
            {
                SendPath::Direct(Arc::clone(&entry.transport), payload)
            } else {
                let mut dropped = Vec::new();

                // Oldest entries give way until the new message fits.
                while entry.queued_bytes + size > MAX_QUEUE_BYTES {
                    match entry.send_queue.pop_front() {
                        Some(old) => {
                            entry.queued_bytes -= old.size;
                            dropped.push(old);
                        }
                        None => break,
                    }
                }

                while entry.send_queue.len() >= MAX_QUEUE_SIZE {
                    if let Some(old) = entry.send_queue.pop_front() {
                        entry.queued_bytes -= old.size;
                        dropped.push(old);
                    }
                }

                let (tx, rx) = oneshot::channel();
                entry.send_queue.push_back(QueuedMessage {
                    payload,
                    size,
                    completion: tx,
                });
                entry.queued_bytes += size;

                let start_drainer = !entry.draining;
                if start_drainer {
                    entry.draining = true;
                }

                SendPath::Queued {
                    completion: rx,
                    dropped,
                    start_drainer,
                }
            }
        };

        match path {
            SendPath::Rejected => false,
            SendPath::Direct(transport, payload) => transport.send_text(payload).await,
            SendPath::Queued {
                completion,
                dropped,
                start_drainer,
            } => {
                if !dropped.is_empty() {
                    warn!(connection.id = %id, count = dropped.len(), "Send queue overflow, oldest messages dropped");
                    for message in dropped {
                        let _ = message.completion.send(false);
                    }
                }

                if start_drainer {
                    let inner = Arc::clone(&self.inner);
                    ChildTask::spawn(drain_send_queue(inner, id)).detach();
                }

                completion.await.unwrap_or(false)
            }
        }
    }

    pub async fn broadcast_all(&self, value: &Value) -> usize {
        let targets: Vec<ConnectionId> = self.inner.registry.lock().keys().copied().collect();
        self.send_to_all(targets, value).await
    }

    pub async fn broadcast_kind(&self, kind: ConnectionKind, value: &Value) -> usize {
        let targets: Vec<ConnectionId> = self
            .inner
            .registry
            .lock()
            .iter()
            .filter(|(_, entry)| entry.kind == kind)
            .map(|(id, _)| *id)
            .collect();
        self.send_to_all(targets, value).await
    }

    pub async fn broadcast_tenant(&self, tenant_id: &str, value: &Value) -> usize {
        let targets: Vec<ConnectionId> = self
            .inner
            .registry
            .lock()
            .iter()
            .filter(|(_, entry)| entry.metadata.tenant_id.as_deref() == Some(tenant_id))
            .map(|(id, _)| *id)
            .collect();
        self.send_to_all(targets, value).await
    }

    /// Fan-out for approval requests: every approval-console session, plus
    /// customer and web-portal sessions belonging to the tenant.
    pub async fn broadcast_approvers(&self, tenant_id: &str, value: &Value) -> usize {
        let targets: Vec<ConnectionId> = self
            .inner
            .registry
            .lock()
            .iter()
            .filter(|(_, entry)| match entry.kind {
                ConnectionKind::Approval => true,
                ConnectionKind::Customer | ConnectionKind::WebPortal => {
                    entry.metadata.tenant_id.as_deref() == Some(tenant_id)
                }
                ConnectionKind::Device => false,
            })
            .map(|(id, _)| *id)
            .collect();
        self.send_to_all(targets, value).await
    }

    async fn send_to_all(&self, targets: Vec<ConnectionId>, value: &Value) -> usize {
        let sends = targets.into_iter().map(|id| self.send(id, value));
        futures::future::join_all(sends)
            .await
            .into_iter()
            .filter(|delivered| *delivered)
            .count()
    }

    /// Begins the periodic liveness check, stopping any prior one.
    ///
    /// A session missing two consecutive ping periods without a pong is
    /// dead: the first period clears its flag, the second evicts it.
    pub fn start_heartbeat(&self, interval: Duration) {
        let inner = Arc::clone(&self.inner);

        let task = ChildTask::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                heartbeat_pass(&inner).await;
            }
        });

        // Replacing the previous ChildTask aborts it on drop.
        *self.inner.heartbeat.lock() = Some(task);
    }

    pub fn stop_heartbeat(&self) {
        let _ = self.inner.heartbeat.lock().take();
    }

    /// Closes every session with 1001 and clears the registry. Must run
    /// during graceful shutdown, before broker teardown.
    pub async fn close_all(&self) {
        self.stop_heartbeat();

        let entries: Vec<(ConnectionId, ConnectionEntry)> =
            self.inner.registry.lock().drain().collect();

        let count = entries.len();

        for (id, mut entry) in entries {
            for message in entry.send_queue.drain(..) {
                let _ = message.completion.send(false);
            }
            entry.transport.close(CLOSE_GOING_AWAY, "server shutting down").await;
            trace!(connection.id = %id, "Connection closed");
        }

        info!(count, "All connections closed");
    }

    pub fn stats(&self) -> ConnectionStats {
        let registry = self.inner.registry.lock();

        let mut stats = ConnectionStats {
            total: registry.len(),
            ..Default::default()
        };

        for entry in registry.values() {
            match entry.kind {
                ConnectionKind::Device => stats.devices += 1,
                ConnectionKind::Customer => stats.customers += 1,
                ConnectionKind::Approval => stats.approvals += 1,
                ConnectionKind::WebPortal => stats.web_portals += 1,
            }
        }

        stats
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn heartbeat_pass(inner: &Arc<ManagerInner>) {
    let mut dead = Vec::new();
    let mut to_ping = Vec::new();

    {
        let mut registry = inner.registry.lock();

        for (id, entry) in registry.iter_mut() {
            if !entry.transport.is_open() || !entry.alive {
                dead.push((*id, Arc::clone(&entry.transport)));
            } else {
                entry.alive = false;
                to_ping.push(Arc::clone(&entry.transport));
            }
        }
    }

    for (id, transport) in dead {
        warn!(connection.id = %id, "Heartbeat missed twice, terminating connection");
        transport.close(CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout").await;

        if let Some(mut entry) = inner.registry.lock().remove(&id) {
            for message in entry.send_queue.drain(..) {
                let _ = message.completion.send(false);
            }
        }
    }

    for transport in to_ping {
        let _ = transport.send_ping().await;
    }
}

/// Single-flight per session; the yield between iterations is mandatory so
/// a slow peer on a fast network cannot starve the scheduler.
async fn drain_send_queue(inner: Arc<ManagerInner>, id: ConnectionId) {
    enum Step {
        Write(Arc<dyn SessionTransport>, QueuedMessage),
        Wait,
        Abort(Vec<QueuedMessage>),
        Done,
    }

    loop {
        let step = {
            let mut registry = inner.registry.lock();

            let Some(entry) = registry.get_mut(&id) else {
                // remove() already resolved the queued promises.
                break;
            };

            if !entry.transport.is_open() {
                entry.queued_bytes = 0;
                entry.draining = false;
                Step::Abort(entry.send_queue.drain(..).collect())
            } else if let Some(message) = {
                if entry.transport.buffered_amount() < HIGH_WATER_MARK {
                    entry.send_queue.pop_front()
                } else {
                    None
                }
            } {
                entry.queued_bytes -= message.size;
                Step::Write(Arc::clone(&entry.transport), message)
            } else if entry.send_queue.is_empty() {
                entry.draining = false;
                Step::Done
            } else {
                Step::Wait
            }
        };

        match step {
            Step::Write(transport, message) => {
                let delivered = transport.send_text(message.payload).await;
                let _ = message.completion.send(delivered);
                tokio::task::yield_now().await;
            }
            Step::Wait => tokio::time::sleep(DRAIN_BACKOFF).await,
            Step::Abort(messages) => {
                for message in messages {
                    let _ = message.completion.send(false);
                }
                break;
            }
            Step::Done => break,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct MockTransport {
        open: AtomicBool,
        buffered: AtomicUsize,
        sent: Mutex<Vec<String>>,
        pings: AtomicUsize,
        closed_with: Mutex<Option<(u16, String)>>,
    }

    impl MockTransport {
        fn open() -> Arc<Self> {
            let transport = Self::default();
            transport.open.store(true, Ordering::SeqCst);
            Arc::new(transport)
        }

        fn set_buffered(&self, amount: usize) {
            self.buffered.store(amount, Ordering::SeqCst);
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().len()
        }
    }

    #[async_trait]
    impl SessionTransport for MockTransport {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }

        async fn send_text(&self, payload: String) -> bool {
            self.sent.lock().push(payload);
            true
        }

        async fn send_ping(&self) -> bool {
            self.pings.fetch_add(1, Ordering::SeqCst);
            true
        }

        async fn close(&self, code: u16, reason: &str) {
            self.open.store(false, Ordering::SeqCst);
            *self.closed_with.lock() = Some((code, reason.to_owned()));
        }
    }

    fn manager_with(transport: Arc<MockTransport>, kind: ConnectionKind) -> (ConnectionManager, ConnectionId) {
        let manager = ConnectionManager::new();
        let id = Uuid::new_v4();
        manager.add(id, transport, kind, ConnectionMetadata::default());
        (manager, id)
    }

    #[tokio::test]
    async fn direct_send_when_idle() {
        let transport = MockTransport::open();
        let (manager, id) = manager_with(Arc::clone(&transport), ConnectionKind::Device);

        assert!(manager.send(id, &json!({"type": "ping"})).await);
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn send_to_unknown_session_fails() {
        let manager = ConnectionManager::new();
        assert!(!manager.send(Uuid::new_v4(), &json!({})).await);
    }

    #[tokio::test]
    async fn oversize_message_is_dropped() {
        let transport = MockTransport::open();
        let (manager, id) = manager_with(Arc::clone(&transport), ConnectionKind::Device);

        let huge = "x".repeat(MAX_MESSAGE_BYTES + 1);
        assert!(!manager.send(id, &json!({"payload": huge})).await);
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn at_high_water_mark_takes_the_queued_path() {
        let transport = MockTransport::open();
        transport.set_buffered(HIGH_WATER_MARK);
        let (manager, id) = manager_with(Arc::clone(&transport), ConnectionKind::Customer);

        let send = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.send(id, &json!({"n": 1})).await })
        };

        // Nothing reaches the transport while it sits at the mark.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.sent_count(), 0);

        transport.set_buffered(0);
        assert!(send.await.unwrap());
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn stalled_peer_overflow_drops_oldest() {
        let transport = MockTransport::open();
        transport.set_buffered(300_000);
        let (manager, id) = manager_with(Arc::clone(&transport), ConnectionKind::Customer);

        let payload = "y".repeat(50 * 1024);
        let mut sends = Vec::new();

        for n in 0..15 {
            let manager = manager.clone();
            let payload = payload.clone();
            sends.push(tokio::spawn(async move {
                manager.send(id, &json!({"n": n, "payload": payload})).await
            }));
            // Keep enqueue order deterministic.
            tokio::task::yield_now().await;
        }

        tokio::time::sleep(Duration::from_millis(60)).await;

        // Exactly MAX_QUEUE_SIZE entries remain queued; the overflow
        // already resolved false.
        transport.set_buffered(0);

        let mut delivered = 0;
        let mut rejected = 0;
        for send in sends {
            if send.await.unwrap() {
                delivered += 1;
            } else {
                rejected += 1;
            }
        }

        assert_eq!(delivered, MAX_QUEUE_SIZE);
        assert_eq!(rejected, 5);
        assert_eq!(transport.sent_count(), MAX_QUEUE_SIZE);
    }

    #[tokio::test]
    async fn drainer_preserves_enqueue_order() {
        let transport = MockTransport::open();
        transport.set_buffered(HIGH_WATER_MARK);
        let (manager, id) = manager_with(Arc::clone(&transport), ConnectionKind::Customer);

        let mut sends = Vec::new();
        for n in 0..5 {
            let manager = manager.clone();
            sends.push(tokio::spawn(async move { manager.send(id, &json!({"n": n})).await }));
            tokio::task::yield_now().await;
        }

        tokio::time::sleep(Duration::from_millis(40)).await;
        transport.set_buffered(0);

        for send in sends {
            assert!(send.await.unwrap());
        }

        let sent = transport.sent.lock().clone();
        let order: Vec<i64> = sent
            .iter()
            .map(|payload| serde_json::from_str::<Value>(payload).unwrap()["n"].as_i64().unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn remove_resolves_queued_sends_false() {
        let transport = MockTransport::open();
        transport.set_buffered(HIGH_WATER_MARK);
        let (manager, id) = manager_with(Arc::clone(&transport), ConnectionKind::Customer);

        let send = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.send(id, &json!({"n": 1})).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.remove(id);

        assert!(!send.await.unwrap());
    }

    #[tokio::test]
    async fn heartbeat_evicts_silent_peers() {
        let transport = MockTransport::open();
        let (manager, _id) = manager_with(Arc::clone(&transport), ConnectionKind::Device);

        manager.start_heartbeat(Duration::from_millis(50));

        // First pass clears the flag and pings; no pong arrives, so the
        // second pass evicts.
        tokio::time::sleep(Duration::from_millis(160)).await;

        assert_eq!(manager.stats().total, 0);
        assert!(transport.pings.load(Ordering::SeqCst) >= 1);
        assert_eq!(
            transport.closed_with.lock().as_ref().map(|(code, _)| *code),
            Some(CLOSE_HEARTBEAT_TIMEOUT)
        );
    }

    #[tokio::test]
    async fn heartbeat_keeps_responsive_peers() {
        let transport = MockTransport::open();
        let (manager, id) = manager_with(Arc::clone(&transport), ConnectionKind::Device);

        manager.start_heartbeat(Duration::from_millis(50));

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            manager.mark_alive(id);
        }

        assert_eq!(manager.stats().total, 1);
        manager.stop_heartbeat();
    }

    #[tokio::test]
    async fn broadcast_filters_by_kind_and_tenant() {
        let manager = ConnectionManager::new();

        let device = Uuid::new_v4();
        let customer_a = Uuid::new_v4();
        let customer_b = Uuid::new_v4();
        let approver = Uuid::new_v4();

        let transports: Vec<Arc<MockTransport>> = (0..4).map(|_| MockTransport::open()).collect();

        manager.add(device, Arc::clone(&transports[0]) as Arc<dyn SessionTransport>, ConnectionKind::Device, ConnectionMetadata {
            tenant_id: Some("tenant-a".to_owned()),
            ..Default::default()
        });
        manager.add(customer_a, Arc::clone(&transports[1]) as Arc<dyn SessionTransport>, ConnectionKind::Customer, ConnectionMetadata {
            tenant_id: Some("tenant-a".to_owned()),
            ..Default::default()
        });
        manager.add(customer_b, Arc::clone(&transports[2]) as Arc<dyn SessionTransport>, ConnectionKind::Customer, ConnectionMetadata {
            tenant_id: Some("tenant-b".to_owned()),
            ..Default::default()
        });
        manager.add(approver, Arc::clone(&transports[3]) as Arc<dyn SessionTransport>, ConnectionKind::Approval, ConnectionMetadata::default());

        let delivered = manager.broadcast_approvers("tenant-a", &json!({"type": "approval_request"})).await;
        assert_eq!(delivered, 2);
        assert_eq!(transports[0].sent_count(), 0);
        assert_eq!(transports[1].sent_count(), 1);
        assert_eq!(transports[2].sent_count(), 0);
        assert_eq!(transports[3].sent_count(), 1);

        let delivered = manager.broadcast_kind(ConnectionKind::Device, &json!({"type": "drain"})).await;
        assert_eq!(delivered, 1);
        assert_eq!(transports[0].sent_count(), 1);
    }

    #[tokio::test]
    async fn close_all_sends_going_away() {
        let transport = MockTransport::open();
        let (manager, _id) = manager_with(Arc::clone(&transport), ConnectionKind::Device);

        manager.close_all().await;

        assert_eq!(manager.stats().total, 0);
        let closed = transport.closed_with.lock().clone();
        assert_eq!(closed, Some((CLOSE_GOING_AWAY, "server shutting down".to_owned())));
    }
}
