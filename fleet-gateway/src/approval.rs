//! HITL approval coordinator.
//!
//! When the AI engine asks "may I invoke tool T with input I?", either
//! decide immediately from policy or escalate to a human, resolving exactly
//! once. Removal from the pending registry is the serialization point:
//! whichever path (human, timeout, abort, shutdown) takes the entry owns
//! the resolution and every other path becomes a no-op.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fleet_gateway_task::ChildTask;
use parking_lot::Mutex;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

use crate::catalog::{
    ApprovalPolicy, ApprovalRecord, ApprovalStatus, CatalogError, CatalogStore, DynCatalog, RiskLevel,
};
use crate::connection::ConnectionManager;

pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Tools the registry classifies as read-only; they never require human
/// approval.
const READ_ONLY_TOOLS: &[&str] = &[
    "get_device_status",
    "list_devices",
    "read_diagnostics",
    "network_read",
    "ping_device",
    "view_logs",
];

pub fn is_read_only_tool(tool_name: &str) -> bool {
    READ_ONLY_TOOLS.contains(&tool_name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionResult {
    Allow {
        /// Input the tool should run with when the operator modified it;
        /// `None` carries the original input.
        updated_input: Option<Value>,
    },
    Deny {
        message: String,
        interrupt: bool,
    },
}

impl PermissionResult {
    pub fn allow() -> Self {
        Self::Allow { updated_input: None }
    }

    fn deny(message: impl Into<String>) -> Self {
        Self::Deny {
            message: message.into(),
            interrupt: false,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approved,
    Denied,
    /// Approve with operator-modified input; audited as `approved`.
    Modify,
    Deny,
}

#[derive(Debug, Default)]
pub struct ResolveOptions {
    pub reason: Option<String>,
    pub modified_input: Option<Value>,
    pub interrupt: bool,
}

#[derive(Debug, Default)]
pub struct DecideOptions {
    pub cancellation: Option<CancellationToken>,
    pub suggestions: Vec<Value>,
    pub timeout: Option<Duration>,
    pub risk_level: Option<RiskLevel>,
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApprovalInfo {
    pub approval_id: String,
    pub session_id: String,
    pub tenant_id: String,
    pub tool_name: String,
    pub tool_input: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub timeout_ms: u64,
}

/// Typed broadcast replacing the source's in-process event emitters.
/// Bounded and lossy on slow consumers: the contract is at-least-zero
/// delivery to current subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApprovalEvent {
    #[serde(rename_all = "camelCase")]
    ApprovalRequest { approval: PendingApprovalInfo },
    #[serde(rename_all = "camelCase")]
    ApprovalResponse {
        approval_id: String,
        session_id: String,
        tenant_id: String,
        tool_name: String,
        decision: ApprovalDecision,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ApprovalTimeout {
        approval_id: String,
        session_id: String,
        tenant_id: String,
        tool_name: String,
        timeout: u64,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval request is not pending")]
    NotPending,
}

#[derive(Debug)]
enum Resolution {
    Human {
        decision: ApprovalDecision,
        reason: Option<String>,
        modified_input: Option<Value>,
        interrupt: bool,
    },
    Timeout {
        timeout_ms: u64,
    },
    Aborted,
    Shutdown,
}

struct PendingEntry {
    info: PendingApprovalInfo,
    resolver: oneshot::Sender<Resolution>,
    timeout_task: Option<ChildTask<()>>,
    abort_task: Option<ChildTask<()>>,
}

#[derive(Clone)]
pub struct ApprovalCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    catalog: DynCatalog,
    connections: ConnectionManager,
    pending: Mutex<HashMap<String, PendingEntry>>,
    policies: Mutex<HashMap<String, Arc<HashMap<String, ApprovalPolicy>>>>,
    events: broadcast::Sender<ApprovalEvent>,
    default_timeout: Duration,
    shutting_down: AtomicBool,
}

/// Decision closure bound to one authenticated session.
#[derive(Clone)]
pub struct PermissionDecider {
    coordinator: ApprovalCoordinator,
    session_id: String,
    tenant_id: String,
}

impl PermissionDecider {
    pub async fn decide(&self, tool_name: &str, input: Value, options: DecideOptions) -> PermissionResult {
        self.coordinator
            .decide(&self.session_id, &self.tenant_id, tool_name, input, options)
            .await
    }
}

impl ApprovalCoordinator {
    pub fn new(catalog: DynCatalog, connections: ConnectionManager, default_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(CoordinatorInner {
                catalog,
                connections,
                pending: Mutex::new(HashMap::new()),
                policies: Mutex::new(HashMap::new()),
                events,
                default_timeout,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ApprovalEvent> {
        self.inner.events.subscribe()
    }

    pub fn bind_session(&self, session_id: impl Into<String>, tenant_id: impl Into<String>) -> PermissionDecider {
        PermissionDecider {
            coordinator: self.clone(),
            session_id: session_id.into(),
            tenant_id: tenant_id.into(),
        }
    }

    /// Decides a tool invocation: immediately from policy when possible,
    /// otherwise by escalating to a human.
    #[instrument(skip(self, input, options), fields(session.id = %session_id, tool = %tool_name))]
    pub async fn decide(
        &self,
        session_id: &str,
        tenant_id: &str,
        tool_name: &str,
        input: Value,
        options: DecideOptions,
    ) -> PermissionResult {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return PermissionResult::deny("service shutting down");
        }

        if options.cancellation.as_ref().is_some_and(|token| token.is_cancelled()) {
            let record = self.audit_record(session_id, tenant_id, tool_name, &input, ApprovalStatus::Denied);
            if let Err(error) = self.inner.catalog.insert_approval(record).await {
                warn!(%error, "Failed to audit pre-aborted approval request");
            }
            return PermissionResult::deny("aborted before approval");
        }

        let policies = match self.policies_for(tenant_id).await {
            Ok(policies) => policies,
            Err(error) => {
                // Fail closed: a tenant whose policies cannot be read gets
                // the human-approval path.
                warn!(%error, "Failed to load approval policies");
                Arc::new(HashMap::new())
            }
        };

        match policies.get(tool_name) {
            Some(policy) if policy.auto_approve => {
                debug!("Tool invocation auto-approved by policy");
                return PermissionResult::allow();
            }
            Some(policy) if !policy.requires_approval => {
                debug!("Tool does not require approval");
                return PermissionResult::allow();
            }
            Some(_) => {}
            None => {
                warn!("No approval policy for tool, requiring human approval");
            }
        }

        if is_read_only_tool(tool_name) {
            debug!("Read-only tool allowed without approval");
            return PermissionResult::allow();
        }

        if !options.suggestions.is_empty() {
            // The contract today is "allow, carrying the original input"; a
            // three-way {allow, ask, allow-with-override} can hook in here.
            debug!(count = options.suggestions.len(), "Allowing based on engine suggestions");
            return PermissionResult::allow();
        }

        self.escalate(session_id, tenant_id, tool_name, input, options).await
    }

    /// Applies a human decision to a pending approval.
    pub async fn resolve(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
        options: ResolveOptions,
    ) -> Result<(), ApprovalError> {
        let resolution = Resolution::Human {
            decision,
            reason: options.reason,
            modified_input: options.modified_input,
            interrupt: options.interrupt,
        };

        if self.resolve_with(approval_id, resolution).await {
            Ok(())
        } else {
            Err(ApprovalError::NotPending)
        }
    }

    /// Resolves an outstanding request as denied.
    pub async fn cancel(&self, approval_id: &str, reason: impl Into<String>) -> Result<(), ApprovalError> {
        self.resolve(
            approval_id,
            ApprovalDecision::Deny,
            ResolveOptions {
                reason: Some(reason.into()),
                ..Default::default()
            },
        )
        .await
    }

    /// Outstanding requests for a tenant, for UI listing and polling.
    pub fn pending_for_tenant(&self, tenant_id: &str) -> Vec<PendingApprovalInfo> {
        self.inner
            .pending
            .lock()
            .values()
            .filter(|entry| entry.info.tenant_id == tenant_id)
            .map(|entry| entry.info.clone())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Rejects every pending request with a terminal deny and clears the
    /// policy cache. Event subscribers observe the channel closing once the
    /// coordinator itself is dropped.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);

        let ids: Vec<String> = self.inner.pending.lock().keys().cloned().collect();

        for id in &ids {
            self.resolve_with(id, Resolution::Shutdown).await;
        }

        self.inner.policies.lock().clear();

        if !ids.is_empty() {
            info!(count = ids.len(), "Pending approvals rejected for shutdown");
        }
    }

    async fn policies_for(&self, tenant_id: &str) -> Result<Arc<HashMap<String, ApprovalPolicy>>, CatalogError> {
        if let Some(cached) = self.inner.policies.lock().get(tenant_id) {
            return Ok(Arc::clone(cached));
        }

        let loaded = self.inner.catalog.load_policies(tenant_id).await?;

        let map: HashMap<String, ApprovalPolicy> = loaded
            .into_iter()
            .map(|policy| (policy.tool_name.clone(), policy))
            .collect();
        let map = Arc::new(map);

        // A concurrent loader may have won the race; keep the first.
        let cached = Arc::clone(
            self.inner
                .policies
                .lock()
                .entry(tenant_id.to_owned())
                .or_insert(map),
        );

        Ok(cached)
    }

    fn audit_record(
        &self,
        session_id: &str,
        tenant_id: &str,
        tool_name: &str,
        input: &Value,
        status: ApprovalStatus,
    ) -> ApprovalRecord {
        ApprovalRecord {
            approval_id: new_approval_id(),
            session_id: session_id.to_owned(),
            tenant_id: tenant_id.to_owned(),
            tool_name: tool_name.to_owned(),
            tool_input: input.clone(),
            status,
            decision_reason: None,
            created_at: OffsetDateTime::now_utc(),
            decided_at: None,
        }
    }

    async fn escalate(
        &self,
        session_id: &str,
        tenant_id: &str,
        tool_name: &str,
        input: Value,
        options: DecideOptions,
    ) -> PermissionResult {
        let timeout = options.timeout.unwrap_or(self.inner.default_timeout);
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);

        let approval_id = new_approval_id();

        let info = PendingApprovalInfo {
            approval_id: approval_id.clone(),
            session_id: session_id.to_owned(),
            tenant_id: tenant_id.to_owned(),
            tool_name: tool_name.to_owned(),
            tool_input: input.clone(),
            requested_at: OffsetDateTime::now_utc(),
            risk_level: options.risk_level,
            reasoning: options.reasoning,
            timeout_ms,
        };

        let (resolver, resolver_rx) = oneshot::channel();

        self.inner.pending.lock().insert(
            approval_id.clone(),
            PendingEntry {
                info: info.clone(),
                resolver,
                timeout_task: None,
                abort_task: None,
            },
        );

        // An approval that cannot be audited is never shown to a human.
        let record = ApprovalRecord {
            approval_id: approval_id.clone(),
            session_id: session_id.to_owned(),
            tenant_id: tenant_id.to_owned(),
            tool_name: tool_name.to_owned(),
            tool_input: input,
            status: ApprovalStatus::Pending,
            decision_reason: None,
            created_at: info.requested_at,
            decided_at: None,
        };

        if let Err(error) = self.inner.catalog.insert_approval(record).await {
            error!(%error, approval.id = %approval_id, "Failed to persist approval request");
            self.inner.pending.lock().remove(&approval_id);
            return PermissionResult::deny("approval request could not be recorded");
        }

        let timeout_task = ChildTask::spawn({
            let this = self.clone();
            let id = approval_id.clone();
            async move {
                tokio::time::sleep(timeout).await;
                this.resolve_with(&id, Resolution::Timeout { timeout_ms }).await;
            }
        });

        let abort_task = options.cancellation.map(|token| {
            ChildTask::spawn({
                let this = self.clone();
                let id = approval_id.clone();
                async move {
                    token.cancelled().await;
                    this.resolve_with(&id, Resolution::Aborted).await;
                }
            })
        });

        {
            let mut pending = self.inner.pending.lock();
            if let Some(entry) = pending.get_mut(&approval_id) {
                entry.timeout_task = Some(timeout_task);
                entry.abort_task = abort_task;
            }
            // Entry already gone: the tasks drop right here and abort.
        }

        let frame = json!({
            "type": "approval_request",
            "approval": info,
        });

        let delivered = self.inner.connections.broadcast_approvers(tenant_id, &frame).await;
        debug!(approval.id = %approval_id, delivered, "Approval request broadcast");

        let _ = self.inner.events.send(ApprovalEvent::ApprovalRequest { approval: info });

        match resolver_rx.await {
            Ok(Resolution::Human {
                decision: ApprovalDecision::Approved | ApprovalDecision::Modify,
                modified_input,
                ..
            }) => PermissionResult::Allow {
                updated_input: modified_input,
            },
            Ok(Resolution::Human {
                decision: ApprovalDecision::Denied | ApprovalDecision::Deny,
                reason,
                interrupt,
                ..
            }) => PermissionResult::Deny {
                message: reason.unwrap_or_else(|| "denied by operator".to_owned()),
                interrupt,
            },
            Ok(Resolution::Timeout { timeout_ms }) => {
                PermissionResult::deny(format!("approval request timed out after {timeout_ms} ms"))
            }
            Ok(Resolution::Aborted) => PermissionResult::deny("aborted by client"),
            Ok(Resolution::Shutdown) => PermissionResult::deny("service shutting down"),
            Err(_) => PermissionResult::deny("approval request dropped"),
        }
    }

    /// The single resolution funnel; returns false when the request was
    /// already resolved by another path.
    async fn resolve_with(&self, approval_id: &str, resolution: Resolution) -> bool {
        let entry = self.inner.pending.lock().remove(approval_id);

        let Some(entry) = entry else {
            return false;
        };

        let (status, reason) = match &resolution {
            Resolution::Human {
                decision: ApprovalDecision::Approved | ApprovalDecision::Modify,
                reason,
                ..
            } => (ApprovalStatus::Approved, reason.clone()),
            Resolution::Human { reason, .. } => (ApprovalStatus::Denied, reason.clone()),
            Resolution::Timeout { .. } => (ApprovalStatus::Timeout, Some("approval request timed out".to_owned())),
            Resolution::Aborted => (ApprovalStatus::Denied, Some("aborted by client".to_owned())),
            Resolution::Shutdown => (ApprovalStatus::Denied, Some("service shutting down".to_owned())),
        };

        if let Err(error) = self
            .inner
            .catalog
            .update_approval_status(approval_id, status, reason.clone())
            .await
        {
            warn!(%error, approval.id = %approval_id, "Failed to update approval audit row");
        }

        let event = match &resolution {
            Resolution::Human { decision, reason, .. } => ApprovalEvent::ApprovalResponse {
                approval_id: entry.info.approval_id.clone(),
                session_id: entry.info.session_id.clone(),
                tenant_id: entry.info.tenant_id.clone(),
                tool_name: entry.info.tool_name.clone(),
                decision: *decision,
                reason: reason.clone(),
            },
            Resolution::Timeout { timeout_ms } => ApprovalEvent::ApprovalTimeout {
                approval_id: entry.info.approval_id.clone(),
                session_id: entry.info.session_id.clone(),
                tenant_id: entry.info.tenant_id.clone(),
                tool_name: entry.info.tool_name.clone(),
                timeout: *timeout_ms,
            },
            Resolution::Aborted | Resolution::Shutdown => ApprovalEvent::ApprovalResponse {
                approval_id: entry.info.approval_id.clone(),
                session_id: entry.info.session_id.clone(),
                tenant_id: entry.info.tenant_id.clone(),
                tool_name: entry.info.tool_name.clone(),
                decision: ApprovalDecision::Deny,
                reason,
            },
        };

        let _ = self.inner.events.send(event);

        info!(approval.id = %approval_id, status = ?status, "Approval resolved");

        let _ = entry.resolver.send(resolution);

        // Dropping the other paths last: no await may follow, since the
        // timeout path resolves through its own ChildTask handle.
        drop(entry.timeout_task);
        drop(entry.abort_task);

        true
    }
}

fn new_approval_id() -> String {
    use rand::RngCore as _;

    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);

    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;

    format!("apr_{millis}_{}", hex::encode(bytes))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;

    fn coordinator() -> (ApprovalCoordinator, Arc<MemoryCatalog>) {
        let catalog = Arc::new(MemoryCatalog::new());
        let connections = ConnectionManager::new();
        let coordinator = ApprovalCoordinator::new(
            Arc::clone(&catalog) as Arc<dyn CatalogStore>,
            connections,
            DEFAULT_APPROVAL_TIMEOUT,
        );
        (coordinator, catalog)
    }

    fn policy(tool: &str, auto_approve: bool, requires_approval: bool) -> ApprovalPolicy {
        ApprovalPolicy {
            tenant_id: "tenant-1".to_owned(),
            tool_name: tool.to_owned(),
            auto_approve,
            requires_approval,
            risk_threshold: RiskLevel::Medium,
            conditions: None,
        }
    }

    #[tokio::test]
    async fn auto_approve_policy_allows() {
        let (coordinator, catalog) = coordinator();
        catalog.upsert_policy(policy("restart_service", true, true)).await.unwrap();

        let result = coordinator
            .decide("s1", "tenant-1", "restart_service", json!({}), DecideOptions::default())
            .await;

        assert!(result.is_allowed());
    }

    #[tokio::test]
    async fn read_only_tool_allows_without_policy() {
        let (coordinator, _catalog) = coordinator();

        let result = coordinator
            .decide("s1", "tenant-1", "list_devices", json!({}), DecideOptions::default())
            .await;

        assert!(result.is_allowed());
    }

    #[tokio::test]
    async fn suggestions_allow_with_original_input() {
        let (coordinator, _catalog) = coordinator();

        let result = coordinator
            .decide(
                "s1",
                "tenant-1",
                "network_write",
                json!({"target": "vlan-7"}),
                DecideOptions {
                    suggestions: vec![json!({"target": "vlan-8"})],
                    ..Default::default()
                },
            )
            .await;

        assert_eq!(result, PermissionResult::Allow { updated_input: None });
    }

    #[tokio::test]
    async fn missing_policy_escalates_and_times_out() {
        let (coordinator, catalog) = coordinator();
        let mut events = coordinator.subscribe_events();

        let result = coordinator
            .decide(
                "s1",
                "tenant-1",
                "network_write",
                json!({"target": "vlan-7"}),
                DecideOptions {
                    timeout: Some(Duration::from_millis(100)),
                    ..Default::default()
                },
            )
            .await;

        let PermissionResult::Deny { message, .. } = result else {
            panic!("expected deny");
        };
        assert!(message.to_lowercase().contains("timed out"), "message: {message}");

        // The broadcast carries request + timeout in order.
        let first = events.recv().await.unwrap();
        assert!(matches!(first, ApprovalEvent::ApprovalRequest { .. }));

        let second = events.recv().await.unwrap();
        let ApprovalEvent::ApprovalTimeout {
            session_id,
            tenant_id,
            tool_name,
            timeout,
            approval_id,
        } = second
        else {
            panic!("expected timeout event");
        };
        assert_eq!(session_id, "s1");
        assert_eq!(tenant_id, "tenant-1");
        assert_eq!(tool_name, "network_write");
        assert_eq!(timeout, 100);

        let record = catalog.get_approval(&approval_id).await.unwrap().unwrap();
        assert_eq!(record.status, ApprovalStatus::Timeout);
    }

    #[tokio::test]
    async fn human_approval_resolves_the_requester() {
        let (coordinator, catalog) = coordinator();

        let decide = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .decide("s1", "tenant-1", "network_write", json!({}), DecideOptions::default())
                    .await
            })
        };

        // Wait for the pending entry to appear.
        let approval_id = loop {
            let pending = coordinator.pending_for_tenant("tenant-1");
            if let Some(info) = pending.first() {
                break info.approval_id.clone();
            }
            tokio::task::yield_now().await;
        };

        coordinator
            .resolve(
                &approval_id,
                ApprovalDecision::Modify,
                ResolveOptions {
                    modified_input: Some(json!({"target": "vlan-9"})),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let result = decide.await.unwrap();
        assert_eq!(
            result,
            PermissionResult::Allow {
                updated_input: Some(json!({"target": "vlan-9"}))
            }
        );

        // `modify` audits as approved.
        let record = catalog.get_approval(&approval_id).await.unwrap().unwrap();
        assert_eq!(record.status, ApprovalStatus::Approved);

        // Exactly-once: the late timeout and a second resolve are no-ops.
        let late = coordinator
            .resolve(&approval_id, ApprovalDecision::Denied, ResolveOptions::default())
            .await;
        assert!(matches!(late, Err(ApprovalError::NotPending)));
    }

    #[tokio::test]
    async fn bound_decider_carries_its_session() {
        let (coordinator, catalog) = coordinator();
        catalog.upsert_policy(policy("collect_logs", false, false)).await.unwrap();

        let decider = coordinator.bind_session("s7", "tenant-1");

        let result = decider.decide("collect_logs", json!({}), DecideOptions::default()).await;
        assert!(result.is_allowed());
    }

    #[tokio::test]
    async fn cancel_resolves_as_deny() {
        let (coordinator, catalog) = coordinator();

        let decide = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .decide("s1", "tenant-1", "network_write", json!({}), DecideOptions::default())
                    .await
            })
        };

        let approval_id = loop {
            let pending = coordinator.pending_for_tenant("tenant-1");
            if let Some(info) = pending.first() {
                break info.approval_id.clone();
            }
            tokio::task::yield_now().await;
        };

        coordinator.cancel(&approval_id, "superseded by operator").await.unwrap();

        let result = decide.await.unwrap();
        let PermissionResult::Deny { message, .. } = result else {
            panic!("expected deny");
        };
        assert_eq!(message, "superseded by operator");

        let record = catalog.get_approval(&approval_id).await.unwrap().unwrap();
        assert_eq!(record.status, ApprovalStatus::Denied);
    }

    #[tokio::test]
    async fn cancellation_token_aborts_the_request() {
        let (coordinator, _catalog) = coordinator();
        let token = CancellationToken::new();

        let decide = {
            let coordinator = coordinator.clone();
            let token = token.clone();
            tokio::spawn(async move {
                coordinator
                    .decide(
                        "s1",
                        "tenant-1",
                        "network_write",
                        json!({}),
                        DecideOptions {
                            cancellation: Some(token),
                            ..Default::default()
                        },
                    )
                    .await
            })
        };

        while coordinator.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        token.cancel();

        let result = decide.await.unwrap();
        let PermissionResult::Deny { message, .. } = result else {
            panic!("expected deny");
        };
        assert_eq!(message, "aborted by client");
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test]
    async fn already_cancelled_token_denies_before_escalation() {
        let (coordinator, _catalog) = coordinator();
        let token = CancellationToken::new();
        token.cancel();

        let result = coordinator
            .decide(
                "s1",
                "tenant-1",
                "network_write",
                json!({}),
                DecideOptions {
                    cancellation: Some(token),
                    ..Default::default()
                },
            )
            .await;

        let PermissionResult::Deny { message, .. } = result else {
            panic!("expected deny");
        };
        assert_eq!(message, "aborted before approval");
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_all_pending() {
        let (coordinator, _catalog) = coordinator();

        let decide = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .decide("s1", "tenant-1", "network_write", json!({}), DecideOptions::default())
                    .await
            })
        };

        while coordinator.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        coordinator.shutdown().await;

        let result = decide.await.unwrap();
        let PermissionResult::Deny { message, .. } = result else {
            panic!("expected deny");
        };
        assert_eq!(message, "service shutting down");

        // New requests are denied immediately once shutting down.
        let result = coordinator
            .decide("s2", "tenant-1", "network_write", json!({}), DecideOptions::default())
            .await;
        assert!(!result.is_allowed());
    }
}
