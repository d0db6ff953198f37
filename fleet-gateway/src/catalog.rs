//! Catalog store contract.
//!
//! The relational store holding devices, customer sessions, approval audit
//! rows, approval policies and device actions is an external collaborator;
//! this module specifies the slice of it the gateway consumes, plus an
//! in-memory implementation for tests and standalone runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub status: DeviceStatus,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionCommandStatus {
    PendingApproval,
    Approved,
    Rejected,
}

/// A command proposed within a customer session, awaiting operator review.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCommand {
    pub id: String,
    pub command_type: String,
    pub params: Value,
    pub status: SessionCommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerSessionRecord {
    pub id: String,
    pub tenant_id: String,
    pub device_id: String,
    pub status: SessionStatus,
    pub commands: Vec<SessionCommand>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Timeout,
}

/// Persisted audit of an approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRecord {
    pub approval_id: String,
    pub session_id: String,
    pub tenant_id: String,
    pub tool_name: String,
    pub tool_input: Value,
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Per-tenant, per-tool approval rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalPolicy {
    pub tenant_id: String,
    pub tool_name: String,
    pub auto_approve: bool,
    pub requires_approval: bool,
    pub risk_threshold: RiskLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceActionStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceActionRecord {
    pub id: String,
    pub device_id: String,
    pub tenant_id: String,
    pub action_type: String,
    pub params: Value,
    pub status: DeviceActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("record not found")]
    NotFound,
    #[error("concurrent update conflict")]
    Conflict,
    #[error("record already reached a terminal state")]
    AlreadyDecided,
    #[error("catalog store unavailable")]
    Unavailable {
        #[source]
        source: anyhow::Error,
    },
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>, CatalogError>;

    async fn devices_for_tenant(&self, tenant_id: &str) -> Result<Vec<DeviceRecord>, CatalogError>;

    async fn upsert_device(&self, record: DeviceRecord) -> Result<(), CatalogError>;

    async fn set_device_status(&self, device_id: &str, status: DeviceStatus) -> Result<(), CatalogError>;

    async fn create_customer_session(&self, record: CustomerSessionRecord) -> Result<(), CatalogError>;

    async fn get_customer_session(&self, session_id: &str)
    -> Result<Option<CustomerSessionRecord>, CatalogError>;

    async fn add_session_command(
        &self,
        session_id: &str,
        command: SessionCommand,
    ) -> Result<CustomerSessionRecord, CatalogError>;

    /// Applies an operator decision to a proposed session command.
    ///
    /// `expected_updated_at` is the optimistic-concurrency token: when
    /// present and stale, the write is rejected with `Conflict` and zero
    /// rows are touched.
    async fn decide_session_command(
        &self,
        session_id: &str,
        command_id: &str,
        approved: bool,
        reason: Option<String>,
        expected_updated_at: Option<OffsetDateTime>,
    ) -> Result<CustomerSessionRecord, CatalogError>;

    async fn insert_approval(&self, record: ApprovalRecord) -> Result<(), CatalogError>;

    /// Writes the terminal status of an approval request.
    ///
    /// Transitions are monotonic: once out of `Pending` a row never moves
    /// again, and a second write surfaces `AlreadyDecided`.
    async fn update_approval_status(
        &self,
        approval_id: &str,
        status: ApprovalStatus,
        reason: Option<String>,
    ) -> Result<(), CatalogError>;

    async fn get_approval(&self, approval_id: &str) -> Result<Option<ApprovalRecord>, CatalogError>;

    async fn load_policies(&self, tenant_id: &str) -> Result<Vec<ApprovalPolicy>, CatalogError>;

    async fn upsert_policy(&self, policy: ApprovalPolicy) -> Result<(), CatalogError>;

    async fn create_device_action(&self, record: DeviceActionRecord) -> Result<(), CatalogError>;

    async fn get_device_action(&self, action_id: &str) -> Result<Option<DeviceActionRecord>, CatalogError>;

    async fn decide_device_action(
        &self,
        action_id: &str,
        approved: bool,
        reason: Option<String>,
    ) -> Result<DeviceActionRecord, CatalogError>;

    /// Liveness probe used by the readiness endpoint.
    async fn ping(&self) -> Result<(), CatalogError>;
}

pub type DynCatalog = Arc<dyn CatalogStore>;

// ----- in-memory implementation ----- //

#[derive(Default)]
struct CatalogState {
    devices: HashMap<String, DeviceRecord>,
    sessions: HashMap<String, CustomerSessionRecord>,
    approvals: HashMap<String, ApprovalRecord>,
    policies: HashMap<String, Vec<ApprovalPolicy>>,
    device_actions: HashMap<String, DeviceActionRecord>,
}

#[derive(Default)]
pub struct MemoryCatalog {
    state: Mutex<CatalogState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>, CatalogError> {
        Ok(self.state.lock().devices.get(device_id).cloned())
    }

    async fn devices_for_tenant(&self, tenant_id: &str) -> Result<Vec<DeviceRecord>, CatalogError> {
        Ok(self
            .state
            .lock()
            .devices
            .values()
            .filter(|device| device.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn upsert_device(&self, record: DeviceRecord) -> Result<(), CatalogError> {
        self.state.lock().devices.insert(record.id.clone(), record);
        Ok(())
    }

    async fn set_device_status(&self, device_id: &str, status: DeviceStatus) -> Result<(), CatalogError> {
        let mut state = self.state.lock();
        let device = state.devices.get_mut(device_id).ok_or(CatalogError::NotFound)?;
        device.status = status;
        device.last_seen_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    async fn create_customer_session(&self, record: CustomerSessionRecord) -> Result<(), CatalogError> {
        self.state.lock().sessions.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_customer_session(
        &self,
        session_id: &str,
    ) -> Result<Option<CustomerSessionRecord>, CatalogError> {
        Ok(self.state.lock().sessions.get(session_id).cloned())
    }

    async fn add_session_command(
        &self,
        session_id: &str,
        command: SessionCommand,
    ) -> Result<CustomerSessionRecord, CatalogError> {
        let mut state = self.state.lock();
        let session = state.sessions.get_mut(session_id).ok_or(CatalogError::NotFound)?;
        session.commands.push(command);
        session.updated_at = OffsetDateTime::now_utc();
        Ok(session.clone())
    }

    async fn decide_session_command(
        &self,
        session_id: &str,
        command_id: &str,
        approved: bool,
        reason: Option<String>,
        expected_updated_at: Option<OffsetDateTime>,
    ) -> Result<CustomerSessionRecord, CatalogError> {
        let mut state = self.state.lock();
        let session = state.sessions.get_mut(session_id).ok_or(CatalogError::NotFound)?;

        if let Some(expected) = expected_updated_at {
            if session.updated_at != expected {
                return Err(CatalogError::Conflict);
            }
        }

        let command = session
            .commands
            .iter_mut()
            .find(|command| command.id == command_id)
            .ok_or(CatalogError::NotFound)?;

        if command.status != SessionCommandStatus::PendingApproval {
            return Err(CatalogError::AlreadyDecided);
        }

        command.status = if approved {
            SessionCommandStatus::Approved
        } else {
            SessionCommandStatus::Rejected
        };
        command.reason = reason;
        session.updated_at = OffsetDateTime::now_utc();

        Ok(session.clone())
    }

    async fn insert_approval(&self, record: ApprovalRecord) -> Result<(), CatalogError> {
        self.state.lock().approvals.insert(record.approval_id.clone(), record);
        Ok(())
    }

    async fn update_approval_status(
        &self,
        approval_id: &str,
        status: ApprovalStatus,
        reason: Option<String>,
    ) -> Result<(), CatalogError> {
        let mut state = self.state.lock();
        let record = state.approvals.get_mut(approval_id).ok_or(CatalogError::NotFound)?;

        if record.status != ApprovalStatus::Pending {
            return Err(CatalogError::AlreadyDecided);
        }

        record.status = status;
        record.decision_reason = reason;
        record.decided_at = Some(OffsetDateTime::now_utc());

        Ok(())
    }

    async fn get_approval(&self, approval_id: &str) -> Result<Option<ApprovalRecord>, CatalogError> {
        Ok(self.state.lock().approvals.get(approval_id).cloned())
    }

    async fn load_policies(&self, tenant_id: &str) -> Result<Vec<ApprovalPolicy>, CatalogError> {
        Ok(self.state.lock().policies.get(tenant_id).cloned().unwrap_or_default())
    }

    async fn upsert_policy(&self, policy: ApprovalPolicy) -> Result<(), CatalogError> {
        let mut state = self.state.lock();
        let policies = state.policies.entry(policy.tenant_id.clone()).or_default();
        policies.retain(|existing| existing.tool_name != policy.tool_name);
        policies.push(policy);
        Ok(())
    }

    async fn create_device_action(&self, record: DeviceActionRecord) -> Result<(), CatalogError> {
        self.state.lock().device_actions.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_device_action(&self, action_id: &str) -> Result<Option<DeviceActionRecord>, CatalogError> {
        Ok(self.state.lock().device_actions.get(action_id).cloned())
    }

    async fn decide_device_action(
        &self,
        action_id: &str,
        approved: bool,
        reason: Option<String>,
    ) -> Result<DeviceActionRecord, CatalogError> {
        let mut state = self.state.lock();
        let record = state.device_actions.get_mut(action_id).ok_or(CatalogError::NotFound)?;

        if record.status != DeviceActionStatus::Pending {
            return Err(CatalogError::AlreadyDecided);
        }

        record.status = if approved {
            DeviceActionStatus::Approved
        } else {
            DeviceActionStatus::Rejected
        };
        record.reason = reason;
        record.updated_at = OffsetDateTime::now_utc();

        Ok(record.clone())
    }

    async fn ping(&self) -> Result<(), CatalogError> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn session(id: &str) -> CustomerSessionRecord {
        let now = OffsetDateTime::now_utc();
        CustomerSessionRecord {
            id: id.to_owned(),
            tenant_id: "tenant-1".to_owned(),
            device_id: "d1".to_owned(),
            status: SessionStatus::Active,
            commands: vec![SessionCommand {
                id: "sc1".to_owned(),
                command_type: "restart_service".to_owned(),
                params: serde_json::json!({"service": "telemetry"}),
                status: SessionCommandStatus::PendingApproval,
                reason: None,
            }],
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn stale_updated_at_is_rejected() {
        let catalog = MemoryCatalog::new();
        catalog.create_customer_session(session("s1")).await.unwrap();

        let current = catalog.get_customer_session("s1").await.unwrap().unwrap();
        let stale = current.updated_at - time::Duration::seconds(5);

        let result = catalog
            .decide_session_command("s1", "sc1", true, None, Some(stale))
            .await;
        assert!(matches!(result, Err(CatalogError::Conflict)));

        let updated = catalog
            .decide_session_command("s1", "sc1", true, None, Some(current.updated_at))
            .await
            .unwrap();
        assert_eq!(updated.commands[0].status, SessionCommandStatus::Approved);
    }

    #[tokio::test]
    async fn approval_transitions_are_monotonic() {
        let catalog = MemoryCatalog::new();
        let now = OffsetDateTime::now_utc();

        catalog
            .insert_approval(ApprovalRecord {
                approval_id: "apr_1".to_owned(),
                session_id: "s1".to_owned(),
                tenant_id: "tenant-1".to_owned(),
                tool_name: "network_write".to_owned(),
                tool_input: serde_json::json!({}),
                status: ApprovalStatus::Pending,
                decision_reason: None,
                created_at: now,
                decided_at: None,
            })
            .await
            .unwrap();

        catalog
            .update_approval_status("apr_1", ApprovalStatus::Approved, None)
            .await
            .unwrap();

        let result = catalog
            .update_approval_status("apr_1", ApprovalStatus::Timeout, None)
            .await;
        assert!(matches!(result, Err(CatalogError::AlreadyDecided)));

        let record = catalog.get_approval("apr_1").await.unwrap().unwrap();
        assert_eq!(record.status, ApprovalStatus::Approved);
    }
}
