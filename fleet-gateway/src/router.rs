//! Session router: per-connection protocol dispatcher binding an
//! authenticated principal to incoming frames.
//!
//! Frames are JSON objects with a required `type` and an optional
//! `requestId`; server frames mirror the request's correlation id or carry
//! a fresh one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::extract::ws::{Message, WebSocket};
use fleet_gateway_task::ChildTask;
use futures::StreamExt as _;
use serde_json::Value;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::FgwState;
use crate::approval::{ApprovalDecision, ResolveOptions};
use crate::broker::{self, Broker as _, MultiSubscription};
use crate::catalog::{CatalogError, CatalogStore as _, DeviceStatus};
use crate::connection::{
    CLOSE_POLICY_VIOLATION, ConnectionId, ConnectionKind, ConnectionMetadata, MetadataPatch,
    SessionTransport,
};
use crate::queue::{CommandResult, DEFAULT_VISIBILITY_MS, QueueError};
use crate::token::{CustomerClaims, DeviceSessionClaims};
use crate::trace::CorrelationId;
use crate::ws::WsTransport;

/// Browser clients may connect first and authenticate with a late `auth`
/// frame; past this window the connection is closed with 1008.
const LATE_AUTH_TIMEOUT: Duration = Duration::from_secs(30);

fn frame_correlation(frame: &Value) -> CorrelationId {
    frame
        .get("requestId")
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .map(CorrelationId::from_uuid)
        .unwrap_or_default()
}

fn error_frame(error: &str, request_id: CorrelationId) -> Value {
    json!({
        "type": "error",
        "error": error,
        "requestId": request_id,
    })
}

fn queue_error_frame(error: &QueueError, request_id: CorrelationId) -> Value {
    let code = match error {
        QueueError::NotFound => "NOT_FOUND",
        QueueError::InvalidClaim => "INVALID_CLAIM",
        QueueError::AlreadyCompleted => "ALREADY_COMPLETED",
        QueueError::InvalidLimit(_) | QueueError::InvalidVisibility(_) | QueueError::InvalidExtension(_) => {
            "INVALID_REQUEST"
        }
        QueueError::Broker { .. } => "INTERNAL_ERROR",
    };

    json!({
        "type": "error",
        "error": code,
        "message": error.to_string(),
        "requestId": request_id,
    })
}

// ----- device sessions ----- //

#[derive(TypedBuilder)]
pub struct DeviceSessionClient {
    state: FgwState,
    ws: WebSocket,
    claims: DeviceSessionClaims,
}

impl DeviceSessionClient {
    #[instrument("device_session", skip(self), fields(device.id = %self.claims.device_id))]
    pub async fn run(self) -> anyhow::Result<()> {
        let Self { state, ws, claims } = self;

        let (sink, mut stream) = ws.split();
        let transport = Arc::new(WsTransport::new(sink));
        let connection_id = Uuid::new_v4();

        state.connections.add(
            connection_id,
            transport,
            ConnectionKind::Device,
            ConnectionMetadata {
                tenant_id: Some(claims.tenant_id.clone()),
                principal_id: Some(claims.device_id.clone()),
                device_id: Some(claims.device_id.clone()),
                ..Default::default()
            },
        );

        if let Err(error) = state
            .catalog
            .set_device_status(&claims.device_id, DeviceStatus::Online)
            .await
        {
            warn!(%error, "Couldn't mark device online");
        }

        let mut control = state
            .broker
            .subscribe(&broker::device_control_channel(&claims.device_id))
            .await
            .context("couldn't subscribe to device control channel")?;

        let mut shutdown_signal = state.shutdown_signal.clone();

        loop {
            tokio::select! {
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reply) = handle_device_frame(&state, &claims, connection_id, text.as_str()).await {
                                let _ = state.connections.send(connection_id, &reply).await;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => state.connections.mark_alive(connection_id),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            debug!(%error, "WebSocket receive failed");
                            break;
                        }
                    }
                }
                notification = control.recv() => {
                    match notification {
                        Some(value) => {
                            let _ = state.connections.send(connection_id, &value).await;
                        }
                        None => break,
                    }
                }
                () = shutdown_signal.wait() => break,
            }
        }

        control.unsubscribe();
        state.connections.remove(connection_id);

        if let Err(error) = state
            .catalog
            .set_device_status(&claims.device_id, DeviceStatus::Offline)
            .await
        {
            warn!(%error, "Couldn't mark device offline");
        }

        debug!("Device session ended");

        Ok(())
    }
}

pub(crate) async fn handle_device_frame(
    state: &FgwState,
    claims: &DeviceSessionClaims,
    connection_id: ConnectionId,
    text: &str,
) -> Option<Value> {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        return Some(json!({"type": "error", "error": "Invalid message format"}));
    };

    let request_id = frame_correlation(&frame);
    let frame_type = frame.get("type").and_then(Value::as_str).unwrap_or_default();

    match frame_type {
        "claim_command" => {
            let limit = frame
                .get("limit")
                .and_then(Value::as_u64)
                .map(|raw| usize::try_from(raw).unwrap_or(usize::MAX))
                .unwrap_or(1);
            let visibility_ms = frame
                .get("visibilityTimeout")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_VISIBILITY_MS);

            match state.queue.claim(&claims.device_id, limit, visibility_ms).await {
                Ok(claimed) => {
                    let commands: Vec<Value> = claimed
                        .into_iter()
                        .map(|claim| {
                            json!({
                                "command": claim.record,
                                "claimToken": claim.claim_token,
                            })
                        })
                        .collect();

                    Some(json!({
                        "type": "commands",
                        "commands": commands,
                        "requestId": request_id,
                    }))
                }
                Err(error) => Some(queue_error_frame(&error, request_id)),
            }
        }
        "command_result" => {
            let (Some(command_id), Some(claim_token)) = (
                frame.get("commandId").and_then(Value::as_str),
                frame.get("claimToken").and_then(Value::as_str),
            ) else {
                return Some(error_frame("Invalid message format", request_id));
            };

            let result: CommandResult = match frame.get("result").cloned().map(serde_json::from_value) {
                Some(Ok(result)) => result,
                _ => return Some(error_frame("Invalid message format", request_id)),
            };

            match state
                .queue
                .submit_result(command_id, claim_token, &claims.device_id, result, request_id)
                .await
            {
                Ok(record) => Some(json!({
                    "type": "result_ack",
                    "commandId": record.id,
                    "status": record.status,
                    "requestId": request_id,
                })),
                Err(error) => Some(queue_error_frame(&error, request_id)),
            }
        }
        "heartbeat" => {
            state.connections.mark_alive(connection_id);

            if let Err(error) = state
                .catalog
                .set_device_status(&claims.device_id, DeviceStatus::Online)
                .await
            {
                debug!(%error, "Couldn't refresh device liveness");
            }

            Some(json!({"type": "heartbeat_ack", "requestId": request_id}))
        }
        "status_update" => {
            let status = frame.get("status").cloned().unwrap_or(Value::Null);
            let metrics = frame.get("metrics").map(crate::sanitize::sanitize_value);

            let event = json!({
                "type": "status_update",
                "deviceId": claims.device_id,
                "status": crate::sanitize::sanitize_value(&status),
                "metrics": metrics,
                "requestId": request_id,
            });

            if let Err(error) = state
                .broker
                .publish(&broker::device_updates_channel(&claims.device_id), event)
                .await
            {
                warn!(%error, "Couldn't publish device status update");
            }

            Some(json!({"type": "status_ack", "requestId": request_id}))
        }
        _ => Some(error_frame("unknown", request_id)),
    }
}

// ----- customer sessions ----- //

#[derive(TypedBuilder)]
pub struct CustomerSessionClient {
    state: FgwState,
    ws: WebSocket,
    #[builder(default)]
    claims: Option<CustomerClaims>,
    #[builder(default)]
    subprotocol: Option<String>,
}

enum FrameOutcome {
    Reply(Value),
    ReplyAndClose(Value),
}

impl CustomerSessionClient {
    #[instrument("customer_session", skip_all)]
    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            state,
            ws,
            claims,
            subprotocol,
        } = self;

        let (sink, mut stream) = ws.split();
        let transport = Arc::new(WsTransport::new(sink));
        let connection_id = Uuid::new_v4();

        state.connections.add(
            connection_id,
            Arc::clone(&transport) as Arc<dyn SessionTransport>,
            ConnectionKind::Customer,
            ConnectionMetadata {
                subprotocol,
                ..Default::default()
            },
        );

        let mut session = CustomerSession {
            state: state.clone(),
            connection_id,
            claims: None,
            updates: None,
            update_channels: Vec::new(),
            chat_tasks: HashMap::new(),
        };

        if let Some(claims) = claims {
            session.complete_auth(claims).await;
        }

        let auth_deadline = tokio::time::sleep(LATE_AUTH_TIMEOUT);
        tokio::pin!(auth_deadline);

        let mut shutdown_signal = state.shutdown_signal.clone();

        loop {
            tokio::select! {
                () = &mut auth_deadline, if session.claims.is_none() => {
                    debug!("Late authentication window elapsed");
                    transport.close(CLOSE_POLICY_VIOLATION, "authentication required").await;
                    break;
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match session.handle_frame(text.as_str()).await {
                                FrameOutcome::Reply(reply) => {
                                    let _ = state.connections.send(connection_id, &reply).await;
                                }
                                FrameOutcome::ReplyAndClose(reply) => {
                                    let _ = state.connections.send(connection_id, &reply).await;
                                    transport.close(CLOSE_POLICY_VIOLATION, "authentication failed").await;
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Pong(_))) => state.connections.mark_alive(connection_id),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            debug!(%error, "WebSocket receive failed");
                            break;
                        }
                    }
                }
                update = recv_update(session.updates.as_mut()) => {
                    match update {
                        Some((_channel, value)) => {
                            let _ = state.connections.send(connection_id, &value).await;
                        }
                        None => break,
                    }
                }
                () = shutdown_signal.wait() => break,
            }
        }

        if let Some(updates) = session.updates.take() {
            updates.disconnect();
        }
        session.chat_tasks.clear();
        state.connections.remove(connection_id);

        debug!("Customer session ended");

        Ok(())
    }
}

async fn recv_update(updates: Option<&mut MultiSubscription>) -> Option<(String, Value)> {
    match updates {
        Some(updates) => updates.recv().await,
        None => std::future::pending().await,
    }
}

struct CustomerSession {
    state: FgwState,
    connection_id: ConnectionId,
    claims: Option<CustomerClaims>,
    updates: Option<MultiSubscription>,
    update_channels: Vec<String>,
    chat_tasks: HashMap<String, ChildTask<()>>,
}

impl CustomerSession {
    async fn complete_auth(&mut self, claims: CustomerClaims) {
        self.state.connections.update_metadata(
            self.connection_id,
            MetadataPatch {
                tenant_id: Some(claims.tid.clone()),
                principal_id: Some(claims.sub.clone()),
                kind: Some(claims.scope.connection_kind()),
                ..Default::default()
            },
        );

        let devices = match self.state.catalog.devices_for_tenant(&claims.tid).await {
            Ok(devices) => devices,
            Err(error) => {
                warn!(%error, "Couldn't list tenant devices for update subscriptions");
                Vec::new()
            }
        };

        let channels: Vec<String> = devices
            .iter()
            .map(|device| broker::device_updates_channel(&device.id))
            .collect();

        self.resubscribe_updates(channels).await;

        info!(tenant.id = %claims.tid, principal = %claims.sub, "Customer session authenticated");

        self.claims = Some(claims);
    }

    /// One multiplexed subscription covers every followed device; changing
    /// the set swaps the whole subscription at once.
    async fn resubscribe_updates(&mut self, channels: Vec<String>) {
        if let Some(previous) = self.updates.take() {
            previous.disconnect();
        }

        if channels.is_empty() {
            self.update_channels = Vec::new();
            return;
        }

        match self.state.broker.subscribe_many(channels.clone()).await {
            Ok(subscription) => {
                self.updates = Some(subscription);
                self.update_channels = channels;
            }
            Err(error) => {
                warn!(%error, "Couldn't subscribe to device update channels");
                self.update_channels = Vec::new();
            }
        }
    }

    async fn handle_frame(&mut self, text: &str) -> FrameOutcome {
        let Ok(frame) = serde_json::from_str::<Value>(text) else {
            return FrameOutcome::Reply(json!({"type": "error", "error": "Invalid message format"}));
        };

        let request_id = frame_correlation(&frame);
        let frame_type = frame.get("type").and_then(Value::as_str).unwrap_or_default();

        let Some(claims) = self.claims.clone() else {
            // Before authentication only `auth` and `ping` are admitted.
            return match frame_type {
                "auth" => self.handle_auth(&frame, request_id).await,
                "ping" => FrameOutcome::Reply(json!({"type": "pong", "requestId": request_id})),
                _ => FrameOutcome::Reply(error_frame("Unauthorized", request_id)),
            };
        };

        match frame_type {
            "auth" => FrameOutcome::Reply(json!({"type": "auth_ok", "requestId": request_id})),
            "ping" => FrameOutcome::Reply(json!({"type": "pong", "requestId": request_id})),
            "get_system_info" => {
                let conf = self.state.conf_handle.get_conf();
                FrameOutcome::Reply(json!({
                    "type": "system_info",
                    "hostname": conf.hostname,
                    "version": env!("CARGO_PKG_VERSION"),
                    "connections": self.state.connections.stats(),
                    // Devices verify script packages against this key.
                    "signingPublicKey": self.state.signer.public_key_base64().ok(),
                    "requestId": request_id,
                }))
            }
            "send_command" => self.handle_send_command(&claims, &frame, request_id).await,
            "approve_session" => self.handle_approve_session(&claims, &frame, request_id).await,
            "approval_response" => self.handle_approval_response(&claims, &frame, request_id).await,
            "join_rooms" => self.handle_join_rooms(&claims, &frame, request_id).await,
            "subscribe" => self.handle_subscribe(&claims, &frame, request_id).await,
            "unsubscribe" => {
                let channel = frame.get("channel").and_then(Value::as_str).unwrap_or_default();
                // Dropping the pump task tears the subscription down.
                self.chat_tasks.remove(channel);
                FrameOutcome::Reply(json!({"type": "unsubscribed", "channel": channel, "requestId": request_id}))
            }
            _ => FrameOutcome::Reply(error_frame("unknown", request_id)),
        }
    }

    async fn handle_auth(&mut self, frame: &Value, request_id: CorrelationId) -> FrameOutcome {
        let Some(token) = frame.get("token").and_then(Value::as_str) else {
            return FrameOutcome::Reply(error_frame("Invalid message format", request_id));
        };

        let conf = self.state.conf_handle.get_conf();

        let claims = if conf.debug.disable_token_validation {
            crate::token::unsafe_debug::dangerous_validate_token(token)
        } else {
            match conf.issuer_public_key.as_ref() {
                Some(issuer_key) => crate::token::validate_customer_token(token, issuer_key),
                None => {
                    error!("Issuer public key is not configured");
                    return FrameOutcome::ReplyAndClose(error_frame("Unauthorized", request_id));
                }
            }
        };

        match claims {
            Ok(claims) => {
                self.complete_auth(claims).await;
                FrameOutcome::Reply(json!({"type": "auth_ok", "requestId": request_id}))
            }
            Err(error) => {
                debug!(%error, "Late authentication failed");
                FrameOutcome::ReplyAndClose(error_frame("Unauthorized", request_id))
            }
        }
    }

    async fn handle_send_command(
        &mut self,
        claims: &CustomerClaims,
        frame: &Value,
        request_id: CorrelationId,
    ) -> FrameOutcome {
        let (Some(device_id), Some(command_type)) = (
            frame.get("deviceId").and_then(Value::as_str),
            frame.get("commandType").and_then(Value::as_str),
        ) else {
            return FrameOutcome::Reply(error_frame("Invalid message format", request_id));
        };

        let params = frame.get("params").cloned().unwrap_or_else(|| json!({}));
        let priority = frame.get("priority").and_then(Value::as_i64).unwrap_or(5);

        match self.state.catalog.get_device(device_id).await {
            Ok(Some(device)) if device.tenant_id == claims.tid => {
                match self
                    .state
                    .queue
                    .enqueue(device_id, &claims.tid, command_type, params, priority, request_id)
                    .await
                {
                    Ok(record) => FrameOutcome::Reply(json!({
                        "type": "command_queued",
                        "commandId": record.id,
                        "requestId": request_id,
                    })),
                    Err(error) => {
                        warn!(%error, "Couldn't enqueue command");
                        FrameOutcome::Reply(queue_error_frame(&error, request_id))
                    }
                }
            }
            // Foreign or unknown devices get the same answer.
            Ok(_) => FrameOutcome::Reply(error_frame("Unauthorized", request_id)),
            Err(error) => {
                warn!(%error, "Device lookup failed");
                FrameOutcome::Reply(error_frame("INTERNAL_ERROR", request_id))
            }
        }
    }

    async fn handle_approve_session(
        &mut self,
        claims: &CustomerClaims,
        frame: &Value,
        request_id: CorrelationId,
    ) -> FrameOutcome {
        let (Some(session_id), Some(command_id), Some(approved)) = (
            frame.get("sessionId").and_then(Value::as_str),
            frame.get("commandId").and_then(Value::as_str),
            frame.get("approved").and_then(Value::as_bool),
        ) else {
            return FrameOutcome::Reply(error_frame("Invalid message format", request_id));
        };

        let reason = frame
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let session = match self.state.catalog.get_customer_session(session_id).await {
            Ok(Some(session)) if session.tenant_id == claims.tid => session,
            Ok(_) => return FrameOutcome::Reply(error_frame("Unauthorized", request_id)),
            Err(error) => {
                warn!(%error, "Session lookup failed");
                return FrameOutcome::Reply(error_frame("INTERNAL_ERROR", request_id));
            }
        };

        match self
            .state
            .catalog
            .decide_session_command(session_id, command_id, approved, reason, None)
            .await
        {
            Ok(updated) => {
                if approved {
                    if let Some(command) = updated.commands.iter().find(|command| command.id == command_id) {
                        if let Err(error) = self
                            .state
                            .queue
                            .enqueue(
                                &session.device_id,
                                &claims.tid,
                                &command.command_type,
                                command.params.clone(),
                                5,
                                request_id,
                            )
                            .await
                        {
                            warn!(%error, "Couldn't dispatch approved session command");
                        }
                    }
                }

                FrameOutcome::Reply(json!({
                    "type": "session_approval",
                    "sessionId": session_id,
                    "commandId": command_id,
                    "approved": approved,
                    "requestId": request_id,
                }))
            }
            Err(CatalogError::NotFound) => FrameOutcome::Reply(error_frame("NOT_FOUND", request_id)),
            Err(CatalogError::AlreadyDecided) => FrameOutcome::Reply(error_frame("ALREADY_DECIDED", request_id)),
            Err(error) => {
                warn!(%error, "Session command decision failed");
                FrameOutcome::Reply(error_frame("INTERNAL_ERROR", request_id))
            }
        }
    }

    async fn handle_approval_response(
        &mut self,
        claims: &CustomerClaims,
        frame: &Value,
        request_id: CorrelationId,
    ) -> FrameOutcome {
        let Some(approval_id) = frame.get("approvalId").and_then(Value::as_str) else {
            return FrameOutcome::Reply(error_frame("Invalid message format", request_id));
        };

        let decision: ApprovalDecision = match frame.get("decision").cloned().map(serde_json::from_value) {
            Some(Ok(decision)) => decision,
            _ => return FrameOutcome::Reply(error_frame("Invalid message format", request_id)),
        };

        // Tenant isolation: an operator only resolves approvals of their
        // own tenant, and foreign ids read as nonexistent.
        let owned = self
            .state
            .approvals
            .pending_for_tenant(&claims.tid)
            .iter()
            .any(|pending| pending.approval_id == approval_id);

        if !owned {
            return FrameOutcome::Reply(error_frame("NOT_FOUND", request_id));
        }

        let options = ResolveOptions {
            reason: frame.get("reason").and_then(Value::as_str).map(str::to_owned),
            modified_input: frame.get("modifiedInput").cloned(),
            interrupt: frame.get("interrupt").and_then(Value::as_bool).unwrap_or(false),
        };

        match self.state.approvals.resolve(approval_id, decision, options).await {
            Ok(()) => FrameOutcome::Reply(json!({
                "type": "approval_ack",
                "approvalId": approval_id,
                "requestId": request_id,
            })),
            Err(_) => FrameOutcome::Reply(error_frame("NOT_FOUND", request_id)),
        }
    }

    async fn handle_join_rooms(
        &mut self,
        claims: &CustomerClaims,
        frame: &Value,
        request_id: CorrelationId,
    ) -> FrameOutcome {
        let Some(rooms) = frame.get("rooms").and_then(Value::as_array) else {
            return FrameOutcome::Reply(error_frame("Invalid message format", request_id));
        };

        let requested: Vec<&str> = rooms.iter().filter_map(Value::as_str).collect();

        let owned = match self.state.catalog.devices_for_tenant(&claims.tid).await {
            Ok(devices) => devices,
            Err(error) => {
                warn!(%error, "Couldn't list tenant devices");
                return FrameOutcome::Reply(error_frame("INTERNAL_ERROR", request_id));
            }
        };

        let accepted: Vec<&str> = requested
            .iter()
            .copied()
            .filter(|room| owned.iter().any(|device| device.id == *room))
            .collect();

        let mut channels = self.update_channels.clone();
        for room in &accepted {
            let channel = broker::device_updates_channel(room);
            if !channels.contains(&channel) {
                channels.push(channel);
            }
        }

        self.resubscribe_updates(channels).await;

        FrameOutcome::Reply(json!({
            "type": "rooms_joined",
            "rooms": accepted,
            "requestId": request_id,
        }))
    }

    async fn handle_subscribe(
        &mut self,
        claims: &CustomerClaims,
        frame: &Value,
        request_id: CorrelationId,
    ) -> FrameOutcome {
        let Some(channel) = frame.get("channel").and_then(Value::as_str) else {
            return FrameOutcome::Reply(error_frame("Invalid message format", request_id));
        };

        // Chat channels only, and only for sessions the tenant owns.
        let Some(session_id) = channel.strip_prefix("chat:") else {
            return FrameOutcome::Reply(error_frame("Unauthorized", request_id));
        };

        match self.state.catalog.get_customer_session(session_id).await {
            Ok(Some(session)) if session.tenant_id == claims.tid => {}
            Ok(_) => return FrameOutcome::Reply(error_frame("Unauthorized", request_id)),
            Err(error) => {
                warn!(%error, "Session lookup failed");
                return FrameOutcome::Reply(error_frame("INTERNAL_ERROR", request_id));
            }
        }

        if !self.chat_tasks.contains_key(channel) {
            let mut subscription = match self.state.broker.subscribe(channel).await {
                Ok(subscription) => subscription,
                Err(error) => {
                    warn!(%error, "Chat subscription failed");
                    return FrameOutcome::Reply(error_frame("INTERNAL_ERROR", request_id));
                }
            };

            let connections = self.state.connections.clone();
            let connection_id = self.connection_id;
            let channel_name = channel.to_owned();

            let pump = ChildTask::spawn(async move {
                while let Some(value) = subscription.recv().await {
                    let frame = json!({
                        "type": "chat_message",
                        "channel": channel_name,
                        "payload": value,
                    });
                    let _ = connections.send(connection_id, &frame).await;
                }
            });

            self.chat_tasks.insert(channel.to_owned(), pump);
        }

        FrameOutcome::Reply(json!({
            "type": "subscribed",
            "channel": channel,
            "requestId": request_id,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn frame_correlation_reflects_request_id() {
        let id = Uuid::new_v4();
        let frame = json!({"type": "ping", "requestId": id.to_string()});

        assert_eq!(frame_correlation(&frame).as_uuid(), id);
    }

    #[test]
    fn frame_correlation_mints_when_absent() {
        let frame = json!({"type": "ping"});
        let a = frame_correlation(&frame);
        let b = frame_correlation(&frame);

        assert_ne!(a, b);
    }

    #[test]
    fn queue_errors_map_to_stable_codes() {
        let id = CorrelationId::new();

        let frame = queue_error_frame(&QueueError::InvalidClaim, id);
        assert_eq!(frame["error"], "INVALID_CLAIM");

        let frame = queue_error_frame(&QueueError::NotFound, id);
        assert_eq!(frame["error"], "NOT_FOUND");

        let frame = queue_error_frame(&QueueError::AlreadyCompleted, id);
        assert_eq!(frame["error"], "ALREADY_COMPLETED");

        let frame = queue_error_frame(&QueueError::InvalidLimit(11), id);
        assert_eq!(frame["error"], "INVALID_REQUEST");
    }
}
