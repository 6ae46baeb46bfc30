//! Command dispatcher — central system → charge point Calls
//!
//! The single entry point for the management surface to send OCPP commands.
//! Resolves the target connection through the registry, registers the call
//! with that connection's pending tracker, writes the frame and awaits the
//! correlated reply. The dispatcher performs delivery and correlation only;
//! token verification happens in the management layer before it is invoked.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::{
    Action, ChangeConfigurationRequest, RemoteCommandStatus, RemoteStartTransactionRequest,
    RemoteStopTransactionRequest, ResetKind, ResetRequest, UnlockConnectorRequest,
};
use crate::session::{CallOutcome, SharedConnectionRegistry};
use crate::support::OcppFrame;

use super::engine::SharedTransactionEngine;

/// Command dispatch errors, surfaced to the management caller.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Charge point {0} is not connected")]
    ChargePointOffline(String),

    #[error("Failed to send command: {0}")]
    SendFailed(String),

    #[error("Command {action} timed out after {timeout_ms}ms")]
    CommandTimeout { action: String, timeout_ms: u64 },

    #[error("Connection lost while awaiting reply")]
    ConnectionLost,

    #[error("Charge point returned CallError {code}: {description}")]
    CallError { code: String, description: String },

    #[error("Invalid reply payload: {0}")]
    InvalidResponse(String),

    #[error("Command rejected: {0}")]
    Rejected(String),
}

pub struct CommandDispatcher {
    registry: SharedConnectionRegistry,
    engine: SharedTransactionEngine,
    default_timeout: Duration,
}

pub type SharedCommandDispatcher = Arc<CommandDispatcher>;

impl CommandDispatcher {
    pub fn new(
        registry: SharedConnectionRegistry,
        engine: SharedTransactionEngine,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            engine,
            default_timeout,
        }
    }

    pub fn shared(
        registry: SharedConnectionRegistry,
        engine: SharedTransactionEngine,
        default_timeout: Duration,
    ) -> SharedCommandDispatcher {
        Arc::new(Self::new(registry, engine, default_timeout))
    }

    /// Send a Call to a charge point and await the correlated reply.
    ///
    /// On expiry the pending entry is removed before `CommandTimeout` is
    /// returned; abandoned entries are additionally cleaned by the session
    /// task's sweep.
    pub async fn send_command(
        &self,
        charge_point_id: &str,
        action: Action,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, CommandError> {
        let connection = self
            .registry
            .lookup(charge_point_id)
            .ok_or_else(|| CommandError::ChargePointOffline(charge_point_id.to_string()))?;

        let timeout = timeout.unwrap_or(self.default_timeout);
        let (message_id, receiver) = connection.pending.register(action.name(), timeout);

        let frame = OcppFrame::Call {
            unique_id: message_id.clone(),
            action: action.name().to_string(),
            payload,
        };

        info!(
            charge_point_id,
            action = %action,
            message_id = message_id.as_str(),
            "Sending command"
        );

        if let Err(e) = connection.send(frame.serialize()) {
            connection.pending.cancel(&message_id);
            return Err(CommandError::SendFailed(e));
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(CallOutcome::Result(payload))) => Ok(payload),
            Ok(Ok(CallOutcome::Error { code, description })) => {
                Err(CommandError::CallError { code, description })
            }
            Ok(Ok(CallOutcome::Timeout)) => Err(CommandError::CommandTimeout {
                action: action.name().to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            Ok(Ok(CallOutcome::ConnectionLost)) | Ok(Err(_)) => Err(CommandError::ConnectionLost),
            Err(_elapsed) => {
                connection.pending.cancel(&message_id);
                warn!(
                    charge_point_id,
                    action = %action,
                    message_id = message_id.as_str(),
                    "Command timed out"
                );
                Err(CommandError::CommandTimeout {
                    action: action.name().to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    // ── Typed commands ─────────────────────────────────────

    pub async fn remote_start_transaction(
        &self,
        charge_point_id: &str,
        id_tag: &str,
        connector_id: Option<u32>,
    ) -> Result<RemoteCommandStatus, CommandError> {
        let payload = to_payload(RemoteStartTransactionRequest {
            id_tag: id_tag.to_string(),
            connector_id,
        })?;
        let reply = self
            .send_command(charge_point_id, Action::RemoteStartTransaction, payload, None)
            .await?;
        parse_command_status(&reply)
    }

    /// Request a remote stop. Rejected locally, without wire traffic, when
    /// the transaction is unknown, closed, or belongs to another station.
    pub async fn remote_stop_transaction(
        &self,
        charge_point_id: &str,
        transaction_id: i32,
    ) -> Result<RemoteCommandStatus, CommandError> {
        match self.engine.get_transaction(transaction_id) {
            Some(tx) if tx.charge_point_id == charge_point_id && tx.is_active() => {}
            Some(tx) if tx.charge_point_id != charge_point_id => {
                return Err(CommandError::Rejected(format!(
                    "Transaction {} belongs to {}",
                    transaction_id, tx.charge_point_id
                )));
            }
            Some(_) => {
                return Err(CommandError::Rejected(format!(
                    "Transaction {} is not active",
                    transaction_id
                )));
            }
            None => {
                return Err(CommandError::Rejected(format!(
                    "Transaction {} is unknown",
                    transaction_id
                )));
            }
        }

        let payload = to_payload(RemoteStopTransactionRequest { transaction_id })?;
        let reply = self
            .send_command(charge_point_id, Action::RemoteStopTransaction, payload, None)
            .await?;
        parse_command_status(&reply)
    }

    pub async fn reset(
        &self,
        charge_point_id: &str,
        kind: ResetKind,
    ) -> Result<RemoteCommandStatus, CommandError> {
        let payload = to_payload(ResetRequest { kind })?;
        let reply = self
            .send_command(charge_point_id, Action::Reset, payload, None)
            .await?;
        parse_command_status(&reply)
    }

    /// Returns the raw unlock status string (`Unlocked`, `UnlockFailed`,
    /// `NotSupported`).
    pub async fn unlock_connector(
        &self,
        charge_point_id: &str,
        connector_id: u32,
    ) -> Result<String, CommandError> {
        let payload = to_payload(UnlockConnectorRequest { connector_id })?;
        let reply = self
            .send_command(charge_point_id, Action::UnlockConnector, payload, None)
            .await?;
        parse_status_string(&reply)
    }

    /// Returns the raw configuration status string (`Accepted`, `Rejected`,
    /// `RebootRequired`, `NotSupported`).
    pub async fn change_configuration(
        &self,
        charge_point_id: &str,
        key: &str,
        value: &str,
    ) -> Result<String, CommandError> {
        let payload = to_payload(ChangeConfigurationRequest {
            key: key.to_string(),
            value: value.to_string(),
        })?;
        let reply = self
            .send_command(charge_point_id, Action::ChangeConfiguration, payload, None)
            .await?;
        parse_status_string(&reply)
    }
}

fn to_payload<T: serde::Serialize>(request: T) -> Result<Value, CommandError> {
    serde_json::to_value(request).map_err(|e| CommandError::SendFailed(e.to_string()))
}

fn parse_status_string(reply: &Value) -> Result<String, CommandError> {
    reply["status"]
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| CommandError::InvalidResponse("missing 'status' field".to_string()))
}

fn parse_command_status(reply: &Value) -> Result<RemoteCommandStatus, CommandError> {
    match parse_status_string(reply)?.as_str() {
        "Accepted" => Ok(RemoteCommandStatus::Accepted),
        "Rejected" => Ok(RemoteCommandStatus::Rejected),
        other => Err(CommandError::InvalidResponse(format!(
            "unexpected status '{}'",
            other
        ))),
    }
}
