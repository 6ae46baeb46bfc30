//! Session actor — one charge point's live conversation
//!
//! Processes the frames of a single connection strictly in arrival order.
//! Every inbound Call gets exactly one reply (CallResult or CallError);
//! inbound CallResult/CallError frames resolve the connection's pending-call
//! tracker. The surrounding WebSocket task (infrastructure::server) owns the
//! socket, the sweep timer and disconnect cleanup.

use serde_json::Value;
use tracing::{error, warn};

use crate::domain::Action;
use crate::session::Connection;
use crate::support::OcppFrame;

use super::engine::SharedTransactionEngine;

/// OCPP-J CallError codes used for protocol-level failures.
const ERR_NOT_IMPLEMENTED: &str = "NotImplemented";
const ERR_FORMATION_VIOLATION: &str = "FormationViolation";
const ERR_PROTOCOL_ERROR: &str = "ProtocolError";
const ERR_INTERNAL: &str = "InternalError";

/// Handles the message flow of exactly one connection.
pub struct SessionActor {
    charge_point_id: String,
    connection: Connection,
    engine: SharedTransactionEngine,
}

impl SessionActor {
    pub fn new(connection: Connection, engine: SharedTransactionEngine) -> Self {
        Self {
            charge_point_id: connection.charge_point_id.clone(),
            connection,
            engine,
        }
    }

    /// Process one inbound text frame. Returns the serialized reply frame
    /// for a Call, `None` otherwise.
    pub async fn handle(&self, text: &str) -> Option<String> {
        let frame = match OcppFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    charge_point_id = self.charge_point_id.as_str(),
                    error = %e,
                    "Dropping malformed frame"
                );
                // Reply with a CallError when the message ID is still
                // recoverable; otherwise there is nothing to correlate.
                return recover_unique_id(text).map(|unique_id| {
                    OcppFrame::error_response(unique_id, ERR_PROTOCOL_ERROR, e.to_string())
                        .serialize()
                });
            }
        };

        match frame {
            OcppFrame::Call {
                unique_id,
                action,
                payload,
            } => Some(self.handle_call(unique_id, &action, payload).await),
            OcppFrame::CallResult { unique_id, payload } => {
                self.connection.pending.resolve(&unique_id, payload);
                None
            }
            OcppFrame::CallError {
                unique_id,
                error_code,
                error_description,
                ..
            } => {
                self.connection
                    .pending
                    .resolve_error(&unique_id, &error_code, &error_description);
                None
            }
        }
    }

    async fn handle_call(&self, unique_id: String, action: &str, payload: Value) -> String {
        let Some(action) = Action::from_name(action) else {
            warn!(
                charge_point_id = self.charge_point_id.as_str(),
                action, "Call with unknown action"
            );
            return OcppFrame::error_response(
                unique_id,
                ERR_NOT_IMPLEMENTED,
                format!("Action '{}' is not supported", action),
            )
            .serialize();
        };

        match self.dispatch(action, payload).await {
            Ok(result) => OcppFrame::result_response(unique_id, result).serialize(),
            Err(reply_error) => {
                OcppFrame::error_response(unique_id, reply_error.code, reply_error.description)
                    .serialize()
            }
        }
    }

    /// Route a decoded Call to the engine. Domain rejections travel inside
    /// the CallResult payload; only protocol/internal failures become
    /// CallErrors.
    async fn dispatch(&self, action: Action, payload: Value) -> Result<Value, ReplyError> {
        let cp = self.charge_point_id.as_str();
        match action {
            Action::BootNotification => {
                let request = decode(action, payload)?;
                encode(self.engine.boot_notification(cp, request).await)
            }
            Action::Authorize => {
                let request = decode(action, payload)?;
                encode(self.engine.authorize(cp, request).await)
            }
            Action::StartTransaction => {
                let request = decode(action, payload)?;
                encode(self.engine.start_transaction(cp, request).await)
            }
            Action::StopTransaction => {
                let request = decode(action, payload)?;
                encode(self.engine.stop_transaction(cp, request).await)
            }
            Action::MeterValues => {
                let request = decode(action, payload)?;
                self.engine.meter_values(cp, request).await;
                Ok(Value::Object(Default::default()))
            }
            Action::StatusNotification => {
                let request = decode(action, payload)?;
                self.engine.status_notification(cp, request).await;
                Ok(Value::Object(Default::default()))
            }
            Action::Heartbeat => encode(self.engine.heartbeat(cp)),
            Action::SecurityEventNotification => {
                let request = decode(action, payload)?;
                self.engine.security_event_notification(cp, request);
                Ok(Value::Object(Default::default()))
            }
            // Remote commands originate here; a charge point calling them
            // is a protocol violation.
            Action::RemoteStartTransaction
            | Action::RemoteStopTransaction
            | Action::Reset
            | Action::UnlockConnector
            | Action::ChangeConfiguration => Err(ReplyError {
                code: ERR_NOT_IMPLEMENTED,
                description: format!("{} is not accepted from a charge point", action),
            }),
        }
    }
}

struct ReplyError {
    code: &'static str,
    description: String,
}

fn decode<T: serde::de::DeserializeOwned>(action: Action, payload: Value) -> Result<T, ReplyError> {
    serde_json::from_value(payload).map_err(|e| ReplyError {
        code: ERR_FORMATION_VIOLATION,
        description: format!("Invalid {} payload: {}", action, e),
    })
}

fn encode<T: serde::Serialize>(response: T) -> Result<Value, ReplyError> {
    serde_json::to_value(response).map_err(|e| {
        error!(error = %e, "Failed to serialize reply payload");
        ReplyError {
            code: ERR_INTERNAL,
            description: "Reply serialization failed".to_string(),
        }
    })
}

/// Best-effort extraction of the unique ID from an unparseable frame, so a
/// protocol error can still be correlated by the station.
fn recover_unique_id(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .as_array()?
        .get(1)?
        .as_str()
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::engine::{EngineConfig, TransactionEngine};
    use crate::domain::OcppVersion;
    use crate::infrastructure::memory::{MemoryAuthProvider, MemoryPersistence};
    use crate::session::SessionMessage;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn actor() -> (SessionActor, Connection, mpsc::UnboundedReceiver<SessionMessage>) {
        let engine = TransactionEngine::shared(
            Arc::new(MemoryPersistence::new()),
            Arc::new(MemoryAuthProvider::with_tags(&["ABC"])),
            EngineConfig::default(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Connection::new("CP-1", tx, OcppVersion::V16);
        (SessionActor::new(connection.clone(), engine), connection, rx)
    }

    fn parse_reply(reply: &str) -> OcppFrame {
        OcppFrame::parse(reply).unwrap()
    }

    #[tokio::test]
    async fn heartbeat_call_gets_exactly_one_call_result() {
        let (actor, _conn, _rx) = actor();
        let reply = actor.handle(r#"[2,"m1","Heartbeat",{}]"#).await.unwrap();

        match parse_reply(&reply) {
            OcppFrame::CallResult { unique_id, payload } => {
                assert_eq!(unique_id, "m1");
                assert!(payload.get("currentTime").is_some());
            }
            other => panic!("expected CallResult, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_action_answers_not_implemented() {
        let (actor, _conn, _rx) = actor();
        let reply = actor
            .handle(r#"[2,"m2","DataTransfer",{"vendorId":"X"}]"#)
            .await
            .unwrap();

        match parse_reply(&reply) {
            OcppFrame::CallError {
                unique_id,
                error_code,
                ..
            } => {
                assert_eq!(unique_id, "m2");
                assert_eq!(error_code, "NotImplemented");
            }
            other => panic!("expected CallError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn security_event_is_acknowledged() {
        let (actor, _conn, _rx) = actor();
        let reply = actor
            .handle(r#"[2,"m5","SecurityEventNotification",{"type":"SettingSystemTime","timestamp":"2024-01-01T00:00:00Z"}]"#)
            .await
            .unwrap();

        match parse_reply(&reply) {
            OcppFrame::CallResult { unique_id, payload } => {
                assert_eq!(unique_id, "m5");
                assert!(payload.as_object().unwrap().is_empty());
            }
            other => panic!("expected CallResult, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn invalid_payload_answers_formation_violation() {
        let (actor, _conn, _rx) = actor();
        let reply = actor
            .handle(r#"[2,"m3","StartTransaction",{"connectorId":"not a number"}]"#)
            .await
            .unwrap();

        match parse_reply(&reply) {
            OcppFrame::CallError { error_code, .. } => {
                assert_eq!(error_code, "FormationViolation");
            }
            other => panic!("expected CallError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn malformed_frame_with_recoverable_id_answers_protocol_error() {
        let (actor, _conn, _rx) = actor();
        // Arity-violating Call: id is present, the rest is not.
        let reply = actor.handle(r#"[2,"m4"]"#).await.unwrap();

        match parse_reply(&reply) {
            OcppFrame::CallError {
                unique_id,
                error_code,
                ..
            } => {
                assert_eq!(unique_id, "m4");
                assert_eq!(error_code, "ProtocolError");
            }
            other => panic!("expected CallError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unparseable_garbage_produces_no_reply() {
        let (actor, _conn, _rx) = actor();
        assert!(actor.handle("garbage").await.is_none());
    }

    #[tokio::test]
    async fn call_result_resolves_pending_call() {
        let (actor, conn, _rx) = actor();
        let (message_id, receiver) = conn
            .pending
            .register("RemoteStopTransaction", Duration::from_secs(30));

        let reply = actor
            .handle(&format!(r#"[3,"{}",{{"status":"Accepted"}}]"#, message_id))
            .await;
        assert!(reply.is_none());

        match receiver.await.unwrap() {
            crate::session::CallOutcome::Result(payload) => {
                assert_eq!(payload["status"], "Accepted");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn call_error_resolves_pending_call() {
        let (actor, conn, _rx) = actor();
        let (message_id, receiver) = conn.pending.register("Reset", Duration::from_secs(30));

        actor
            .handle(&format!(
                r#"[4,"{}","NotSupported","no hard reset",{{}}]"#,
                message_id
            ))
            .await;

        match receiver.await.unwrap() {
            crate::session::CallOutcome::Error { code, .. } => assert_eq!(code, "NotSupported"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn full_charge_session_over_frames() {
        let (actor, _conn, _rx) = actor();

        actor
            .handle(r#"[2,"b1","BootNotification",{"chargePointVendor":"V","chargePointModel":"M"}]"#)
            .await
            .unwrap();

        let start_reply = actor
            .handle(r#"[2,"s1","StartTransaction",{"connectorId":1,"idTag":"ABC","meterStart":0,"timestamp":"2024-01-01T00:00:00Z"}]"#)
            .await
            .unwrap();
        let tx_id = match parse_reply(&start_reply) {
            OcppFrame::CallResult { payload, .. } => {
                assert_eq!(payload["idTagInfo"]["status"], "Accepted");
                payload["transactionId"].as_i64().unwrap()
            }
            other => panic!("expected CallResult, got {:?}", other),
        };
        assert_eq!(tx_id, 1);

        let stop_reply = actor
            .handle(&format!(
                r#"[2,"t1","StopTransaction",{{"transactionId":{},"meterStop":500,"timestamp":"2024-01-01T01:00:00Z"}}]"#,
                tx_id
            ))
            .await
            .unwrap();
        match parse_reply(&stop_reply) {
            OcppFrame::CallResult { payload, .. } => {
                assert_eq!(payload["idTagInfo"]["status"], "Accepted");
            }
            other => panic!("expected CallResult, got {:?}", other),
        }
    }
}
