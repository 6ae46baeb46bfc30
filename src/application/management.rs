//! Management surface exposed to the REST layer
//!
//! The REST framework itself lives outside this crate; it embeds
//! [`ManagementApi`] and maps these results onto HTTP. Command calls are
//! gated on the auth provider's token check before anything reaches the
//! dispatcher.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::domain::{Action, Connector, Transaction};
use crate::session::SharedConnectionRegistry;

use super::dispatcher::{CommandError, SharedCommandDispatcher};
use super::engine::SharedTransactionEngine;
use super::ports::AuthProvider;

#[derive(Debug, Error)]
pub enum ManagementError {
    #[error("Invalid or expired command token")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Command(#[from] CommandError),
}

pub struct ManagementApi {
    registry: SharedConnectionRegistry,
    engine: SharedTransactionEngine,
    dispatcher: SharedCommandDispatcher,
    auth: Arc<dyn AuthProvider>,
}

impl ManagementApi {
    pub fn new(
        registry: SharedConnectionRegistry,
        engine: SharedTransactionEngine,
        dispatcher: SharedCommandDispatcher,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        Self {
            registry,
            engine,
            dispatcher,
            auth,
        }
    }

    /// Identities of all currently connected charge points.
    pub fn list_connections(&self) -> Vec<String> {
        self.registry.connected_ids()
    }

    /// Connector snapshot for a charge point.
    pub fn get_connector_status(&self, charge_point_id: &str) -> Result<Vec<Connector>, ManagementError> {
        self.engine
            .connectors(charge_point_id)
            .ok_or_else(|| ManagementError::NotFound(format!("charge point {}", charge_point_id)))
    }

    pub fn get_transaction(&self, transaction_id: i32) -> Result<Transaction, ManagementError> {
        self.engine
            .get_transaction(transaction_id)
            .ok_or_else(|| ManagementError::NotFound(format!("transaction {}", transaction_id)))
    }

    /// Verify the command token, then deliver the command through the
    /// dispatcher.
    pub async fn send_command(
        &self,
        token: &str,
        charge_point_id: &str,
        action: Action,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ManagementError> {
        if !self.auth.verify_command_token(token, charge_point_id).await {
            warn!(charge_point_id, "Rejected command with invalid token");
            return Err(ManagementError::Unauthorized);
        }

        let reply = self
            .dispatcher
            .send_command(charge_point_id, action, payload, timeout)
            .await?;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::dispatcher::CommandDispatcher;
    use crate::application::engine::{EngineConfig, TransactionEngine};
    use crate::domain::{OcppVersion, StartTransactionRequest};
    use crate::infrastructure::memory::{MemoryAuthProvider, MemoryPersistence};
    use crate::session::{Connection, ConnectionRegistry};
    use chrono::Utc;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn api() -> (ManagementApi, SharedConnectionRegistry, SharedTransactionEngine) {
        let registry = ConnectionRegistry::shared();
        let auth = Arc::new(
            MemoryAuthProvider::with_tags(&["ABC"]).with_command_token("secret-token"),
        );
        let engine = TransactionEngine::shared(
            Arc::new(MemoryPersistence::new()),
            auth.clone(),
            EngineConfig::default(),
        );
        let dispatcher = CommandDispatcher::shared(
            registry.clone(),
            engine.clone(),
            Duration::from_millis(50),
        );
        (
            ManagementApi::new(registry.clone(), engine.clone(), dispatcher, auth),
            registry,
            engine,
        )
    }

    #[tokio::test]
    async fn lists_connected_charge_points() {
        let (api, registry, _engine) = api();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.attach(Connection::new("CP-1", tx, OcppVersion::V16));

        assert_eq!(api.list_connections(), vec!["CP-1".to_string()]);
    }

    #[tokio::test]
    async fn invalid_token_is_rejected_before_dispatch() {
        let (api, registry, _engine) = api();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.attach(Connection::new("CP-1", tx, OcppVersion::V16));

        let result = api
            .send_command("wrong", "CP-1", Action::Reset, json!({"type": "Soft"}), None)
            .await;
        assert!(matches!(result, Err(ManagementError::Unauthorized)));
    }

    #[tokio::test]
    async fn unknown_identity_and_transaction_return_not_found() {
        let (api, _registry, engine) = api();
        assert!(matches!(
            api.get_connector_status("CP-404"),
            Err(ManagementError::NotFound(_))
        ));
        assert!(matches!(
            api.get_transaction(42),
            Err(ManagementError::NotFound(_))
        ));

        engine
            .start_transaction(
                "CP-1",
                StartTransactionRequest {
                    connector_id: 1,
                    id_tag: "ABC".into(),
                    meter_start: 0,
                    timestamp: Utc::now(),
                    reservation_id: None,
                },
            )
            .await;
        assert!(api.get_transaction(1).is_ok());
    }
}
