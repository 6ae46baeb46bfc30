//! Charging-transaction state machine
//!
//! Owns the per-(charge point, connector) session lifecycle: availability,
//! authorization, transaction start/stop and metering. In-memory state is
//! the source of truth for real-time decisions; the persistence provider is
//! written through with bounded retry and never rolled back on a retryable
//! failure (the record is flagged for reconciliation instead).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::domain::{
    AuthorizationStatus, AuthorizeRequest, AuthorizeResponse, BootNotificationRequest,
    BootNotificationResponse, ChargePointInfo, Connector, ConnectorStatus, HeartbeatResponse,
    IdTagInfo, MeterSample, MeterValuesRequest, RegistrationStatus,
    SecurityEventNotificationRequest, StartTransactionRequest, StartTransactionResponse,
    StatusNotificationRequest, StopTransactionRequest, StopTransactionResponse, Transaction,
};
use crate::support::{retry_with_backoff, RetryConfig};

use super::ports::{AuthProvider, ConnectionEvent, PersistenceError, PersistenceProvider};

/// Engine policy knobs, taken from the application config.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Admission status returned to BootNotification.
    pub boot_status: RegistrationStatus,
    /// Heartbeat interval advertised to charge points, in seconds.
    pub heartbeat_interval_secs: u32,
    /// Retry policy for persistence writes.
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            boot_status: RegistrationStatus::Accepted,
            heartbeat_interval_secs: 300,
            retry: RetryConfig::default(),
        }
    }
}

/// The transaction state machine shared by all session actors.
pub struct TransactionEngine {
    persistence: Arc<dyn PersistenceProvider>,
    auth: Arc<dyn AuthProvider>,
    config: EngineConfig,
    /// Connector state per charge point identity.
    connectors: DashMap<String, HashMap<u32, Connector>>,
    /// All transactions seen this process lifetime, keyed by ID. Doubles as
    /// the transaction-to-identity index for the management surface.
    transactions: DashMap<i32, Transaction>,
    /// Active transaction per (identity, connector). Presence of a key is
    /// the "connector busy" predicate.
    active: DashMap<(String, u32), i32>,
    next_transaction_id: AtomicI32,
}

pub type SharedTransactionEngine = Arc<TransactionEngine>;

impl TransactionEngine {
    pub fn new(
        persistence: Arc<dyn PersistenceProvider>,
        auth: Arc<dyn AuthProvider>,
        config: EngineConfig,
    ) -> Self {
        Self {
            persistence,
            auth,
            config,
            connectors: DashMap::new(),
            transactions: DashMap::new(),
            active: DashMap::new(),
            next_transaction_id: AtomicI32::new(1),
        }
    }

    pub fn shared(
        persistence: Arc<dyn PersistenceProvider>,
        auth: Arc<dyn AuthProvider>,
        config: EngineConfig,
    ) -> SharedTransactionEngine {
        Arc::new(Self::new(persistence, auth, config))
    }

    // ── Connection lifecycle hooks ─────────────────────────

    /// Called by the session task once the WebSocket handshake completed.
    /// Loads last-known connector state and records the connect event.
    pub async fn connection_established(&self, charge_point_id: &str) {
        match self
            .persistence
            .load_charge_point_state(charge_point_id)
            .await
        {
            Ok(loaded) => {
                let map: HashMap<u32, Connector> =
                    loaded.into_iter().map(|c| (c.id, c)).collect();
                info!(
                    charge_point_id,
                    connectors = map.len(),
                    "Loaded last-known charge point state"
                );
                self.connectors
                    .entry(charge_point_id.to_string())
                    .or_insert(map);
            }
            Err(e) => {
                warn!(charge_point_id, error = %e, "Could not load charge point state, starting empty");
                self.connectors
                    .entry(charge_point_id.to_string())
                    .or_default();
            }
        }

        if let Err(e) = self
            .persistence
            .record_connection_event(charge_point_id, ConnectionEvent::Connected, Utc::now())
            .await
        {
            warn!(charge_point_id, error = %e, "Failed to record connect event");
        }
    }

    /// Called when the transport closes. Marks all connectors Unavailable;
    /// active transactions stay active in persisted state, pending
    /// reconciliation once the station reconnects.
    pub async fn connection_lost(&self, charge_point_id: &str) {
        if let Some(mut entry) = self.connectors.get_mut(charge_point_id) {
            for connector in entry.value_mut().values_mut() {
                connector.set_status(ConnectorStatus::Unavailable, None);
            }
        }
        info!(charge_point_id, "Marked connectors unavailable after disconnect");

        if let Err(e) = self
            .persistence
            .record_connection_event(charge_point_id, ConnectionEvent::Disconnected, Utc::now())
            .await
        {
            warn!(charge_point_id, error = %e, "Failed to record disconnect event");
        }
    }

    // ── Charge-point-initiated events ──────────────────────

    pub async fn boot_notification(
        &self,
        charge_point_id: &str,
        request: BootNotificationRequest,
    ) -> BootNotificationResponse {
        info!(
            charge_point_id,
            vendor = request.charge_point_vendor.as_str(),
            model = request.charge_point_model.as_str(),
            "BootNotification"
        );

        {
            let mut entry = self
                .connectors
                .entry(charge_point_id.to_string())
                .or_default();
            let map = entry.value_mut();
            // The real connector count arrives via StatusNotification;
            // connector 1 always exists on a booted station.
            map.entry(1).or_insert_with(|| Connector::new(1));
            for connector in map.values_mut() {
                if connector.status == ConnectorStatus::Unknown {
                    connector.set_status(ConnectorStatus::Available, None);
                }
            }
        }

        let info = ChargePointInfo {
            charge_point_id: charge_point_id.to_string(),
            vendor: request.charge_point_vendor,
            model: request.charge_point_model,
            serial_number: request.charge_point_serial_number,
            firmware_version: request.firmware_version,
            booted_at: Utc::now(),
        };
        if let Err(e) = self.persistence.record_boot_info(info).await {
            warn!(charge_point_id, error = %e, "Failed to record boot info");
        }

        BootNotificationResponse {
            status: self.config.boot_status,
            current_time: Utc::now(),
            interval: self.config.heartbeat_interval_secs,
        }
    }

    /// Pure authorization query; no state mutation.
    pub async fn authorize(
        &self,
        charge_point_id: &str,
        request: AuthorizeRequest,
    ) -> AuthorizeResponse {
        let status = self.auth.authorize(&request.id_tag).await;
        info!(
            charge_point_id,
            id_tag = request.id_tag.as_str(),
            status = ?status,
            "Authorize"
        );
        AuthorizeResponse {
            id_tag_info: IdTagInfo::new(status),
        }
    }

    pub async fn start_transaction(
        &self,
        charge_point_id: &str,
        request: StartTransactionRequest,
    ) -> StartTransactionResponse {
        info!(
            charge_point_id,
            connector_id = request.connector_id,
            id_tag = request.id_tag.as_str(),
            meter_start = request.meter_start,
            "StartTransaction"
        );

        if self.connector_status(charge_point_id, request.connector_id)
            == Some(ConnectorStatus::Faulted)
        {
            warn!(
                charge_point_id,
                connector_id = request.connector_id,
                "StartTransaction rejected: connector faulted"
            );
            return Self::rejected_start(AuthorizationStatus::Invalid);
        }

        let auth_status = self.auth.authorize(&request.id_tag).await;
        if auth_status != AuthorizationStatus::Accepted {
            warn!(
                charge_point_id,
                id_tag = request.id_tag.as_str(),
                status = ?auth_status,
                "StartTransaction rejected: authorization failed"
            );
            return Self::rejected_start(auth_status);
        }

        // Claim the connector atomically; a concurrent start for the same
        // connector loses here.
        let transaction_id = self.next_transaction_id.fetch_add(1, Ordering::SeqCst);
        match self
            .active
            .entry((charge_point_id.to_string(), request.connector_id))
        {
            Entry::Occupied(existing) => {
                warn!(
                    charge_point_id,
                    connector_id = request.connector_id,
                    active_transaction_id = *existing.get(),
                    "StartTransaction rejected: connector busy"
                );
                return Self::rejected_start(AuthorizationStatus::ConcurrentTx);
            }
            Entry::Vacant(slot) => {
                slot.insert(transaction_id);
            }
        }

        let mut transaction = Transaction::new(
            transaction_id,
            charge_point_id,
            request.connector_id,
            request.id_tag,
            request.meter_start,
            request.timestamp,
        );
        self.transactions.insert(transaction_id, transaction.clone());
        self.set_connector_status(
            charge_point_id,
            request.connector_id,
            ConnectorStatus::Occupied,
            None,
        );

        // The durable record carries the Active status from the outset: a
        // disconnect mid-charge must find the persisted transaction running.
        transaction.activate();
        let persisted = self
            .persist("create_transaction", || {
                let tx = transaction.clone();
                async move { self.persistence.create_transaction(&tx).await }
            })
            .await;

        if let Some(mut tx) = self.transactions.get_mut(&transaction_id) {
            tx.activate();
            if persisted.is_err() {
                tx.needs_reconciliation = true;
            }
        }
        if let Err(e) = persisted {
            error!(
                charge_point_id,
                transaction_id,
                error = %e,
                "Transaction start not persisted, flagged for reconciliation"
            );
        }

        info!(charge_point_id, transaction_id, "Transaction started");
        StartTransactionResponse {
            transaction_id,
            id_tag_info: IdTagInfo::new(AuthorizationStatus::Accepted),
        }
    }

    pub async fn meter_values(&self, charge_point_id: &str, request: MeterValuesRequest) {
        let transaction_id = request.transaction_id.or_else(|| {
            self.active
                .get(&(charge_point_id.to_string(), request.connector_id))
                .map(|id| *id)
        });

        let Some(transaction_id) = transaction_id else {
            // Meter data must never block the station; unknown targets are
            // logged and acknowledged anyway.
            warn!(
                charge_point_id,
                connector_id = request.connector_id,
                "MeterValues without a known transaction, acknowledged and dropped"
            );
            return;
        };

        if !self.transactions.contains_key(&transaction_id) {
            warn!(
                charge_point_id,
                transaction_id, "MeterValues for unknown transaction, acknowledged and dropped"
            );
            return;
        }

        let samples: Vec<MeterSample> = request
            .meter_value
            .iter()
            .flat_map(|mv| {
                mv.sampled_value.iter().map(move |sv| MeterSample {
                    transaction_id,
                    timestamp: mv.timestamp,
                    value: sv.value.clone(),
                    unit: sv.unit.clone(),
                    measurand: sv.measurand.clone(),
                })
            })
            .collect();

        if samples.is_empty() {
            return;
        }

        info!(
            charge_point_id,
            transaction_id,
            samples = samples.len(),
            "MeterValues"
        );

        if let Err(e) = self
            .persist("append_meter_samples", || {
                let batch = samples.clone();
                async move { self.persistence.append_meter_samples(&batch).await }
            })
            .await
        {
            error!(charge_point_id, transaction_id, error = %e, "Failed to persist meter samples");
        }
    }

    pub async fn stop_transaction(
        &self,
        charge_point_id: &str,
        request: StopTransactionRequest,
    ) -> StopTransactionResponse {
        info!(
            charge_point_id,
            transaction_id = request.transaction_id,
            meter_stop = request.meter_stop,
            reason = request.reason.as_deref().unwrap_or("-"),
            "StopTransaction"
        );

        let snapshot = {
            let Some(mut tx) = self.transactions.get_mut(&request.transaction_id) else {
                warn!(
                    charge_point_id,
                    transaction_id = request.transaction_id,
                    "StopTransaction for unknown transaction, acknowledged"
                );
                return Self::accepted_stop();
            };

            if tx.is_closed() {
                // Duplicate stop: same reply, no second persistence write.
                info!(
                    charge_point_id,
                    transaction_id = tx.id,
                    "StopTransaction for already closed transaction, idempotent reply"
                );
                return Self::accepted_stop();
            }

            // In-memory record holds Stopping until the write settles; the
            // persisted snapshot already carries the final stop data.
            tx.begin_stop();
            let mut closing = tx.clone();
            closing.close(request.meter_stop, request.timestamp, request.reason.clone());
            closing
        };

        self.active
            .remove(&(snapshot.charge_point_id.clone(), snapshot.connector_id));
        // A fault reported mid-transaction keeps the connector out of
        // rotation after the stop.
        if self.connector_status(&snapshot.charge_point_id, snapshot.connector_id)
            != Some(ConnectorStatus::Faulted)
        {
            self.set_connector_status(
                &snapshot.charge_point_id,
                snapshot.connector_id,
                ConnectorStatus::Available,
                None,
            );
        }

        let persisted = self
            .persist("update_transaction", || {
                let tx = snapshot.clone();
                async move { self.persistence.update_transaction(&tx).await }
            })
            .await;
        if let Some(mut tx) = self.transactions.get_mut(&snapshot.id) {
            tx.close(request.meter_stop, request.timestamp, request.reason);
            if persisted.is_err() {
                tx.needs_reconciliation = true;
            }
        }
        if let Err(e) = persisted {
            error!(
                charge_point_id,
                transaction_id = snapshot.id,
                error = %e,
                "Transaction stop not persisted, flagged for reconciliation"
            );
        }

        if let Some(energy) = self
            .transactions
            .get(&snapshot.id)
            .and_then(|tx| tx.energy_consumed())
        {
            info!(
                charge_point_id,
                transaction_id = snapshot.id,
                energy_wh = energy,
                "Transaction closed"
            );
        }

        Self::accepted_stop()
    }

    pub async fn status_notification(
        &self,
        charge_point_id: &str,
        request: StatusNotificationRequest,
    ) {
        let Some(status) = ConnectorStatus::from_ocpp(&request.status) else {
            warn!(
                charge_point_id,
                connector_id = request.connector_id,
                status = request.status.as_str(),
                "StatusNotification with unrecognized status, ignored"
            );
            return;
        };

        info!(
            charge_point_id,
            connector_id = request.connector_id,
            status = ?status,
            error_code = request.error_code.as_str(),
            "StatusNotification"
        );

        let error_code = if request.error_code == "NoError" {
            None
        } else {
            Some(request.error_code)
        };
        self.set_connector_status(charge_point_id, request.connector_id, status, error_code);
    }

    /// Station-pushed security event. No transaction context; recorded on
    /// the log and acknowledged so the station keeps its send queue moving.
    pub fn security_event_notification(
        &self,
        charge_point_id: &str,
        request: SecurityEventNotificationRequest,
    ) {
        warn!(
            charge_point_id,
            event = request.kind.as_str(),
            tech_info = request.tech_info.as_deref().unwrap_or("-"),
            "SecurityEventNotification"
        );
    }

    pub fn heartbeat(&self, charge_point_id: &str) -> HeartbeatResponse {
        info!(charge_point_id, "Heartbeat");
        HeartbeatResponse {
            current_time: Utc::now(),
        }
    }

    // ── Management queries ─────────────────────────────────

    /// Connector snapshot for a charge point, sorted by connector ID.
    pub fn connectors(&self, charge_point_id: &str) -> Option<Vec<Connector>> {
        self.connectors.get(charge_point_id).map(|entry| {
            let mut list: Vec<Connector> = entry.values().cloned().collect();
            list.sort_by_key(|c| c.id);
            list
        })
    }

    pub fn get_transaction(&self, transaction_id: i32) -> Option<Transaction> {
        self.transactions.get(&transaction_id).map(|tx| tx.clone())
    }

    /// Active transaction on a connector, if any.
    pub fn active_transaction_id(&self, charge_point_id: &str, connector_id: u32) -> Option<i32> {
        self.active
            .get(&(charge_point_id.to_string(), connector_id))
            .map(|id| *id)
    }

    // ── Internals ──────────────────────────────────────────

    fn connector_status(&self, charge_point_id: &str, connector_id: u32) -> Option<ConnectorStatus> {
        self.connectors
            .get(charge_point_id)
            .and_then(|map| map.get(&connector_id).map(|c| c.status))
    }

    fn set_connector_status(
        &self,
        charge_point_id: &str,
        connector_id: u32,
        status: ConnectorStatus,
        error_code: Option<String>,
    ) {
        let mut entry = self
            .connectors
            .entry(charge_point_id.to_string())
            .or_default();
        entry
            .value_mut()
            .entry(connector_id)
            .or_insert_with(|| Connector::new(connector_id))
            .set_status(status, error_code);
    }

    async fn persist<F, Fut>(
        &self,
        operation_name: &str,
        operation: F,
    ) -> Result<(), PersistenceError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), PersistenceError>>,
    {
        retry_with_backoff(
            self.config.retry.clone(),
            operation,
            |e: &PersistenceError| e.is_retryable(),
            operation_name,
        )
        .await
    }

    fn rejected_start(status: AuthorizationStatus) -> StartTransactionResponse {
        StartTransactionResponse {
            transaction_id: 0,
            id_tag_info: IdTagInfo::new(status),
        }
    }

    fn accepted_stop() -> StopTransactionResponse {
        StopTransactionResponse {
            id_tag_info: Some(IdTagInfo::new(AuthorizationStatus::Accepted)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TransactionStatus;
    use crate::infrastructure::memory::{MemoryAuthProvider, MemoryPersistence};
    use async_trait::async_trait;
    use chrono::DateTime;

    fn engine_with(
        persistence: Arc<dyn PersistenceProvider>,
        auth: Arc<dyn AuthProvider>,
    ) -> TransactionEngine {
        let config = EngineConfig {
            retry: RetryConfig {
                max_attempts: 2,
                initial_delay: std::time::Duration::from_millis(1),
                backoff_multiplier: 1.0,
                max_delay: std::time::Duration::from_millis(2),
            },
            ..EngineConfig::default()
        };
        TransactionEngine::new(persistence, auth, config)
    }

    fn default_engine() -> (TransactionEngine, Arc<MemoryPersistence>) {
        let persistence = Arc::new(MemoryPersistence::new());
        let auth = Arc::new(MemoryAuthProvider::with_tags(&["ABC", "TEST001"]));
        (engine_with(persistence.clone(), auth), persistence)
    }

    fn boot_request() -> BootNotificationRequest {
        BootNotificationRequest {
            charge_point_vendor: "Vendor".into(),
            charge_point_model: "Model".into(),
            charge_point_serial_number: None,
            firmware_version: None,
        }
    }

    fn start_request(connector_id: u32, id_tag: &str) -> StartTransactionRequest {
        StartTransactionRequest {
            connector_id,
            id_tag: id_tag.into(),
            meter_start: 100,
            timestamp: Utc::now(),
            reservation_id: None,
        }
    }

    fn status_request(connector_id: u32, status: &str) -> StatusNotificationRequest {
        StatusNotificationRequest {
            connector_id,
            status: status.into(),
            error_code: "NoError".into(),
            info: None,
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn boot_then_status_then_start_assigns_first_transaction_id() {
        let (engine, _) = default_engine();

        let boot = engine.boot_notification("CP-1", boot_request()).await;
        assert_eq!(boot.status, RegistrationStatus::Accepted);

        engine
            .status_notification("CP-1", status_request(1, "Available"))
            .await;

        let response = engine.start_transaction("CP-1", start_request(1, "ABC")).await;
        assert_eq!(response.transaction_id, 1);
        assert_eq!(response.id_tag_info.status, AuthorizationStatus::Accepted);

        let connectors = engine.connectors("CP-1").unwrap();
        let connector = connectors.iter().find(|c| c.id == 1).unwrap();
        assert_eq!(connector.status, ConnectorStatus::Occupied);
    }

    #[tokio::test]
    async fn started_transaction_is_persisted_as_active() {
        let (engine, persistence) = default_engine();
        engine.boot_notification("CP-1", boot_request()).await;

        let started = engine.start_transaction("CP-1", start_request(1, "ABC")).await;

        // A disconnect mid-charge must find the stored record still running.
        let stored = persistence.stored_transaction(started.transaction_id).unwrap();
        assert_eq!(stored.status, TransactionStatus::Active);
        assert!(stored.meter_stop.is_none());
    }

    #[tokio::test]
    async fn start_on_occupied_connector_is_rejected() {
        let (engine, _) = default_engine();
        engine.boot_notification("CP-1", boot_request()).await;

        let first = engine.start_transaction("CP-1", start_request(1, "ABC")).await;
        assert_eq!(first.transaction_id, 1);

        let second = engine.start_transaction("CP-1", start_request(1, "ABC")).await;
        assert_eq!(second.transaction_id, 0);
        assert_eq!(
            second.id_tag_info.status,
            AuthorizationStatus::ConcurrentTx
        );
        assert_eq!(engine.active_transaction_id("CP-1", 1), Some(1));
    }

    #[tokio::test]
    async fn rejected_id_tag_creates_no_transaction() {
        let (engine, _) = default_engine();
        engine.boot_notification("CP-1", boot_request()).await;

        let response = engine
            .start_transaction("CP-1", start_request(1, "UNKNOWN"))
            .await;
        assert_eq!(response.transaction_id, 0);
        assert_eq!(response.id_tag_info.status, AuthorizationStatus::Invalid);
        assert!(engine.active_transaction_id("CP-1", 1).is_none());
    }

    #[tokio::test]
    async fn faulted_connector_rejects_start_until_recovery() {
        let (engine, _) = default_engine();
        engine.boot_notification("CP-1", boot_request()).await;

        engine
            .status_notification(
                "CP-1",
                StatusNotificationRequest {
                    connector_id: 1,
                    status: "Faulted".into(),
                    error_code: "GroundFailure".into(),
                    info: None,
                    timestamp: None,
                },
            )
            .await;

        let rejected = engine.start_transaction("CP-1", start_request(1, "ABC")).await;
        assert_eq!(rejected.transaction_id, 0);

        engine
            .status_notification("CP-1", status_request(1, "Available"))
            .await;
        let accepted = engine.start_transaction("CP-1", start_request(1, "ABC")).await;
        assert_eq!(accepted.transaction_id, 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent_without_second_persistence_write() {
        let (engine, persistence) = default_engine();
        engine.boot_notification("CP-1", boot_request()).await;
        let started = engine.start_transaction("CP-1", start_request(1, "ABC")).await;

        let stop = StopTransactionRequest {
            transaction_id: started.transaction_id,
            meter_stop: 350,
            timestamp: Utc::now(),
            reason: Some("Local".into()),
            id_tag: None,
        };

        engine.stop_transaction("CP-1", stop.clone()).await;
        let writes_after_first = persistence.transaction_update_count();

        engine.stop_transaction("CP-1", stop).await;
        assert_eq!(persistence.transaction_update_count(), writes_after_first);

        let tx = engine.get_transaction(started.transaction_id).unwrap();
        assert!(tx.is_closed());
        assert_eq!(tx.energy_consumed(), Some(250));
        assert!(engine.active_transaction_id("CP-1", 1).is_none());

        let stored = persistence.stored_transaction(started.transaction_id).unwrap();
        assert!(stored.is_closed());
        assert_eq!(stored.meter_stop, Some(350));

        let connectors = engine.connectors("CP-1").unwrap();
        assert_eq!(
            connectors.iter().find(|c| c.id == 1).unwrap().status,
            ConnectorStatus::Available
        );
    }

    #[tokio::test]
    async fn stop_keeps_faulted_connector_out_of_rotation() {
        let (engine, _) = default_engine();
        engine.boot_notification("CP-1", boot_request()).await;
        let started = engine.start_transaction("CP-1", start_request(1, "ABC")).await;

        engine
            .status_notification(
                "CP-1",
                StatusNotificationRequest {
                    connector_id: 1,
                    status: "Faulted".into(),
                    error_code: "HighTemperature".into(),
                    info: None,
                    timestamp: None,
                },
            )
            .await;

        engine
            .stop_transaction(
                "CP-1",
                StopTransactionRequest {
                    transaction_id: started.transaction_id,
                    meter_stop: 200,
                    timestamp: Utc::now(),
                    reason: None,
                    id_tag: None,
                },
            )
            .await;

        let connectors = engine.connectors("CP-1").unwrap();
        assert_eq!(
            connectors.iter().find(|c| c.id == 1).unwrap().status,
            ConnectorStatus::Faulted
        );
    }

    #[tokio::test]
    async fn meter_values_for_unknown_transaction_are_acknowledged() {
        let (engine, persistence) = default_engine();
        engine.boot_notification("CP-1", boot_request()).await;

        engine
            .meter_values(
                "CP-1",
                MeterValuesRequest {
                    connector_id: 1,
                    transaction_id: Some(999),
                    meter_value: vec![crate::domain::MeterValue {
                        timestamp: Utc::now(),
                        sampled_value: vec![crate::domain::SampledValue {
                            value: "150".into(),
                            unit: Some("Wh".into()),
                            measurand: None,
                            context: None,
                        }],
                    }],
                },
            )
            .await;

        assert_eq!(persistence.meter_sample_count(), 0);
    }

    #[tokio::test]
    async fn meter_values_resolve_transaction_from_connector() {
        let (engine, persistence) = default_engine();
        engine.boot_notification("CP-1", boot_request()).await;
        engine.start_transaction("CP-1", start_request(1, "ABC")).await;

        engine
            .meter_values(
                "CP-1",
                MeterValuesRequest {
                    connector_id: 1,
                    transaction_id: None,
                    meter_value: vec![crate::domain::MeterValue {
                        timestamp: Utc::now(),
                        sampled_value: vec![crate::domain::SampledValue {
                            value: "150".into(),
                            unit: Some("Wh".into()),
                            measurand: Some("Energy.Active.Import.Register".into()),
                            context: None,
                        }],
                    }],
                },
            )
            .await;

        assert_eq!(persistence.meter_sample_count(), 1);
    }

    #[tokio::test]
    async fn connection_lost_marks_connectors_unavailable_but_keeps_transaction() {
        let (engine, persistence) = default_engine();
        engine.connection_established("CP-1").await;
        engine.boot_notification("CP-1", boot_request()).await;
        let started = engine.start_transaction("CP-1", start_request(1, "ABC")).await;

        engine.connection_lost("CP-1").await;

        let connectors = engine.connectors("CP-1").unwrap();
        assert!(connectors
            .iter()
            .all(|c| c.status == ConnectorStatus::Unavailable));

        let tx = engine.get_transaction(started.transaction_id).unwrap();
        assert_eq!(tx.status, TransactionStatus::Active);

        // Connect and disconnect are both on the audit trail.
        assert_eq!(persistence.connection_event_count(), 2);
    }

    #[tokio::test]
    async fn boot_admission_policy_is_configurable() {
        let persistence = Arc::new(MemoryPersistence::new());
        let auth = Arc::new(MemoryAuthProvider::with_tags(&[]));
        let engine = TransactionEngine::new(
            persistence,
            auth,
            EngineConfig {
                boot_status: RegistrationStatus::Pending,
                ..EngineConfig::default()
            },
        );

        let response = engine.boot_notification("CP-1", boot_request()).await;
        assert_eq!(response.status, RegistrationStatus::Pending);
        assert!(response.interval > 0);
    }

    // Provider that always fails with a retryable error, for the
    // reconciliation path.
    struct BrokenPersistence;

    #[async_trait]
    impl PersistenceProvider for BrokenPersistence {
        async fn load_charge_point_state(
            &self,
            _charge_point_id: &str,
        ) -> Result<Vec<Connector>, PersistenceError> {
            Err(PersistenceError::Unavailable("down".into()))
        }

        async fn record_boot_info(&self, _info: ChargePointInfo) -> Result<(), PersistenceError> {
            Err(PersistenceError::Unavailable("down".into()))
        }

        async fn create_transaction(
            &self,
            _transaction: &Transaction,
        ) -> Result<(), PersistenceError> {
            Err(PersistenceError::Unavailable("down".into()))
        }

        async fn update_transaction(
            &self,
            _transaction: &Transaction,
        ) -> Result<(), PersistenceError> {
            Err(PersistenceError::Unavailable("down".into()))
        }

        async fn append_meter_samples(
            &self,
            _samples: &[MeterSample],
        ) -> Result<(), PersistenceError> {
            Err(PersistenceError::Unavailable("down".into()))
        }

        async fn record_connection_event(
            &self,
            _charge_point_id: &str,
            _event: ConnectionEvent,
            _timestamp: DateTime<Utc>,
        ) -> Result<(), PersistenceError> {
            Err(PersistenceError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn persistence_outage_flags_transaction_for_reconciliation() {
        let auth = Arc::new(MemoryAuthProvider::with_tags(&["ABC"]));
        let engine = engine_with(Arc::new(BrokenPersistence), auth);
        engine.boot_notification("CP-1", boot_request()).await;

        let response = engine.start_transaction("CP-1", start_request(1, "ABC")).await;
        // The station still gets its transaction; in-memory state is the
        // source of truth and is not rolled back.
        assert_eq!(response.transaction_id, 1);
        assert_eq!(response.id_tag_info.status, AuthorizationStatus::Accepted);

        let tx = engine.get_transaction(1).unwrap();
        assert!(tx.needs_reconciliation);
        assert_eq!(tx.status, TransactionStatus::Active);
    }
}
