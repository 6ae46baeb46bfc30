//! In-memory provider implementations for development and testing
//!
//! Production deployments supply database-backed providers from outside the
//! crate; these keep everything in process memory and seed a few valid ID
//! tags the way a fresh development install expects.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::application::ports::{
    AuthProvider, ConnectionEvent, PersistenceError, PersistenceProvider,
};
use crate::domain::{AuthorizationStatus, ChargePointInfo, Connector, MeterSample, Transaction};

// ── Auth ───────────────────────────────────────────────────────

/// In-memory authorization: a table of idTags and a set of accepted
/// management command tokens.
pub struct MemoryAuthProvider {
    id_tags: DashMap<String, AuthorizationStatus>,
    command_tokens: DashMap<String, ()>,
}

impl MemoryAuthProvider {
    /// Seeds the default development tags.
    pub fn new() -> Self {
        Self::with_tags(&["TEST001", "TEST002", "ADMIN"])
    }

    /// Provider accepting exactly the given tags.
    pub fn with_tags(tags: &[&str]) -> Self {
        let provider = Self {
            id_tags: DashMap::new(),
            command_tokens: DashMap::new(),
        };
        for tag in tags {
            provider
                .id_tags
                .insert(tag.to_string(), AuthorizationStatus::Accepted);
        }
        provider
    }

    /// Register a tag with a non-Accepted status (blocked card, expired
    /// subscription).
    pub fn with_tag_status(self, tag: &str, status: AuthorizationStatus) -> Self {
        self.id_tags.insert(tag.to_string(), status);
        self
    }

    /// Accept `token` for management commands against any charge point.
    pub fn with_command_token(self, token: &str) -> Self {
        self.command_tokens.insert(token.to_string(), ());
        self
    }
}

impl Default for MemoryAuthProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthProvider for MemoryAuthProvider {
    async fn authorize(&self, id_tag: &str) -> AuthorizationStatus {
        self.id_tags
            .get(id_tag)
            .map(|s| *s)
            .unwrap_or(AuthorizationStatus::Invalid)
    }

    async fn verify_command_token(&self, token: &str, _charge_point_id: &str) -> bool {
        self.command_tokens.contains_key(token)
    }
}

// ── Persistence ────────────────────────────────────────────────

/// In-memory persistence. Also counts writes so tests can assert
/// idempotence (no duplicate write on a repeated StopTransaction).
pub struct MemoryPersistence {
    boot_info: DashMap<String, ChargePointInfo>,
    connectors: DashMap<String, Vec<Connector>>,
    transactions: DashMap<i32, Transaction>,
    meter_samples: Mutex<Vec<MeterSample>>,
    connection_events: Mutex<Vec<(String, ConnectionEvent, DateTime<Utc>)>>,
    transaction_updates: AtomicUsize,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self {
            boot_info: DashMap::new(),
            connectors: DashMap::new(),
            transactions: DashMap::new(),
            meter_samples: Mutex::new(Vec::new()),
            connection_events: Mutex::new(Vec::new()),
            transaction_updates: AtomicUsize::new(0),
        }
    }

    /// Pre-load connector state returned by `load_charge_point_state`.
    pub fn seed_connectors(&self, charge_point_id: &str, connectors: Vec<Connector>) {
        self.connectors
            .insert(charge_point_id.to_string(), connectors);
    }

    pub fn stored_transaction(&self, transaction_id: i32) -> Option<Transaction> {
        self.transactions.get(&transaction_id).map(|t| t.clone())
    }

    pub fn transaction_update_count(&self) -> usize {
        self.transaction_updates.load(Ordering::SeqCst)
    }

    pub fn meter_sample_count(&self) -> usize {
        self.meter_samples.lock().unwrap().len()
    }

    pub fn connection_event_count(&self) -> usize {
        self.connection_events.lock().unwrap().len()
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceProvider for MemoryPersistence {
    async fn load_charge_point_state(
        &self,
        charge_point_id: &str,
    ) -> Result<Vec<Connector>, PersistenceError> {
        Ok(self
            .connectors
            .get(charge_point_id)
            .map(|c| c.clone())
            .unwrap_or_default())
    }

    async fn record_boot_info(&self, info: ChargePointInfo) -> Result<(), PersistenceError> {
        self.boot_info.insert(info.charge_point_id.clone(), info);
        Ok(())
    }

    async fn create_transaction(&self, transaction: &Transaction) -> Result<(), PersistenceError> {
        self.transactions.insert(transaction.id, transaction.clone());
        Ok(())
    }

    async fn update_transaction(&self, transaction: &Transaction) -> Result<(), PersistenceError> {
        self.transaction_updates.fetch_add(1, Ordering::SeqCst);
        self.transactions.insert(transaction.id, transaction.clone());
        Ok(())
    }

    async fn append_meter_samples(
        &self,
        samples: &[MeterSample],
    ) -> Result<(), PersistenceError> {
        self.meter_samples
            .lock()
            .unwrap()
            .extend_from_slice(samples);
        Ok(())
    }

    async fn record_connection_event(
        &self,
        charge_point_id: &str,
        event: ConnectionEvent,
        timestamp: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        self.connection_events
            .lock()
            .unwrap()
            .push((charge_point_id.to_string(), event, timestamp));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_tag_is_invalid() {
        let auth = MemoryAuthProvider::with_tags(&["GOOD"]);
        assert_eq!(auth.authorize("GOOD").await, AuthorizationStatus::Accepted);
        assert_eq!(auth.authorize("BAD").await, AuthorizationStatus::Invalid);
    }

    #[tokio::test]
    async fn tag_status_overrides() {
        let auth =
            MemoryAuthProvider::with_tags(&[]).with_tag_status("BLOCKED", AuthorizationStatus::Blocked);
        assert_eq!(auth.authorize("BLOCKED").await, AuthorizationStatus::Blocked);
    }

    #[tokio::test]
    async fn command_tokens_are_checked() {
        let auth = MemoryAuthProvider::with_tags(&[]).with_command_token("tok");
        assert!(auth.verify_command_token("tok", "CP-1").await);
        assert!(!auth.verify_command_token("nope", "CP-1").await);
    }

    #[tokio::test]
    async fn load_state_returns_seeded_connectors() {
        let persistence = MemoryPersistence::new();
        persistence.seed_connectors("CP-1", vec![Connector::new(1), Connector::new(2)]);

        let loaded = persistence.load_charge_point_state("CP-1").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(persistence
            .load_charge_point_state("CP-2")
            .await
            .unwrap()
            .is_empty());
    }
}
