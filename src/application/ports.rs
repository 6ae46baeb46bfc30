//! Provider traits consumed by the core
//!
//! Authorization and durable storage live outside this crate (REST/JWT
//! stack, database engine). The core talks to them through these traits;
//! in-memory implementations for development and tests are in
//! `infrastructure::memory`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{AuthorizationStatus, ChargePointInfo, Connector, MeterSample, Transaction};

/// Authorization decisions for charge tokens and management commands.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Authorize an idTag presented at a charge point.
    async fn authorize(&self, id_tag: &str) -> AuthorizationStatus;

    /// Verify a management-surface token for commands targeting a charge
    /// point. Token issuance is out of scope; this only checks validity.
    async fn verify_command_token(&self, token: &str, charge_point_id: &str) -> bool;
}

/// Connection lifecycle event recorded for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

/// Persistence failures, split into retryable and permanent.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Transient: storage temporarily unreachable; retried with backoff.
    #[error("Persistence unavailable: {0}")]
    Unavailable(String),

    /// Permanent: the write itself is invalid; not retried.
    #[error("Persistence rejected write: {0}")]
    Rejected(String),
}

impl PersistenceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Durable storage for transactions, meter data and connection history.
///
/// Atomicity is expected per single record only; the engine never assumes
/// cross-record transactions.
#[async_trait]
pub trait PersistenceProvider: Send + Sync {
    /// Last-known connector set for a charge point, loaded at connect time.
    async fn load_charge_point_state(
        &self,
        charge_point_id: &str,
    ) -> Result<Vec<Connector>, PersistenceError>;

    /// Record identification data from a BootNotification.
    async fn record_boot_info(&self, info: ChargePointInfo) -> Result<(), PersistenceError>;

    async fn create_transaction(&self, transaction: &Transaction) -> Result<(), PersistenceError>;

    async fn update_transaction(&self, transaction: &Transaction) -> Result<(), PersistenceError>;

    async fn append_meter_samples(&self, samples: &[MeterSample])
        -> Result<(), PersistenceError>;

    async fn record_connection_event(
        &self,
        charge_point_id: &str,
        event: ConnectionEvent,
        timestamp: DateTime<Utc>,
    ) -> Result<(), PersistenceError>;
}
