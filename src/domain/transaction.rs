//! Transaction domain entity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Charging-session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Created, persistence write not yet confirmed.
    Pending,
    /// Charging in progress.
    Active,
    /// StopTransaction received, close being recorded.
    Stopping,
    /// Closed; immutable from here on.
    Closed,
}

/// One charging session from StartTransaction to StopTransaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Server-assigned, monotonically issued ID.
    pub id: i32,
    pub charge_point_id: String,
    pub connector_id: u32,
    /// Authorization token that started the transaction.
    pub id_tag: String,
    /// Meter value at start (Wh).
    pub meter_start: i32,
    /// Meter value at stop (Wh).
    pub meter_stop: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<String>,
    pub status: TransactionStatus,
    /// Set when a persistence write exhausted its retries; the in-memory
    /// record stays authoritative and awaits operator reconciliation.
    pub needs_reconciliation: bool,
}

impl Transaction {
    pub fn new(
        id: i32,
        charge_point_id: impl Into<String>,
        connector_id: u32,
        id_tag: impl Into<String>,
        meter_start: i32,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            charge_point_id: charge_point_id.into(),
            connector_id,
            id_tag: id_tag.into(),
            meter_start,
            meter_stop: None,
            started_at,
            stopped_at: None,
            stop_reason: None,
            status: TransactionStatus::Pending,
            needs_reconciliation: false,
        }
    }

    pub fn activate(&mut self) {
        self.status = TransactionStatus::Active;
    }

    /// Mark the stop as in progress; `close` records the final state.
    pub fn begin_stop(&mut self) {
        self.status = TransactionStatus::Stopping;
    }

    /// Record stop data and close the transaction.
    pub fn close(&mut self, meter_stop: i32, stopped_at: DateTime<Utc>, reason: Option<String>) {
        self.meter_stop = Some(meter_stop);
        self.stopped_at = Some(stopped_at);
        self.stop_reason = reason;
        self.status = TransactionStatus::Closed;
    }

    /// Energy consumed in Wh, once stopped.
    pub fn energy_consumed(&self) -> Option<i32> {
        self.meter_stop.map(|stop| stop - self.meter_start)
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            TransactionStatus::Pending | TransactionStatus::Active | TransactionStatus::Stopping
        )
    }

    pub fn is_closed(&self) -> bool {
        self.status == TransactionStatus::Closed
    }
}

/// A single metering sample, append-only and tied to one transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterSample {
    pub transaction_id: i32,
    pub timestamp: DateTime<Utc>,
    pub value: String,
    pub unit: Option<String>,
    pub measurand: Option<String>,
}
