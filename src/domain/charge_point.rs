//! Charge point and connector entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Negotiated OCPP protocol version for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OcppVersion {
    V16,
}

impl OcppVersion {
    /// WebSocket subprotocol identifier.
    pub fn subprotocol(&self) -> &'static str {
        match self {
            Self::V16 => "ocpp1.6",
        }
    }
}

impl std::fmt::Display for OcppVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.subprotocol())
    }
}

/// Availability status of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorStatus {
    /// No StatusNotification seen yet.
    Unknown,
    Available,
    Occupied,
    Reserved,
    Unavailable,
    Faulted,
}

impl ConnectorStatus {
    /// Map an OCPP 1.6 StatusNotification status string onto the internal
    /// availability states. `None` for unrecognized strings (logged and
    /// ignored by the caller).
    pub fn from_ocpp(status: &str) -> Option<Self> {
        match status {
            "Available" => Some(Self::Available),
            "Preparing" | "Charging" | "SuspendedEVSE" | "SuspendedEV" | "Finishing"
            | "Occupied" => Some(Self::Occupied),
            "Reserved" => Some(Self::Reserved),
            "Unavailable" => Some(Self::Unavailable),
            "Faulted" => Some(Self::Faulted),
            _ => None,
        }
    }
}

/// An individually addressable socket on a charge point.
///
/// Connector 0 addresses the charge point itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connector {
    pub id: u32,
    pub status: ConnectorStatus,
    pub error_code: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Connector {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            status: ConnectorStatus::Unknown,
            error_code: None,
            updated_at: Utc::now(),
        }
    }

    pub fn set_status(&mut self, status: ConnectorStatus, error_code: Option<String>) {
        self.status = status;
        self.error_code = error_code;
        self.updated_at = Utc::now();
    }
}

/// Identification data a charge point reports in BootNotification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargePointInfo {
    pub charge_point_id: String,
    pub vendor: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub booted_at: DateTime<Utc>,
}
