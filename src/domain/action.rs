//! OCPP 1.6 actions and message payloads
//!
//! The action set is a closed enum: new actions are added by extending
//! [`Action`], never by string-keyed runtime registration. Payloads are
//! typed serde structs using the OCPP camelCase wire names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Actions ────────────────────────────────────────────────────

/// The OCPP 1.6 actions this central system understands.
///
/// The first group arrives as Calls from the charge point; the second are
/// Calls the central system sends (remote commands).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    // Charge point → central system
    BootNotification,
    Authorize,
    StartTransaction,
    StopTransaction,
    MeterValues,
    StatusNotification,
    Heartbeat,
    SecurityEventNotification,
    // Central system → charge point
    RemoteStartTransaction,
    RemoteStopTransaction,
    Reset,
    UnlockConnector,
    ChangeConfiguration,
}

impl Action {
    /// Resolve a wire action name; `None` for unrecognized actions.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "BootNotification" => Some(Self::BootNotification),
            "Authorize" => Some(Self::Authorize),
            "StartTransaction" => Some(Self::StartTransaction),
            "StopTransaction" => Some(Self::StopTransaction),
            "MeterValues" => Some(Self::MeterValues),
            "StatusNotification" => Some(Self::StatusNotification),
            "Heartbeat" => Some(Self::Heartbeat),
            "SecurityEventNotification" => Some(Self::SecurityEventNotification),
            "RemoteStartTransaction" => Some(Self::RemoteStartTransaction),
            "RemoteStopTransaction" => Some(Self::RemoteStopTransaction),
            "Reset" => Some(Self::Reset),
            "UnlockConnector" => Some(Self::UnlockConnector),
            "ChangeConfiguration" => Some(Self::ChangeConfiguration),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::BootNotification => "BootNotification",
            Self::Authorize => "Authorize",
            Self::StartTransaction => "StartTransaction",
            Self::StopTransaction => "StopTransaction",
            Self::MeterValues => "MeterValues",
            Self::StatusNotification => "StatusNotification",
            Self::Heartbeat => "Heartbeat",
            Self::SecurityEventNotification => "SecurityEventNotification",
            Self::RemoteStartTransaction => "RemoteStartTransaction",
            Self::RemoteStopTransaction => "RemoteStopTransaction",
            Self::Reset => "Reset",
            Self::UnlockConnector => "UnlockConnector",
            Self::ChangeConfiguration => "ChangeConfiguration",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Shared wire enums ──────────────────────────────────────────

/// BootNotification registration status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Accepted,
    Pending,
    Rejected,
}

/// idTag authorization status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorizationStatus {
    Accepted,
    Blocked,
    Expired,
    Invalid,
    ConcurrentTx,
}

/// Generic Accepted/Rejected status used by remote command responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteCommandStatus {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdTagInfo {
    pub status: AuthorizationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id_tag: Option<String>,
}

impl IdTagInfo {
    pub fn new(status: AuthorizationStatus) -> Self {
        Self {
            status,
            expiry_date: None,
            parent_id_tag: None,
        }
    }
}

// ── Charge point → central system payloads ─────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub charge_point_vendor: String,
    pub charge_point_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_point_serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub status: RegistrationStatus,
    pub current_time: DateTime<Utc>,
    /// Heartbeat interval in seconds.
    pub interval: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeRequest {
    pub id_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeResponse {
    pub id_tag_info: IdTagInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionRequest {
    pub connector_id: u32,
    pub id_tag: String,
    pub meter_start: i32,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionResponse {
    pub transaction_id: i32,
    pub id_tag_info: IdTagInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTransactionRequest {
    pub transaction_id: i32,
    pub meter_stop: i32,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_tag: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTransactionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_tag_info: Option<IdTagInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampledValue {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measurand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterValue {
    pub timestamp: DateTime<Utc>,
    pub sampled_value: Vec<SampledValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterValuesRequest {
    pub connector_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i32>,
    pub meter_value: Vec<MeterValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotificationRequest {
    pub connector_id: u32,
    pub status: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: DateTime<Utc>,
}

/// Station-pushed security event (security whitepaper extension). Fields
/// are kept loose: stations in the field vary in what they send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEventNotificationRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tech_info: Option<String>,
}

// ── Central system → charge point payloads ─────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStartTransactionRequest {
    pub id_tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStopTransactionRequest {
    pub transaction_id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetKind {
    Hard,
    Soft,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetRequest {
    #[serde(rename = "type")]
    pub kind: ResetKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockConnectorRequest {
    pub connector_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeConfigurationRequest {
    pub key: String,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_names_roundtrip() {
        for action in [
            Action::BootNotification,
            Action::Authorize,
            Action::StartTransaction,
            Action::StopTransaction,
            Action::MeterValues,
            Action::StatusNotification,
            Action::Heartbeat,
            Action::SecurityEventNotification,
            Action::RemoteStartTransaction,
            Action::RemoteStopTransaction,
            Action::Reset,
            Action::UnlockConnector,
            Action::ChangeConfiguration,
        ] {
            assert_eq!(Action::from_name(action.name()), Some(action));
        }
    }

    #[test]
    fn unknown_action_is_none() {
        assert_eq!(Action::from_name("DataTransfer"), None);
        assert_eq!(Action::from_name(""), None);
    }

    #[test]
    fn start_transaction_request_uses_wire_names() {
        let json = r#"{"connectorId":1,"idTag":"ABC","meterStart":100,"timestamp":"2024-01-01T00:00:00Z"}"#;
        let req: StartTransactionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.connector_id, 1);
        assert_eq!(req.id_tag, "ABC");
        assert_eq!(req.meter_start, 100);
    }

    #[test]
    fn reset_request_serializes_type_field() {
        let req = ResetRequest {
            kind: ResetKind::Soft,
        };
        assert_eq!(serde_json::to_string(&req).unwrap(), r#"{"type":"Soft"}"#);
    }

    #[test]
    fn id_tag_info_skips_absent_fields() {
        let info = IdTagInfo::new(AuthorizationStatus::Accepted);
        assert_eq!(
            serde_json::to_string(&info).unwrap(),
            r#"{"status":"Accepted"}"#
        );
    }
}
