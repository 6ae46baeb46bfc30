//! OCPP-J message framing
//!
//! Implements the OCPP-J (JSON over WebSocket) transport envelope. The
//! framing is identical across OCPP versions:
//!
//! - **Call**       `[2, "<uniqueId>", "<action>", {<payload>}]`
//! - **CallResult** `[3, "<uniqueId>", {<payload>}]`
//! - **CallError**  `[4, "<uniqueId>", "<errorCode>", "<errorDescription>", {<errorDetails>}]`

use serde_json::Value;
use thiserror::Error;

// ── Message-type constants ─────────────────────────────────────

const MSG_TYPE_CALL: u64 = 2;
const MSG_TYPE_CALL_RESULT: u64 = 3;
const MSG_TYPE_CALL_ERROR: u64 = 4;

// ── OcppFrame ──────────────────────────────────────────────────

/// A parsed OCPP-J frame (version-agnostic transport envelope).
#[derive(Debug, Clone, PartialEq)]
pub enum OcppFrame {
    /// `[2, uniqueId, action, payload]`
    Call {
        unique_id: String,
        action: String,
        payload: Value,
    },
    /// `[3, uniqueId, payload]`
    CallResult {
        unique_id: String,
        payload: Value,
    },
    /// `[4, uniqueId, errorCode, errorDescription, errorDetails]`
    CallError {
        unique_id: String,
        error_code: String,
        error_description: String,
        error_details: Value,
    },
}

impl OcppFrame {
    // ── Parsing ────────────────────────────────────────────

    /// Parse a raw JSON text into an `OcppFrame`.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let arr: Vec<Value> =
            serde_json::from_str(text).map_err(|e| FrameError::MalformedFrame(e.to_string()))?;

        if arr.is_empty() {
            return Err(FrameError::MalformedFrame("empty message array".into()));
        }

        let msg_type = arr[0].as_u64().ok_or(FrameError::InvalidMessageType)?;

        match msg_type {
            MSG_TYPE_CALL => Self::parse_call(&arr),
            MSG_TYPE_CALL_RESULT => Self::parse_call_result(&arr),
            MSG_TYPE_CALL_ERROR => Self::parse_call_error(&arr),
            other => Err(FrameError::UnknownMessageKind(other)),
        }
    }

    fn parse_call(arr: &[Value]) -> Result<Self, FrameError> {
        if arr.len() < 4 {
            return Err(FrameError::MissingFields {
                expected: 4,
                got: arr.len(),
            });
        }

        let unique_id = arr[1]
            .as_str()
            .ok_or(FrameError::FieldTypeMismatch("uniqueId must be a string"))?
            .to_string();
        let action = arr[2]
            .as_str()
            .ok_or(FrameError::FieldTypeMismatch("action must be a string"))?
            .to_string();
        let payload = arr[3].clone();

        Ok(Self::Call {
            unique_id,
            action,
            payload,
        })
    }

    fn parse_call_result(arr: &[Value]) -> Result<Self, FrameError> {
        if arr.len() < 2 {
            return Err(FrameError::MissingFields {
                expected: 3,
                got: arr.len(),
            });
        }

        let unique_id = arr[1]
            .as_str()
            .ok_or(FrameError::FieldTypeMismatch("uniqueId must be a string"))?
            .to_string();
        // Some stations omit or null the payload on empty responses.
        let payload = match arr.get(2) {
            Some(Value::Null) | None => Value::Object(Default::default()),
            Some(v) => v.clone(),
        };

        Ok(Self::CallResult { unique_id, payload })
    }

    fn parse_call_error(arr: &[Value]) -> Result<Self, FrameError> {
        if arr.len() < 4 {
            return Err(FrameError::MissingFields {
                expected: 4,
                got: arr.len(),
            });
        }

        let unique_id = arr[1]
            .as_str()
            .ok_or(FrameError::FieldTypeMismatch("uniqueId must be a string"))?
            .to_string();
        let error_code = arr[2].as_str().unwrap_or("InternalError").to_string();
        let error_description = arr
            .get(3)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let error_details = arr
            .get(4)
            .cloned()
            .unwrap_or(Value::Object(Default::default()));

        Ok(Self::CallError {
            unique_id,
            error_code,
            error_description,
            error_details,
        })
    }

    // ── Serialization ──────────────────────────────────────

    /// Serialize this frame to a JSON string.
    pub fn serialize(&self) -> String {
        let arr: Value = match self {
            Self::Call {
                unique_id,
                action,
                payload,
            } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL.into()),
                Value::String(unique_id.clone()),
                Value::String(action.clone()),
                payload.clone(),
            ]),

            Self::CallResult { unique_id, payload } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL_RESULT.into()),
                Value::String(unique_id.clone()),
                payload.clone(),
            ]),

            Self::CallError {
                unique_id,
                error_code,
                error_description,
                error_details,
            } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL_ERROR.into()),
                Value::String(unique_id.clone()),
                Value::String(error_code.clone()),
                Value::String(error_description.clone()),
                error_details.clone(),
            ]),
        };

        // serde_json::to_string on a Value never fails
        serde_json::to_string(&arr).unwrap()
    }

    // ── Helpers ────────────────────────────────────────────

    /// Create a `CallResult` reply for a given unique ID.
    pub fn result_response(unique_id: impl Into<String>, payload: Value) -> Self {
        Self::CallResult {
            unique_id: unique_id.into(),
            payload,
        }
    }

    /// Create a `CallError` reply for a given unique ID.
    pub fn error_response(
        unique_id: impl Into<String>,
        error_code: impl Into<String>,
        error_description: impl Into<String>,
    ) -> Self {
        Self::CallError {
            unique_id: unique_id.into(),
            error_code: error_code.into(),
            error_description: error_description.into(),
            error_details: Value::Object(Default::default()),
        }
    }
}

// ── Errors ─────────────────────────────────────────────────────

/// Errors that can occur when parsing an OCPP-J frame.
///
/// All of these are answered with a `CallError` (when a unique ID is
/// recoverable) and leave the connection open.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Message type is not a number")]
    InvalidMessageType,

    #[error("Unknown message type: {0}")]
    UnknownMessageKind(u64),

    #[error("Expected at least {expected} fields, got {got}")]
    MissingFields { expected: usize, got: usize },

    #[error("Field type mismatch: {0}")]
    FieldTypeMismatch(&'static str),
}
