//! WebSocket connection abstraction

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::pending::PendingCallTracker;
use crate::domain::OcppVersion;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Message sent down a connection's outbound channel.
#[derive(Debug)]
pub enum SessionMessage {
    /// A serialized OCPP frame to write to the socket.
    Frame(String),
    /// Ask the owning session task to close the socket. Used by the
    /// registry when a new connection supersedes this one and by the
    /// heartbeat watchdog.
    Close,
}

/// Represents an active WebSocket connection to a charge point.
///
/// Cloning yields another handle to the same transport: the sender and the
/// pending-call tracker are shared, the timestamps are a snapshot.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Unique identifier for this connection instance; guards `detach`
    /// against a stale session task racing a newer connection.
    pub connection_id: u64,
    /// Charge point ID
    pub charge_point_id: String,
    /// Channel to the session task that owns the socket
    sender: mpsc::UnboundedSender<SessionMessage>,
    /// Negotiated OCPP protocol version for this connection
    pub ocpp_version: OcppVersion,
    /// Outstanding Calls sent to this charge point
    pub pending: Arc<PendingCallTracker>,
    /// When the connection was established
    pub connected_at: DateTime<Utc>,
    /// Last activity timestamp
    pub last_activity: DateTime<Utc>,
}

impl Connection {
    pub fn new(
        charge_point_id: impl Into<String>,
        sender: mpsc::UnboundedSender<SessionMessage>,
        ocpp_version: OcppVersion,
    ) -> Self {
        let now = Utc::now();
        Self {
            connection_id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            charge_point_id: charge_point_id.into(),
            sender,
            ocpp_version,
            pending: Arc::new(PendingCallTracker::new()),
            connected_at: now,
            last_activity: now,
        }
    }

    /// Send a serialized frame to the charge point.
    pub fn send(&self, message: String) -> Result<(), String> {
        self.sender
            .send(SessionMessage::Frame(message))
            .map_err(|e| format!("Failed to send message: {}", e))
    }

    /// Ask the owning session task to close the socket.
    pub fn request_close(&self) {
        let _ = self.sender.send(SessionMessage::Close);
    }

    /// Update last activity timestamp.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// True if no activity has been seen for `timeout_seconds`.
    pub fn is_stale(&self, timeout_seconds: i64) -> bool {
        let elapsed = Utc::now()
            .signed_duration_since(self.last_activity)
            .num_seconds();
        elapsed > timeout_seconds
    }
}
