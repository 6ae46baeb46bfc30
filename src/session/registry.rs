//! Connection registry — the single live connection per charge point

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use super::connection::Connection;

/// Thread-safe registry of active charge point connections.
///
/// Exactly one connection per charge point identity: attaching a new
/// connection for an identity already present evicts the previous one and
/// hands it back so the caller can close the superseded socket.
pub struct ConnectionRegistry {
    sessions: DashMap<String, Connection>,
}

/// Shared, reference-counted connection registry
pub type SharedConnectionRegistry = Arc<ConnectionRegistry>;

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Wrap in `Arc` for shared ownership
    pub fn shared() -> SharedConnectionRegistry {
        Arc::new(Self::new())
    }

    /// Register a connection, returning the evicted one if this identity
    /// was already connected.
    pub fn attach(&self, connection: Connection) -> Option<Connection> {
        let charge_point_id = connection.charge_point_id.clone();
        info!(
            charge_point_id = charge_point_id.as_str(),
            connection_id = connection.connection_id,
            ocpp_version = %connection.ocpp_version,
            "Attaching charge point connection"
        );
        let replaced = self.sessions.insert(charge_point_id.clone(), connection);
        if replaced.is_some() {
            warn!(
                charge_point_id = charge_point_id.as_str(),
                "Superseding existing connection for reconnecting charge point"
            );
        }
        replaced
    }

    /// Remove a connection, but only if `connection_id` still matches the
    /// registered one. A stale session task detaching after a newer
    /// connection attached is a no-op.
    pub fn detach(&self, charge_point_id: &str, connection_id: u64) -> bool {
        let removed = self
            .sessions
            .remove_if(charge_point_id, |_, conn| {
                conn.connection_id == connection_id
            })
            .is_some();
        if removed {
            info!(charge_point_id, connection_id, "Detached charge point connection");
        } else {
            warn!(
                charge_point_id,
                connection_id, "Skipped detach: connection superseded or already gone"
            );
        }
        removed
    }

    /// Get a handle to the live connection for a charge point.
    pub fn lookup(&self, charge_point_id: &str) -> Option<Connection> {
        self.sessions.get(charge_point_id).map(|c| c.clone())
    }

    /// Send a serialized frame to a specific charge point.
    pub fn send_to(&self, charge_point_id: &str, message: String) -> Result<(), String> {
        match self.sessions.get(charge_point_id) {
            Some(conn) => conn.send(message),
            None => Err(format!("Charge point {} not connected", charge_point_id)),
        }
    }

    /// Update last activity for a charge point.
    pub fn touch(&self, charge_point_id: &str) {
        if let Some(mut conn) = self.sessions.get_mut(charge_point_id) {
            conn.touch();
        }
    }

    /// Check if a charge point is currently connected.
    pub fn is_connected(&self, charge_point_id: &str) -> bool {
        self.sessions.contains_key(charge_point_id)
    }

    /// All connected charge point IDs.
    pub fn connected_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|r| r.key().clone()).collect()
    }

    /// Visit every live connection.
    pub fn for_each(&self, mut visitor: impl FnMut(&Connection)) {
        for entry in self.sessions.iter() {
            visitor(entry.value());
        }
    }

    /// IDs of connections with no activity for `threshold_seconds`.
    pub fn stale_ids(&self, threshold_seconds: i64) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|entry| entry.is_stale(threshold_seconds))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of active connections.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
