//! Pending-call tracking for central-system-initiated Calls
//!
//! One tracker per connection, owned by its session task. The command
//! dispatcher registers a call here before writing the frame and awaits the
//! oneshot resolution; the session task resolves entries when a matching
//! CallResult/CallError arrives, sweeps expired entries on its timer tick
//! and fails everything on transport loss. No entry outlives the connection.

use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Terminal outcome of a tracked Call.
#[derive(Debug)]
pub enum CallOutcome {
    /// CallResult payload from the charge point.
    Result(Value),
    /// CallError from the charge point.
    Error { code: String, description: String },
    /// No reply within the deadline.
    Timeout,
    /// The connection closed while the call was in flight.
    ConnectionLost,
}

#[derive(Debug)]
struct PendingCall {
    action: String,
    deadline: Instant,
    reply: oneshot::Sender<CallOutcome>,
}

/// Table of outstanding Calls awaiting a reply, keyed by message ID.
#[derive(Debug)]
pub struct PendingCallTracker {
    calls: DashMap<String, PendingCall>,
}

impl PendingCallTracker {
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
        }
    }

    /// Register an outgoing Call. Returns the generated message ID and the
    /// receiver that resolves exactly once with the call's outcome.
    pub fn register(
        &self,
        action: &str,
        timeout: Duration,
    ) -> (String, oneshot::Receiver<CallOutcome>) {
        let message_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.calls.insert(
            message_id.clone(),
            PendingCall {
                action: action.to_string(),
                deadline: Instant::now() + timeout,
                reply: tx,
            },
        );
        (message_id, rx)
    }

    /// Resolve a pending call with a CallResult payload. An unknown message
    /// ID is a stale reply: logged, otherwise a no-op.
    pub fn resolve(&self, message_id: &str, payload: Value) -> bool {
        match self.calls.remove(message_id) {
            Some((_, pending)) => {
                debug!(message_id, action = pending.action.as_str(), "Call resolved");
                let _ = pending.reply.send(CallOutcome::Result(payload));
                true
            }
            None => {
                warn!(message_id, "Stale reply for unknown pending call");
                false
            }
        }
    }

    /// Resolve a pending call with a CallError.
    pub fn resolve_error(&self, message_id: &str, code: &str, description: &str) -> bool {
        match self.calls.remove(message_id) {
            Some((_, pending)) => {
                warn!(
                    message_id,
                    action = pending.action.as_str(),
                    error_code = code,
                    "Call failed with CallError"
                );
                let _ = pending.reply.send(CallOutcome::Error {
                    code: code.to_string(),
                    description: description.to_string(),
                });
                true
            }
            None => {
                warn!(message_id, "Stale CallError for unknown pending call");
                false
            }
        }
    }

    /// Remove the entry for `message_id` without resolving it. Used by the
    /// dispatcher when the frame could not be written at all.
    pub fn cancel(&self, message_id: &str) {
        self.calls.remove(message_id);
    }

    /// Fail and remove every entry whose deadline has passed. Returns the
    /// number of expired calls.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .calls
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();

        for message_id in &expired {
            if let Some((_, pending)) = self.calls.remove(message_id) {
                warn!(
                    message_id = message_id.as_str(),
                    action = pending.action.as_str(),
                    "Pending call timed out"
                );
                let _ = pending.reply.send(CallOutcome::Timeout);
            }
        }
        expired.len()
    }

    /// Fail and remove every entry; called when the connection is lost.
    pub fn fail_all(&self) {
        let ids: Vec<String> = self.calls.iter().map(|e| e.key().clone()).collect();
        for message_id in ids {
            if let Some((_, pending)) = self.calls.remove(&message_id) {
                debug!(
                    message_id = message_id.as_str(),
                    action = pending.action.as_str(),
                    "Failing pending call: connection lost"
                );
                let _ = pending.reply.send(CallOutcome::ConnectionLost);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

impl Default for PendingCallTracker {
    fn default() -> Self {
        Self::new()
    }
}
