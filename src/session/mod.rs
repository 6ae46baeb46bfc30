//! Session management: connection handles, registry and pending-call tracking

pub mod connection;
pub mod pending;
pub mod registry;

pub use connection::{Connection, SessionMessage};
pub use pending::{CallOutcome, PendingCallTracker};
pub use registry::{ConnectionRegistry, SharedConnectionRegistry};
