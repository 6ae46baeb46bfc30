//! # OCPP Central System — session & transaction engine
//!
//! OCPP 1.6 (OCPP-J) central system core: terminates persistent WebSocket
//! connections from charge points, correlates Call/CallResult/CallError
//! frames, tracks the live connection per charge point and drives the
//! charging-transaction state machine per connector.
//!
//! ## Architecture
//!
//! - **support**: protocol framing, retry helper, shutdown signal
//! - **domain**: OCPP actions, payloads and business entities
//! - **session**: connection handle, connection registry, pending-call tracker
//! - **application**: session actor, transaction engine, command dispatcher,
//!   management surface, provider traits
//! - **infrastructure**: WebSocket server, in-memory providers
//!
//! REST routing, token issuance and the database engine live outside this
//! crate; they are consumed through the [`application::ports`] traits.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod session;
pub mod support;

pub use config::{default_config_path, AppConfig};
