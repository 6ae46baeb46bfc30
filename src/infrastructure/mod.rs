//! External concerns: WebSocket server, provider implementations

pub mod memory;
pub mod server;

pub use memory::{MemoryAuthProvider, MemoryPersistence};
pub use server::OcppServer;
