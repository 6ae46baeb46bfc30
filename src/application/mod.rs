//! Business logic: session actor, transaction engine, command dispatch

pub mod actor;
pub mod dispatcher;
pub mod engine;
pub mod management;
pub mod ports;

pub use actor::SessionActor;
pub use dispatcher::{CommandDispatcher, CommandError, SharedCommandDispatcher};
pub use engine::{EngineConfig, SharedTransactionEngine, TransactionEngine};
pub use management::{ManagementApi, ManagementError};
pub use ports::{AuthProvider, ConnectionEvent, PersistenceError, PersistenceProvider};
