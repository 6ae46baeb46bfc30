//! WebSocket transport for OCPP-J connections

mod websocket;

pub use websocket::OcppServer;
