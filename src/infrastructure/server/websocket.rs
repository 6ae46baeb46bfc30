//! WebSocket server for OCPP connections
//!
//! One tokio task per charge point connection. The task owns the socket:
//! it feeds inbound frames to the session actor in arrival order, pumps
//! outbound frames from the connection channel, sweeps the pending-call
//! tracker on a timer and runs disconnect cleanup exactly once. A heartbeat
//! watchdog closes connections that have gone silent past the advertised
//! interval plus grace.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::application::{SessionActor, SharedTransactionEngine};
use crate::config::{AppConfig, OcppConfig};
use crate::domain::OcppVersion;
use crate::session::{Connection, SessionMessage, SharedConnectionRegistry};
use crate::support::ShutdownSignal;

/// OCPP 1.6 WebSocket subprotocol
const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

/// OCPP WebSocket server
pub struct OcppServer {
    config: AppConfig,
    registry: SharedConnectionRegistry,
    engine: SharedTransactionEngine,
    shutdown_signal: Option<ShutdownSignal>,
}

impl OcppServer {
    pub fn new(
        config: AppConfig,
        registry: SharedConnectionRegistry,
        engine: SharedTransactionEngine,
    ) -> Self {
        Self {
            config,
            registry,
            engine,
            shutdown_signal: None,
        }
    }

    /// Set the shutdown signal for graceful shutdown
    pub fn with_shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown_signal = Some(signal);
        self
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = self.config.server.address();
        let listener = TcpListener::bind(&addr).await?;

        info!(address = addr.as_str(), "OCPP 1.6 central system listening");
        info!(
            "Charge points connect to ws://{}/ocpp/{{charge_point_id}}",
            addr
        );

        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let watchdog = self.spawn_watchdog();

        let result = match self.shutdown_signal.clone() {
            Some(signal) => self.accept_until_shutdown(listener, signal).await,
            None => self.accept_loop(listener).await,
        };

        watchdog.abort();
        result
    }

    async fn accept_loop(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => self.spawn_connection(stream, addr),
                Err(e) => error!(error = %e, "Failed to accept connection"),
            }
        }
    }

    async fn accept_until_shutdown(
        &self,
        listener: TcpListener,
        shutdown: ShutdownSignal,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.spawn_connection(stream, addr),
                        Err(e) => error!(error = %e, "Failed to accept connection"),
                    }
                }
                _ = shutdown.notified().wait() => {
                    info!("WebSocket server received shutdown signal");
                    self.graceful_shutdown().await;
                    return Ok(());
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let config = self.config.ocpp.clone();
        let registry = self.registry.clone();
        let engine = self.engine.clone();
        let shutdown = self.shutdown_signal.clone();

        tokio::spawn(async move {
            if let Err(e) =
                handle_connection(stream, addr, config, registry, engine, shutdown).await
            {
                warn!(remote = %addr, error = %e, "Connection ended with error");
            }
        });
    }

    /// Closes connections whose last activity is older than the advertised
    /// heartbeat interval plus the configured grace.
    fn spawn_watchdog(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.registry.clone();
        let threshold =
            (self.config.ocpp.heartbeat_interval_secs + self.config.ocpp.heartbeat_grace_secs) as i64;
        let period = Duration::from_secs(self.config.ocpp.heartbeat_grace_secs.max(1) as u64);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                for charge_point_id in registry.stale_ids(threshold) {
                    warn!(
                        charge_point_id = charge_point_id.as_str(),
                        threshold_secs = threshold,
                        "Heartbeat watchdog closing silent connection"
                    );
                    if let Some(connection) = registry.lookup(&charge_point_id) {
                        connection.request_close();
                    }
                }
            }
        })
    }

    async fn graceful_shutdown(&self) {
        let count = self.registry.count();
        if count > 0 {
            info!(connections = count, "Closing charge point connections");
            self.registry.for_each(|connection| connection.request_close());
            // Give the connection tasks a moment to flush Close frames.
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        info!("WebSocket server stopped");
    }
}

/// Extract the charge point identity from the request path.
/// Accepted formats: /ocpp/{charge_point_id} or /{charge_point_id}
fn extract_charge_point_id(path: &str) -> Option<String> {
    let path = path.trim_start_matches('/');

    if let Some(id) = path.strip_prefix("ocpp/") {
        let id = id.trim_start_matches('/');
        if !id.is_empty() && !id.contains('/') {
            return Some(id.to_string());
        }
        return None;
    }

    if !path.is_empty() && !path.contains('/') {
        return Some(path.to_string());
    }

    None
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    config: OcppConfig,
    registry: SharedConnectionRegistry,
    engine: SharedTransactionEngine,
    shutdown: Option<ShutdownSignal>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut charge_point_id: Option<String> = None;

    let ws_stream =
        tokio_tungstenite::accept_hdr_async(stream, |req: &Request, mut response: Response| {
            let path = req.uri().path();

            match extract_charge_point_id(path) {
                Some(id) => charge_point_id = Some(id),
                None => {
                    warn!(remote = %addr, path, "Rejecting connection without charge point identity");
                    let mut reject =
                        ErrorResponse::new(Some("Missing charge point identity in path".to_string()));
                    *reject.status_mut() = StatusCode::BAD_REQUEST;
                    return Err(reject);
                }
            }

            let offered = req
                .headers()
                .get("Sec-WebSocket-Protocol")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");

            if offered.split(',').map(str::trim).any(|p| p == OCPP_SUBPROTOCOL) {
                response.headers_mut().insert(
                    "Sec-WebSocket-Protocol",
                    HeaderValue::from_static(OCPP_SUBPROTOCOL),
                );
            } else {
                warn!(
                    remote = %addr,
                    offered, "Client did not offer the ocpp1.6 subprotocol"
                );
            }

            Ok(response)
        })
        .await?;

    let Some(charge_point_id) = charge_point_id else {
        return Ok(());
    };

    info!(
        charge_point_id = charge_point_id.as_str(),
        remote = %addr,
        "Charge point connected"
    );

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<SessionMessage>();

    let connection = Connection::new(charge_point_id.clone(), tx, OcppVersion::V16);
    let connection_id = connection.connection_id;

    // A reconnecting charge point supersedes its previous socket.
    if let Some(evicted) = registry.attach(connection.clone()) {
        evicted.pending.fail_all();
        evicted.request_close();
    }
    engine.connection_established(&charge_point_id).await;

    let actor = SessionActor::new(connection.clone(), engine.clone());

    // Outbound pump: sole writer of the socket sink.
    let cp_send = charge_point_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message {
                SessionMessage::Frame(text) => {
                    debug!(charge_point_id = cp_send.as_str(), frame = text.as_str(), "outbound");
                    if let Err(e) = ws_sender.send(Message::Text(text)).await {
                        error!(charge_point_id = cp_send.as_str(), error = %e, "Send failed");
                        break;
                    }
                }
                SessionMessage::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let shutdown_wait = async {
        match shutdown {
            Some(signal) => signal.notified().wait().await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(shutdown_wait);

    let mut sweep = tokio::time::interval(Duration::from_secs(config.sweep_interval_secs.max(1)));

    loop {
        tokio::select! {
            message = ws_receiver.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        debug!(
                            charge_point_id = charge_point_id.as_str(),
                            frame = text.as_str(),
                            "inbound"
                        );
                        registry.touch(&charge_point_id);
                        if let Some(reply) = actor.handle(&text).await {
                            if connection.send(reply).is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        registry.touch(&charge_point_id);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!(
                            charge_point_id = charge_point_id.as_str(),
                            bytes = data.len(),
                            "Ignoring binary message"
                        );
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(charge_point_id = charge_point_id.as_str(), error = %e, "WebSocket error");
                        break;
                    }
                }
            }
            _ = sweep.tick() => {
                connection.pending.sweep(Instant::now());
            }
            _ = &mut shutdown_wait => {
                info!(
                    charge_point_id = charge_point_id.as_str(),
                    "Closing connection for server shutdown"
                );
                break;
            }
        }
    }

    // Detach is guarded by the connection ID: when a newer connection has
    // already superseded this one, its state must not be torn down.
    let was_registered = registry.detach(&charge_point_id, connection_id);
    connection.pending.fail_all();
    if was_registered {
        engine.connection_lost(&charge_point_id).await;
    }

    connection.request_close();
    let _ = send_task.await;

    info!(charge_point_id = charge_point_id.as_str(), "Charge point disconnected");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::{EngineConfig, TransactionEngine};
    use crate::infrastructure::memory::{MemoryAuthProvider, MemoryPersistence};
    use crate::session::ConnectionRegistry;
    use crate::support::OcppFrame;
    use std::sync::Arc;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    #[test]
    fn extracts_identity_from_path() {
        assert_eq!(extract_charge_point_id("/ocpp/CP-1"), Some("CP-1".to_string()));
        assert_eq!(extract_charge_point_id("/CP-1"), Some("CP-1".to_string()));
        assert_eq!(extract_charge_point_id("/"), None);
        assert_eq!(extract_charge_point_id("/ocpp/"), None);
        assert_eq!(extract_charge_point_id("/ocpp/a/b"), None);
    }

    async fn start_server() -> (SocketAddr, SharedConnectionRegistry) {
        let registry = ConnectionRegistry::shared();
        let engine = TransactionEngine::shared(
            Arc::new(MemoryPersistence::new()),
            Arc::new(MemoryAuthProvider::with_tags(&["ABC"])),
            EngineConfig::default(),
        );
        let server = Arc::new(OcppServer::new(
            AppConfig::default(),
            registry.clone(),
            engine,
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            server.serve(listener).await.unwrap();
        });

        (addr, registry)
    }

    async fn connect(
        addr: SocketAddr,
        charge_point_id: &str,
    ) -> WebSocketStream<MaybeTlsStream<TcpStream>> {
        let mut request = format!("ws://{}/ocpp/{}", addr, charge_point_id)
            .into_client_request()
            .unwrap();
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(OCPP_SUBPROTOCOL),
        );

        let (ws, response) = connect_async(request).await.unwrap();
        assert_eq!(
            response
                .headers()
                .get("Sec-WebSocket-Protocol")
                .and_then(|v| v.to_str().ok()),
            Some(OCPP_SUBPROTOCOL)
        );
        ws
    }

    #[tokio::test]
    async fn boot_notification_round_trip() {
        let (addr, registry) = start_server().await;
        let mut ws = connect(addr, "CP-WS-1").await;

        ws.send(Message::Text(
            r#"[2,"b1","BootNotification",{"chargePointVendor":"V","chargePointModel":"M"}]"#
                .to_string(),
        ))
        .await
        .unwrap();

        let reply = ws.next().await.unwrap().unwrap();
        let text = match reply {
            Message::Text(text) => text,
            other => panic!("expected text frame, got {:?}", other),
        };

        match OcppFrame::parse(&text).unwrap() {
            OcppFrame::CallResult { unique_id, payload } => {
                assert_eq!(unique_id, "b1");
                assert_eq!(payload["status"], "Accepted");
                assert_eq!(payload["interval"], 300);
            }
            other => panic!("expected CallResult, got {:?}", other),
        }

        assert!(registry.is_connected("CP-WS-1"));
    }

    #[tokio::test]
    async fn reconnect_supersedes_previous_socket() {
        let (addr, registry) = start_server().await;

        let mut first = connect(addr, "CP-WS-2").await;
        let _second = connect(addr, "CP-WS-2").await;

        // The first socket is closed by the server once the second attaches.
        loop {
            match first.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }

        assert_eq!(registry.count(), 1);
        assert!(registry.is_connected("CP-WS-2"));
    }

    #[tokio::test]
    async fn missing_identity_is_rejected() {
        let (addr, _registry) = start_server().await;
        let request = format!("ws://{}/", addr).into_client_request().unwrap();
        assert!(connect_async(request).await.is_err());
    }
}
