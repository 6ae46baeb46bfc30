//!
//! OCPP 1.6 central system for EV charge points.
//! Reads configuration from TOML file (~/.config/ocpp-csms/config.toml).

use std::sync::Arc;

use tracing::{error, info};

use ocpp_csms::application::{EngineConfig, TransactionEngine};
use ocpp_csms::infrastructure::{MemoryAuthProvider, MemoryPersistence, OcppServer};
use ocpp_csms::session::ConnectionRegistry;
use ocpp_csms::support::{listen_for_shutdown_signals, RetryConfig, ShutdownSignal};
use ocpp_csms::{default_config_path, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // ── Load configuration ─────────────────────────────────────
    let config_path = std::env::var("OCPP_CSMS_CONFIG")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| default_config_path());
    let config = match AppConfig::load(&config_path) {
        Ok(cfg) => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level)),
                )
                .init();
            info!("Configuration loaded from {}", config_path.display());
            cfg
        }
        Err(e) => {
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
                .init();
            error!("Failed to load config: {}. Using defaults.", e);
            AppConfig::default()
        }
    };

    info!("Starting OCPP 1.6 central system...");

    // ── Providers ──────────────────────────────────────────────
    // In-memory providers; deployments swap in database-backed ones
    // through the application::ports traits.
    let persistence = Arc::new(MemoryPersistence::new());
    let auth = Arc::new(MemoryAuthProvider::new());

    // ── Core services ──────────────────────────────────────────
    let engine = TransactionEngine::shared(
        persistence,
        auth,
        EngineConfig {
            boot_status: config.ocpp.boot_status.registration_status(),
            heartbeat_interval_secs: config.ocpp.heartbeat_interval_secs,
            retry: RetryConfig::default(),
        },
    );
    let registry = ConnectionRegistry::shared();

    // The command dispatcher and management surface are embedded by the
    // REST layer of a deployment; the standalone binary only runs the
    // OCPP-facing side.

    // ── Shutdown handling ──────────────────────────────────────
    let shutdown = ShutdownSignal::new();
    tokio::spawn(listen_for_shutdown_signals(shutdown.clone()));

    // ── WebSocket server ───────────────────────────────────────
    let server = OcppServer::new(config, registry, engine).with_shutdown(shutdown);

    info!("Central system started. Press Ctrl+C to shutdown gracefully.");
    server.run().await?;

    info!("Central system shutdown complete");
    Ok(())
}
