//! # Voice Echo Backend - Main Application Entry Point
//!
//! A WebSocket endpoint for a telephony carrier's bidirectional media stream. Every call
//! gets a session that listens to the caller, waits for a pause, and plays the caller's
//! own audio back as the "agent" turn.
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (defaults, `config.toml`, environment)
//! - **protocol**: Carrier wire format, decoding inbound events and encoding replies
//! - **session**: Turn buffer, silence timer, per-call state machine and session registry
//! - **monitor**: Structured call records for tracing and the JSON-lines call log
//! - **websocket**: One actix actor per carrier connection
//! - **state / health / handlers**: Shared state and the small HTTP API around it
//! - **error**: HTTP and session error types

mod config;
mod error;
mod handlers;
mod health;
mod monitor;
mod protocol;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use monitor::{CallLogReporter, EventReporter, TracingReporter};
use session::SessionRegistry;
use state::AppState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** and the call event reporter
/// 3. **Creates the session registry** shared by every WebSocket connection
/// 4. **Configures the HTTP server** with the carrier stream route and the HTTP API
/// 5. **Handles graceful shutdown** on SIGINT/SIGTERM
#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-echo-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        ws_path = %config.server.ws_path,
        echo_mode = ?config.session.echo_mode,
        silence_threshold_ms = config.session.silence_threshold_ms,
        pacing_ms = config.session.pacing_ms,
        "Configuration loaded"
    );

    let reporter = build_reporter(&config);
    let registry = SessionRegistry::new(reporter);
    let app_state = AppState::new(config.clone(), registry);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let ws_path = config.server.ws_path.clone();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/health", web::get().to(health::health_check))
            // The carrier upgrades to a WebSocket here
            .route(&ws_path, web::get().to(websocket::carrier_stream))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        result = wait_for_shutdown() => {
            if let Err(e) = result {
                error!("Signal handling failed: {}", e);
            }
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize tracing.
///
/// `RUST_LOG` controls verbosity; without it the service logs its own events at debug
/// and actix at info. Per-frame media records are at debug under the `call_events`
/// target, so `RUST_LOG=voice_echo_backend=debug,call_events=info` hides them.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_echo_backend=debug,call_events=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Pick the call event reporter. The call log falls back to tracing only if it
/// cannot be set up.
fn build_reporter(config: &AppConfig) -> Arc<dyn EventReporter> {
    match config.logging.call_log_path() {
        Some(path) => match CallLogReporter::spawn(path) {
            Ok(reporter) => {
                info!("Call records appended to {}", path);
                Arc::new(reporter)
            }
            Err(e) => {
                warn!("Cannot create call log at {}: {}, using tracing only", path, e);
                Arc::new(TracingReporter)
            }
        },
        None => {
            info!("Call log disabled, call records go to tracing only");
            Arc::new(TracingReporter)
        }
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }

    Ok(())
}
