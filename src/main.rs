//! # Voice Agent Gateway - Main Application Entry Point
//!
//! Sets up the Actix-web server that fronts the voice agent: the `/ws`
//! session endpoint plus a small HTTP surface (health, metrics, weather
//! passthrough, tool proxy).
//!
//! ## Application Architecture:
//! - **config**: Configuration management (TOML files + environment variables)
//! - **state**: Shared application state, metrics, and wiring
//! - **auth**: Token validation for WebSocket admission
//! - **protocol**: The JSON envelope types exchanged with clients
//! - **session**: Per-client registry and the message router
//! - **comms**: Correlated request/response layers (commands, tool proxy)
//! - **wakeword**: Always-on wake word detection over idle audio
//! - **runner**: The conversation-engine seam
//! - **websocket**: The socket actor and admission handshake
//! - **handlers**: HTTP request handlers (weather, tools)
//! - **middleware**: Access logging and request metrics
//! - **error**: Error types and HTTP error responses

mod auth;
mod comms;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod protocol;
mod runner;
mod session;
mod state;
mod wakeword;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown signal, set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-agent-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{}",
        config.server.host, config.server.port
    );

    // Shared state is built once, outside the HttpServer closure, so every
    // worker sees the same registry and correlation layers.
    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

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
            .wrap(Logger::default())
            .wrap(middleware::HttpMetrics)
            .wrap(middleware::AccessLog)
            .route("/", web::get().to(health::server_info))
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/weather", web::get().to(handlers::current_weather))
            .route(
                "/tools/{client_id}/{namespace}",
                web::post().to(handlers::proxy_tool_request),
            )
            .route("/ws", web::get().to(websocket::session_websocket))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// `RUST_LOG` controls what gets logged; without it the default keeps this
/// crate at debug and actix at info.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_agent_gateway=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM/SIGINT and flip the shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
