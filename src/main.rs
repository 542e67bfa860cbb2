//! # Speech Gateway - Main Application Entry Point
//!
//! This is the main entry point for the speech-gateway server. It bridges
//! browser clients to the upstream speech cloud for streaming recognition and
//! synthesis, and sets up an Actix-web HTTP server with the following pieces:
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: The entire application is asynchronous; thousands of
//!   sessions share a handful of threads
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **Result<T, E>**: Error handling using Rust's Result type
//! - **Arc & RwLock**: Thread-safe shared state management
//! - **trait objects**: The upstream transport sits behind `dyn UpstreamConnector`
//!
//! ## Application Architecture:
//! - **config**: Handles application configuration (TOML files + environment variables)
//! - **state**: Shared application state, metrics and the client directory
//! - **upstream**: Signed URLs, wire format and the WebSocket transport to the speech cloud
//! - **session**: Recognition and synthesis state machines plus the session registry
//! - **websocket**: The client gateway, one actor per browser connection
//! - **health**: Provides system health monitoring endpoints
//! - **handlers**: HTTP request handlers for API endpoints
//! - **error**: Custom error types and HTTP error responses

// Module declarations - These tell Rust about our other source files
mod config; // Configuration management (config.rs)
mod error; // Error handling types (error.rs)
mod handlers; // HTTP request handlers (handlers/ directory)
mod health; // Health check endpoints (health.rs)
mod session; // Session state machines and registry (session/ directory)
mod state; // Application state management (state.rs)
mod upstream; // Upstream speech cloud client (upstream/ directory)
mod websocket; // Client gateway (websocket.rs)

// External crate imports - These are dependencies from Cargo.toml
use actix_cors::Cors; // Cross-Origin Resource Sharing support
use actix_web::{web, App, HttpServer}; // Web framework
use anyhow::Result; // Better error handling with context
use config::AppConfig; // Our custom configuration struct
use state::AppState; // Our custom application state
use std::sync::Arc;
use tracing::{error, info, warn}; // Structured logging
use tracing_actix_web::TracingLogger; // One span per HTTP request
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt}; // Logging setup
use upstream::WsConnector;

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Creates shared application state** (fails fast on missing credentials)
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown**: stops accepting connections, then tears
///    down every live session so no upstream connection is left open
///
/// ## Key Rust Concepts:
/// - `#[actix_web::main]`: This macro sets up the async runtime
/// - `?`: The question mark operator automatically returns early if there's an error
#[actix_web::main]
async fn main() -> Result<()> {
    // .ok() means "ignore errors" - it's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting speech-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    info!(
        min_capture_ms = config.endpointing.min_capture_ms,
        idle_timeout_ms = config.endpointing.idle_timeout_ms,
        max_sessions = config.performance.max_concurrent_sessions,
        "Session limits"
    );

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = AppState::new(config, Arc::new(WsConnector))?;

    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        // Configure CORS (Cross-Origin Resource Sharing) to allow web browsers to connect
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .route("/ws", web::get().to(websocket::gateway_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/tts/synthesize", web::post().to(handlers::synthesize)),
            )
            // Also provide health check at root level for convenience
            .route("/health", web::get().to(health::health_check))
    })
    // Signals are handled below so sessions can be drained after the server stops.
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Wait for either the server to finish OR a shutdown signal
    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    let live = app_state.registry().len();
    if live > 0 {
        info!(sessions = live, "Closing remaining sessions");
    }
    app_state.registry().shutdown_all().await;

    let metrics = app_state.metrics.snapshot();
    if metrics.upstream_open() > 0 {
        warn!(open = metrics.upstream_open(), "Upstream connections still open at exit");
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "info", "speech_gateway=trace")
/// - If not set, defaults to "speech_gateway=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "speech_gateway=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
///
/// ## Rust Concepts:
/// - **tokio::select!**: Waits for whichever signal comes first
/// - **#[cfg(unix)]**: SIGTERM only exists on Unix; elsewhere that branch never resolves
async fn wait_for_shutdown() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
