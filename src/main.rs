//! # Voice Relay Backend - Main Application Entry Point
//!
//! Accepts WebSocket voice sessions from browsers, collects each spoken
//! utterance, runs it through the food recommendation pipeline and streams
//! the spoken answer back over the same connection.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: The whole server runs on the actix/tokio runtime
//! - **actors**: Each WebSocket connection is an actix actor
//! - **channels**: Actors hand inbound frames to a per-connection dispatcher task
//! - **trait objects**: The pipeline is swappable behind `Arc<dyn ProcessingPipeline>`
//!
//! ## Application Architecture:
//! - **protocol**: Binary frame codec and typed messages
//! - **audio**: Inbound buffer, session registry, response streamer
//! - **dispatcher**: Per-connection utterance state machine
//! - **pipeline**: Transcription, intent analysis, restaurant search, speech
//! - **websocket**: Connection actor and `/ws` upgrade handler
//! - **config / state / health / handlers / middleware**: HTTP plumbing
//! - **error**: HTTP and protocol error types

mod audio;       // Buffer, registry, streamer (audio/ directory)
mod config;      // Configuration management (config.rs)
mod dispatcher;  // Per-connection frame loop (dispatcher.rs)
mod error;       // Error handling types (error.rs)
mod handlers;    // HTTP request handlers (handlers/ directory)
mod health;      // Health check endpoints (health.rs)
mod middleware;  // Custom middleware (middleware/ directory)
mod pipeline;    // Food recommendation pipeline (pipeline/ directory)
mod protocol;    // Wire format (protocol/ directory)
mod state;       // Application state management (state.rs)
mod websocket;   // WebSocket actor (websocket.rs)

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use pipeline::FoodRecommendationPipeline;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set by the signal handler task when the server should shut down.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from defaults, config.toml and the environment
/// 2. **Sets up logging** with an env-controlled filter
/// 3. **Builds the pipeline** and the shared application state
/// 4. **Configures the HTTP server** with middleware, REST routes and `/ws`
/// 5. **Handles graceful shutdown** on SIGINT/SIGTERM
#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        chunk_size = config.streaming.response_chunk_size,
        pacing_ms = config.streaming.chunk_pacing_ms,
        max_sessions = config.streaming.max_concurrent_sessions,
        "Configuration loaded"
    );

    let pipeline = FoodRecommendationPipeline::new(&config.pipeline)?;
    let app_state = AppState::new(config.clone(), Arc::new(pipeline));
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
            // Middleware runs in reverse order of registration for responses
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{session_id}", web::get().to(handlers::get_session)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws", web::get().to(websocket::voice_websocket))
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
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize tracing. `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Listen for SIGTERM and SIGINT and raise [`SHUTDOWN_SIGNAL`] on the first one.
fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers, falling back to Ctrl+C: {}", e);
                if tokio::signal::ctrl_c().await.is_ok() {
                    SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
                }
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Poll the shutdown flag every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
