//! codevec binary — thin CLI shell over the [`codevec_server`] library crate.

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use std::path::PathBuf;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use codevec_server::config::Config;
use codevec_server::mcp::run_stdio;
use codevec_server::mcp_http::{handle_health, handle_mcp_post, HttpContext};
use codevec_server::watch::spawn_periodic_rescan;
use codevec_server::{build_state, start_folders};

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Semantic code indexer and retrieval server — MCP server for AI coding agents.
#[derive(Parser)]
#[command(name = "codevec", version, about, long_about = None)]
struct Cli {
    /// Path to a codevec.toml configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run as MCP stdio server (for agent subprocesses)
    #[arg(long)]
    mcp: bool,

    /// Bind to 0.0.0.0 instead of 127.0.0.1 (localhost)
    #[arg(long)]
    bind_all: bool,
}

// ---------------------------------------------------------------------------
// Graceful shutdown signal
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("codevec=info".parse().expect("valid directive")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(err) => {
                error!(path = %path.display(), error = %err, "Failed to load configuration");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    let state = match build_state(config).await {
        Ok(state) => state,
        Err(err) => {
            error!(error = %err, "Startup failed");
            std::process::exit(1);
        }
    };

    info!(
        provider = state.config.embed_provider.as_str(),
        backend = state.config.vector_backend.as_str(),
        dim = state.config.vector_dimension,
        "Components ready"
    );

    // Reload persisted folders: guard re-check, watches, reconciling scans.
    start_folders(&state);
    spawn_periodic_rescan(
        &state.config,
        std::sync::Arc::clone(&state.meta),
        std::sync::Arc::clone(&state.pipeline),
    );

    if cli.mcp {
        run_stdio(std::sync::Arc::clone(&state)).await;
        state.pipeline.shutdown();
        return;
    }

    // HTTP mode: MCP endpoint + health, nothing else.
    let ctx = HttpContext { state: std::sync::Arc::clone(&state) };
    let app = Router::new()
        .route("/mcp", post(handle_mcp_post))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx);

    let bind_addr = if cli.bind_all { "0.0.0.0" } else { "127.0.0.1" };
    let explicit_port: Option<u16> = std::env::var("PORT").ok().and_then(|p| p.parse().ok());

    let listener = if let Some(port) = explicit_port {
        tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await.unwrap_or_else(|e| {
            error!(port = port, error = %e, "Could not bind to port");
            std::process::exit(1);
        })
    } else {
        // Auto-scan: try 8732..=8741
        const BASE: u16 = 8732;
        const RANGE: u16 = 10;
        let mut found = None;
        for port in BASE..BASE + RANGE {
            match tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await {
                Ok(listener) => {
                    found = Some(listener);
                    break;
                }
                Err(_) => continue,
            }
        }
        found.unwrap_or_else(|| {
            error!(range_start = BASE, range_end = BASE + RANGE - 1, "No free port found");
            eprintln!("  Try: PORT=<port> codevec");
            std::process::exit(1);
        })
    };

    let port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
    info!(port = port, "MCP HTTP transport at http://{bind_addr}:{port}/mcp");
    // Machine-readable line for scripts (not through tracing)
    eprintln!("CODEVEC_PORT={port}");

    if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        error!(error = %err, "Server error");
    }
    state.pipeline.shutdown();
}
