#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! chatbridge — chat gateway to task-chat forwarding bridge.
//!
//! Keeps a heartbeated session open to the chat gateway, records every message
//! from watched channels, and forwards it to the mapped task-chat channel.
//!
//! # Subcommands
//!
//! - `serve` (default) — HTTP control API plus the gateway session
//! - `run` — gateway session only, in the foreground
//! - `retry` — one-shot retry of undelivered messages in the persisted store
//! - `status` — liveness marker and persisted message statistics

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use chatbridge::status::{pid_alive, read_marker};
use chatbridge::store::FileStore;
use chatbridge::{routes, AppState, Config, MessageStore};

#[derive(Parser)]
#[command(name = "chatbridge", version)]
struct Cli {
    /// Path to the TOML config file (default: ./chatbridge.toml if present)
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API and the gateway session (default)
    Serve,
    /// Run only the gateway session in the foreground
    Run,
    /// Retry failed and pending messages once and print the results
    Retry,
    /// Show whether a session is running and the stored message counts
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("chatbridge: {e}");
            return ExitCode::from(2);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_server(config).await,
        Commands::Run => run_foreground(config).await,
        Commands::Retry => run_retry(config).await,
        Commands::Status => show_status(&config).await,
    }
}

async fn build_state(config: Config) -> Option<AppState> {
    match AppState::from_config(config).await {
        Ok(state) => Some(state),
        Err(e) => {
            error!("Startup failed: {e}");
            None
        }
    }
}

async fn run_server(config: Config) -> ExitCode {
    info!("chatbridge v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key — set CHATBRIDGE_API_KEY or update config");
    }
    if config.channels.is_empty() {
        warn!("No channel routes configured, nothing will be forwarded");
    }

    let Some(state) = build_state(config).await else {
        return ExitCode::FAILURE;
    };
    let app = routes::router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    // A fatal failure of the autostarted session takes the process down.
    let fatal = CancellationToken::new();
    if state.config.server.autostart {
        match state.bridge.start().await {
            Ok(_) => {
                let bridge = state.bridge.clone();
                let shutdown = shutdown.clone();
                let fatal = fatal.clone();
                tokio::spawn(async move {
                    if let Some(Err(e)) = bridge.wait_session().await {
                        error!("Gateway session could not be established: {e}");
                        fatal.cancel();
                        shutdown.cancel();
                    }
                });
            }
            Err(e) => warn!("Gateway session not started: {e}"),
        }
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .expect("Server error");

    info!("Shutting down...");
    state.bridge.stop().await;
    info!("Goodbye");

    if fatal.is_cancelled() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn run_foreground(config: Config) -> ExitCode {
    info!("chatbridge v{} starting gateway session", env!("CARGO_PKG_VERSION"));
    let Some(state) = build_state(config).await else {
        return ExitCode::FAILURE;
    };
    if let Err(e) = state.bridge.start().await {
        error!("{e}");
        return ExitCode::FAILURE;
    }

    tokio::select! {
        () = shutdown_signal() => {
            state.bridge.stop().await;
            ExitCode::SUCCESS
        }
        result = state.bridge.wait_session() => match result {
            Some(Err(e)) => {
                error!("Gateway session could not be established: {e}");
                ExitCode::FAILURE
            }
            _ => ExitCode::SUCCESS,
        },
    }
}

async fn run_retry(config: Config) -> ExitCode {
    if let Some(pid) = read_marker(&config.marker_path()).filter(|pid| pid_alive(*pid)) {
        warn!("A gateway session is running (pid {pid}); prefer POST /api/messages/retry");
    }
    let Some(state) = build_state(config).await else {
        return ExitCode::FAILURE;
    };
    let results = state.bridge.pipeline().retry_failed().await;
    match serde_json::to_string_pretty(&results) {
        Ok(out) => {
            println!("{out}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn show_status(config: &Config) -> ExitCode {
    let pid = read_marker(&config.marker_path());
    let running = pid.is_some_and(pid_alive);
    let stats = match FileStore::open(config.messages_path(), config.store.capacity).await {
        Ok(store) => Some(store.stats().await),
        Err(e) => {
            warn!("Cannot read message store: {e}");
            None
        }
    };
    let report = json!({
        "running": running,
        "pid": pid.filter(|_| running),
        "messages": stats,
    });
    match serde_json::to_string_pretty(&report) {
        Ok(out) => {
            println!("{out}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
