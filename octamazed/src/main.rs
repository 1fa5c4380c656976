//! Octamaze Daemon - live multi-agent maze session
//!
//! This daemon runs one maze session continuously, managing:
//! - The tick loop and phase cycle
//! - Agent joins over WebSocket (`/join?id=`) and raw TCP lines
//! - The status page
//!
//! Configuration is read from `config.json` in the data directory
//! (`OCTAMAZE_CONFIG` overrides the path) at start and on every restart:
//! - Linux: ~/.local/share/octamaze/
//! - Windows: %APPDATA%\octamaze\
//! - MacOS: ~/Library/Application Support/octamaze/
//!
//! Signals: SIGHUP starts a fresh session with reloaded config, Ctrl-C stops.

use std::sync::Arc;

use octamaze::{
    CharsetValidator, DenyListValidator, FanoutSink, IdValidator, Lobby, LobbyHandle, LogSink,
    OctapodRegistry, StatusBoard,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config_file;
mod paths;
mod server;
mod transport;

use config_file::ConfigFile;
use paths::AppPaths;
use server::AppState;

fn deny_list() -> Vec<String> {
    std::env::var("OCTAMAZE_DENY_LIST")
        .map(|raw| raw.split(',').map(str::to_string).collect())
        .unwrap_or_default()
}

#[cfg(unix)]
fn spawn_reload_on_hangup(handle: LobbyHandle) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("SIGHUP: reloading config and restarting session");
            handle.request_restart();
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_handle: LobbyHandle) -> std::io::Result<()> {
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Setup application paths
    let paths = AppPaths::new()?;
    info!("Data directory: {:?}", paths.data_dir());
    info!("Config file: {:?}", paths.config_file());

    let config = Arc::new(ConfigFile::new(paths.config_file()));
    let initial = config.reload();

    let board = StatusBoard::new();
    let sink = FanoutSink::new()
        .with(Arc::new(board.clone()))
        .with(Arc::new(LogSink));
    let registry = OctapodRegistry::new(initial.outbound_queue, initial.max_idle_ticks);
    let validator: Arc<dyn IdValidator> =
        Arc::new(DenyListValidator::new(CharsetValidator::new(), deny_list()));

    let (lobby, handle) = Lobby::new(config, registry.clone(), Arc::new(sink));
    let lobby_task = tokio::spawn(lobby.run());

    spawn_reload_on_hangup(handle.clone())?;
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C: shutting down");
                handle.shutdown();
            }
        });
    }

    if let Ok(addr) = std::env::var("OCTAMAZE_LINE_ADDR") {
        let listener = TcpListener::bind(&addr).await?;
        info!("Line transport listening on {}", addr);
        let registry = registry.clone();
        let validator = validator.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = transport::serve_lines(listener, registry, validator).await {
                error!("line transport failed: {}", e);
                handle.shutdown();
            }
        });
    }

    let port = match std::env::var("PORT") {
        Ok(raw) => raw.parse::<u16>().map_err(|e| format!("invalid PORT {raw:?}: {e}"))?,
        Err(_) => 3000,
    };
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Octamaze daemon listening on 0.0.0.0:{}", port);

    let app = server::router(AppState {
        registry,
        validator,
        board,
    });
    let shutdown = handle.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.stopped().await })
        .await?;

    if let Err(e) = lobby_task.await {
        warn!("lobby task ended abnormally: {}", e);
    }
    info!("Octamaze daemon stopped");
    Ok(())
}
