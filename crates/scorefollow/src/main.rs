//! scorefollow - score-following device service
//!
//! Subcommands:
//! - `scorefollow serve` - Run the HTTP/WebSocket service
//! - `scorefollow devices` - List audio (or MIDI) inputs
//! - `scorefollow config` - Print the effective configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use followconf::FollowConfig;
use scorefollow::devices;
use scorefollow::engine::DefaultEngineFactory;
use scorefollow::files::CloudFileProvider;
use scorefollow::telemetry;
use scorefollow::tuner::CpalCaptureOpener;
use scorefollow::web::{self, AppState};
use scorefollow::{AlignmentPool, PositionStore, SessionContext, TunerContext};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "scorefollow")]
#[command(about = "Live score-following and tuner service for the practice frontend")]
#[command(version)]
struct Cli {
    /// Config file replacing ./scorefollow.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WebSocket service
    Serve {
        /// HTTP port to bind (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// List input devices as JSON
    Devices {
        /// List MIDI inputs instead of audio inputs
        #[arg(long)]
        midi: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, sources) = FollowConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Serve { port } => serve(config, port).await,
        Commands::Devices { midi } => {
            let list = if midi {
                tokio::task::spawn_blocking(devices::list_midi_inputs).await?
            } else {
                tokio::task::spawn_blocking(devices::list_audio_inputs).await?
            };
            println!("{}", serde_json::to_string_pretty(&list)?);
            Ok(())
        }
        Commands::Config => {
            for path in &sources.files {
                println!("# loaded: {}", path.display());
            }
            for var in &sources.env_overrides {
                println!("# env: {}", var);
            }
            print!("{}", config.to_toml());
            Ok(())
        }
    }
}

async fn serve(config: FollowConfig, port: Option<u16>) -> Result<()> {
    telemetry::init(&config.infra.telemetry).context("Failed to initialize telemetry")?;

    let mut bind = config.infra.bind.clone();
    if let Some(port) = port {
        bind.http_port = port;
    }

    let work_root = config.infra.paths.work_dir.clone();
    std::fs::create_dir_all(&work_root)
        .with_context(|| format!("Failed to create work directory {}", work_root.display()))?;

    let pool = AlignmentPool::start(Arc::new(DefaultEngineFactory))
        .context("Failed to start alignment worker")?;
    let files = CloudFileProvider::new(
        &config.infra.cloud.base_url,
        Duration::from_millis(config.infra.cloud.timeout_ms),
    )
    .context("Failed to create cloud client")?;

    let sessions = SessionContext {
        store: PositionStore::new_shared(),
        pool: Arc::new(pool),
        files: Arc::new(files),
        config: config.tuning.session.clone(),
        work_root,
    };
    let tuner = TunerContext {
        opener: Arc::new(CpalCaptureOpener),
        config: config.tuning.tuner.clone(),
    };
    let app = web::router(AppState::new(sessions, tuner), &config.infra.cors);

    let addr = bind.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("scorefollow listening on http://{}", addr);
    info!("   Score following: ws://{}/local/ws", addr);
    info!("   Tuner: ws://{}/local/ws/tuner/violin", addr);
    info!("   Cloud files: {}", config.infra.cloud.base_url);

    let shutdown_token = CancellationToken::new();
    let server_token = shutdown_token.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                server_token.cancelled().await;
                info!("Server shutdown signal received");
            })
            .await
    });

    shutdown_signal().await;
    shutdown_token.cancel();

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Server shutdown with error: {:?}", e),
        Err(e) => error!("Server task failed: {}", e),
    }

    info!("Shutdown complete");
    telemetry::shutdown();
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
