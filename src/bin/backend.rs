#![forbid(unsafe_code)]

//! HTTP entry point: resolves configuration, prepares the storage directory
//! and serves the download API until Ctrl+C.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result, bail};
use clap::Parser;
use nix::unistd::Uid;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use vidfetch::{
    api::{self, AppState},
    config::{RuntimeOverrides, resolve_runtime_config},
    extractor::YtDlp,
    storage::Storage,
};

const DEFAULT_LOG_FILTER: &str = "vidfetch=info,backend=info,tower_http=info";

#[derive(Debug, Parser)]
#[command(name = "backend", about = "Fetch and serve videos through yt-dlp")]
struct BackendArgs {
    /// Directory downloads are stored in and served from.
    #[arg(long)]
    storage_dir: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Path or name of the yt-dlp executable.
    #[arg(long = "yt-dlp")]
    ytdlp: Option<PathBuf>,
    /// dotenv-style file consulted after the process environment.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl From<BackendArgs> for RuntimeOverrides {
    fn from(args: BackendArgs) -> Self {
        Self {
            storage_dir: args.storage_dir,
            host: args.host,
            port: args.port,
            ytdlp_program: args.ytdlp,
            env_path: args.env_file,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = BackendArgs::parse();

    refuse_privileged(Uid::effective())?;

    let config = resolve_runtime_config(args.into())?;
    let storage = Storage::open(&config.storage_dir).with_context(|| {
        format!(
            "preparing storage directory {}",
            config.storage_dir.display()
        )
    })?;
    tracing::info!(
        root = %storage.root().display(),
        yt_dlp = %config.ytdlp_program.display(),
        "storage ready"
    );

    let extractor = Arc::new(YtDlp::new(config.ytdlp_program));
    let app = api::router(AppState::new(storage, extractor));

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("binding to {}:{}", config.host, config.port))?;
    let addr = listener.local_addr().context("reading bound address")?;
    tracing::info!("API server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    tracing::info!("server stopped");
    Ok(())
}

/// The backend spawns yt-dlp on client-supplied URLs and writes wherever
/// its storage directory points, so it only runs from an unprivileged
/// account.
fn refuse_privileged(uid: Uid) -> Result<()> {
    if uid.is_root() {
        bail!("backend refuses to run as root; start it from an unprivileged account");
    }
    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    // Without a handler the process still dies on Ctrl+C, just not gracefully.
    if let Err(err) = signal::ctrl_c().await {
        tracing::warn!("failed to install Ctrl+C handler: {err}");
    }
}
