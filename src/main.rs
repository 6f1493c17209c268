use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

mod auth;
mod box_api;
mod config;
mod db;
mod error;
mod remote;
mod sync;
mod util;

use sync::driver::SyncDriver;
use sync::exclude::Exclude;
use sync::local_watcher::{LocalWatcher, WatcherOptions};
use sync::state::{self, EntryKind};
use sync::SyncEngine;

#[derive(Parser)]
#[command(name = "boxsync", version, about = "Keeps a local directory in sync with a Box.com folder")]
struct Cli {
    /// Path to config file [default: ~/.config/boxsync/config.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Refresh from Box, then watch the local tree and push changes
    Start,
    /// Run one full refresh from Box
    Refresh {
        /// Drop the cache first
        #[arg(long)]
        reset: bool,
    },
    /// Push local changes once, using the existing cache
    Rescan,
    /// Show cache statistics
    Status,
    /// Print debounced file-system events for a directory tree
    Watch {
        path: PathBuf,
        /// Glob pattern to ignore (repeatable)
        #[arg(short, long)]
        exclude: Vec<String>,
    },
}

fn init_tracing(verbosity: u8) {
    let default_filter = match verbosity {
        0 => "boxsync=info",
        1 => "boxsync=debug",
        2 => "boxsync=trace",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

/// Warn when the inotify watch limit looks too low for a large tree.
fn check_inotify_limits() {
    let path = "/proc/sys/fs/inotify/max_user_watches";
    if let Ok(content) = std::fs::read_to_string(path)
        && let Ok(limit) = content.trim().parse::<u64>()
    {
        if limit < 65536 {
            tracing::warn!(
                max_user_watches = limit,
                "inotify watch limit is low, large trees may not be fully watched. \
                 Increase with: echo 524288 | sudo tee {path}"
            );
        } else {
            tracing::debug!(max_user_watches = limit, "inotify watch limit OK");
        }
    }
}

async fn build_engine(cfg: &config::Config, reset: bool) -> Result<SyncEngine> {
    let db_path = db::resolve_db_path(cfg.sync.db_path.as_deref())?;
    let pool = db::init_db(&db_path, reset).await?;

    let token_mgr = Arc::new(auth::TokenManager::new(&cfg.auth)?);
    let client = Arc::new(box_api::BoxClient::new(token_mgr)?);

    Ok(SyncEngine::new(
        pool,
        client,
        util::path::PathMapper::new(cfg.sync.local_root()?),
        cfg.sync.remote_root.clone(),
        Exclude::new(&cfg.sync.exclude, &cfg.sync.exclude_paths),
    ))
}

fn watcher_options(cfg: &config::Config) -> WatcherOptions {
    WatcherOptions {
        min_interval: cfg.general.debounce(),
        capacity: cfg.general.event_buffer,
    }
}

/// One rescan from the driver. Failures are logged; the next local change retries.
async fn rescan_once(engine: &SyncEngine) {
    match engine.rescan_local_tree().await {
        Ok(stats) => tracing::debug!(?stats, "rescan complete"),
        Err(e) if e.is_conflict() => tracing::warn!("{e}"),
        Err(e) if e.is_retryable() => {
            tracing::warn!(error = %e, "rescan failed, will retry on the next change")
        }
        Err(e) => tracing::error!(error = %e, "rescan failed"),
    }
}

async fn run_daemon(cfg: &config::Config) -> Result<()> {
    check_inotify_limits();

    let engine = Arc::new(build_engine(cfg, cfg.general.reset_cache_on_start).await?);
    let local_root = engine.mapper().local_root().to_path_buf();

    tracing::info!("running initial refresh");
    engine.hard_refresh().await?;

    let watcher = LocalWatcher::new(watcher_options(cfg))?;
    watcher.add_exclude_patterns(cfg.sync.exclude.iter().cloned());
    watcher.add_exclude_files(cfg.sync.exclude_paths.iter().cloned());
    watcher.add_all(&local_root)?;

    let driver = SyncDriver::new();
    let trigger = driver.trigger();
    let cancel = CancellationToken::new();
    let driver_task = {
        let engine = engine.clone();
        tokio::spawn(driver.run(cancel.clone(), move || {
            let engine = engine.clone();
            async move { rescan_once(&engine).await }
        }))
    };

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tracing::info!(root = %local_root.display(), "watching for local changes");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }
            Some(event) = watcher.recv() => {
                tracing::debug!(path = %event.path.display(), kind = ?event.kind, "local change");
                trigger.request();
            }
        }
    }

    watcher.close();
    cancel.cancel();
    driver_task.await.context("sync driver panicked")?;

    engine.pool().close().await;
    tracing::info!("boxsync stopped");
    Ok(())
}

async fn run_watch(cfg: &config::Config, path: PathBuf, exclude: Vec<String>) -> Result<()> {
    check_inotify_limits();

    let root = std::fs::canonicalize(&path)
        .with_context(|| format!("Cannot watch {}", path.display()))?;
    let watcher = LocalWatcher::new(watcher_options(cfg))?;
    watcher.add_exclude_patterns(exclude);
    let count = watcher.add_all(&root)?;
    tracing::info!(root = %root.display(), directories = count, "watching");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = watcher.recv() => match event {
                Some(e) => println!("{:?}\t{}", e.kind, e.path.display()),
                None => break,
            },
        }
    }
    watcher.close();
    Ok(())
}

async fn print_status(cfg: &config::Config) -> Result<()> {
    let db_path = db::resolve_db_path(cfg.sync.db_path.as_deref())?;
    println!("boxsync status");
    println!("==============");
    println!("Local root:  {}", cfg.sync.local_root()?.display());
    println!("Remote root: {}", cfg.sync.remote_root);
    println!("Cache:       {}", db_path.display());

    let Some(pool) = db::open_db_readonly(&db_path).await? else {
        println!();
        println!("No cache yet. Run `boxsync refresh` or `boxsync start`.");
        return Ok(());
    };

    let folders = state::counts(&pool, EntryKind::Folder).await?;
    let files = state::counts(&pool, EntryKind::File).await?;
    println!();
    println!("Folders: {} ({} missing locally)", folders.total, folders.stale);
    println!("Files:   {} ({} missing locally)", files.total, files.stale);

    pool.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Start => run_daemon(&cfg).await?,
        Command::Refresh { reset } => {
            let engine = build_engine(&cfg, reset).await?;
            let stats = engine.hard_refresh().await?;
            engine.pool().close().await;
            println!(
                "refresh complete: {} folders, {} files, {} downloaded",
                stats.folders, stats.files, stats.downloaded
            );
        }
        Command::Rescan => {
            let engine = build_engine(&cfg, false).await?;
            let stats = engine.rescan_local_tree().await;
            engine.pool().close().await;
            let stats = stats?;
            println!(
                "rescan complete: {} folders created, {} uploaded, {} updated, {} missing",
                stats.folders_created, stats.uploaded, stats.updated, stats.missing
            );
        }
        Command::Status => print_status(&cfg).await?,
        Command::Watch { path, exclude } => run_watch(&cfg, path, exclude).await?,
    }

    Ok(())
}
