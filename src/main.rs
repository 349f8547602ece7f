use anyhow::Context;
use clap::Parser;
use diskbench::config::{ServiceConfig, DEFAULT_PORT, DEFAULT_RETENTION_DAYS};
use diskbench::orchestrator::Orchestrator;
use diskbench::{logger, server};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Disk benchmark orchestration service for QLab-style show workloads.
#[derive(Parser, Debug)]
#[command(name = "diskbenchd", version, about)]
struct Cli {
    /// HTTP bridge port (always bound to loopback).
    #[arg(long, default_value_t = DEFAULT_PORT, env = "DISKBENCH_PORT")]
    port: u16,

    /// Directory for the state database and service logs.
    #[arg(long, default_value = "memory-bank", env = "DISKBENCH_STATE_DIR")]
    state_dir: PathBuf,

    /// Pin the worker binary instead of resolving one.
    #[arg(long, env = "DISKBENCH_WORKER")]
    worker: Option<PathBuf>,

    /// Days to keep terminal test records.
    #[arg(long, default_value_t = DEFAULT_RETENTION_DAYS)]
    retention_days: i64,

    /// Verbose logging (includes worker stderr).
    #[arg(long)]
    verbose: bool,
}

enum Exit {
    Clean,
    Interrupted,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = ServiceConfig::with_state_dir(cli.state_dir);
    config.port = cli.port;
    config.worker_path = cli.worker;
    config.history_retention_days = cli.retention_days;

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    match run(config, level).await {
        Ok(Exit::Clean) => std::process::exit(0),
        Ok(Exit::Interrupted) => std::process::exit(130),
        Err(e) => {
            eprintln!("diskbenchd: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(config: ServiceConfig, level: log::LevelFilter) -> anyhow::Result<Exit> {
    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("cannot create state dir {}", config.state_dir.display()))?;
    let log_path = logger::init(&config.state_dir.join("logs"), level)
        .map_err(anyhow::Error::msg)
        .context("logging initialization failed")?;
    log::info!("diskbenchd {} starting", env!("CARGO_PKG_VERSION"));
    log::info!("session log: {}", log_path.display());

    let (orchestrator, recovery) = Orchestrator::init(config.clone()).await?;
    if !recovery.is_empty() {
        log::warn!(
            "previous session left {} background tests; inspect /api/background-tests",
            recovery.disconnected.len() + recovery.unknown.len()
        );
    }

    let pruned = orchestrator.prune_history()?;
    if pruned > 0 {
        log::info!("pruned {pruned} test records past retention");
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    let addr = config.bind_addr();
    server::run_with_shutdown(orchestrator, addr, async move {
        let _ = tokio::signal::ctrl_c().await;
        log::warn!("interrupt received, shutting down");
        flag.store(true, Ordering::SeqCst);
    })
    .await?;

    log::logger().flush();
    if interrupted.load(Ordering::SeqCst) {
        Ok(Exit::Interrupted)
    } else {
        Ok(Exit::Clean)
    }
}
