//! KataGo host daemon - main entry point.
//!
//! Loads configuration, starts the result cache, rate limiter, idle-caller
//! sweeper and engine supervisor, then runs until Ctrl-C. Components stop in
//! reverse start order.

use clap::Parser;
use katago_host::observability::init_tracing;
use katago_host::{AnalysisCache, CallerSweeper, Config, RateLimiter, Supervisor};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "katago-host", version, about = "Supervised KataGo analysis engine host")]
struct Cli {
    /// JSON config file (defaults to KATAGO_HOST_CONFIG, ./config.json, ~/.katago-host/config.json).
    #[arg(short, long, env = "KATAGO_HOST_CONFIG")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let path = cli.config.or_else(Config::discover_path);
    let config = Config::load(path.as_deref())?;

    init_tracing(&config.observability);

    if cli.check {
        tracing::info!(config = ?path, "configuration_valid");
        return Ok(());
    }

    let cache = config
        .cache
        .enabled
        .then(|| Arc::new(AnalysisCache::new(&config.cache)));

    let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
    let mut sweeper = CallerSweeper::new(limiter.clone());
    let sweeper_task = sweeper.start();

    let supervisor = Supervisor::for_process(
        config.supervisor.clone(),
        config.engine.clone(),
        cache.clone(),
    );
    supervisor.start().await?;

    tracing::info!(
        binary = %config.engine.binary_path.display(),
        rate_limit = config.rate_limit.enabled,
        cache = cache.is_some(),
        "katago_host_started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown_requested");

    // Reverse start order.
    if let Err(e) = supervisor.stop().await {
        tracing::error!(error = %e, "supervisor_stop_failed");
    }
    sweeper.stop();
    let _ = sweeper_task.await;

    if let Some(cache) = &cache {
        tracing::info!(stats = ?cache.stats(), "cache_final_stats");
    }
    tracing::info!(tracked_callers = limiter.tracked_callers(), "katago_host_stopped");
    Ok(())
}
