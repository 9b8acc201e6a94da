//! Account rotator agent
//!
//! Long-lived local agent keeping a pool of OAuth accounts ready for
//! rotation: refreshes tokens ahead of expiry, imports an externally
//! maintained credential file when it changes, and logs pool health.
//!
//! Commands:
//! - `run` (default): the agent loop, until SIGINT/SIGTERM
//! - `status`: print the pool summary as JSON
//! - `next`: select and commit the next account, print its alias

mod config;
mod metrics;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use account_auth::{AccountStore, HttpRefreshTransport};
use account_pool::{
    RotationEngine, Selection, SyncContext, TokenLifecycleManager, spawn_refresh_task,
    sync_external_auth,
};
use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Run,
    Status,
    Next,
}

/// `--config <path>` plus an optional command word.
fn parse_args(args: &[String]) -> Result<(Option<&str>, Command)> {
    let mut config_path = None;
    let mut command = None;
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = iter.next().context("--config requires a path")?;
                config_path = Some(path.as_str());
            }
            "run" | "status" | "next" if command.is_none() => {
                command = Some(match arg.as_str() {
                    "status" => Command::Status,
                    "next" => Command::Next,
                    _ => Command::Run,
                });
            }
            other => anyhow::bail!("unexpected argument: {other}"),
        }
    }
    Ok((config_path, command.unwrap_or(Command::Run)))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let (cli_config_path, command) = parse_args(&args)?;

    let (config_path, explicit) = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), explicit, "loading configuration");
    let config = if explicit {
        Config::load(&config_path)
    } else {
        Config::load_or_default(&config_path)
    }
    .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        store = %config.store.path.display(),
        strategy = config.rotation.strategy.label(),
        sync_file = config.sync.auth_file.as_ref().map(|p| p.display().to_string()),
        "configuration loaded"
    );

    let store = Arc::new(AccountStore::with_lock_options(
        config.store.path.clone(),
        config.store.lock_options(),
    ));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.oauth.timeout_secs))
        .build()
        .context("failed to build HTTP client")?;
    let transport = HttpRefreshTransport::new(
        client,
        config.oauth.token_endpoint.clone(),
        config.oauth.client_id.clone(),
    );
    let lifecycle = Arc::new(TokenLifecycleManager::new(store.clone(), Arc::new(transport)));
    let engine = RotationEngine::new(lifecycle.clone());

    match command {
        Command::Status => {
            let status = engine.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Next => next(&engine, &config).await,
        Command::Run => run(config, engine, lifecycle).await,
    }
}

async fn next(engine: &RotationEngine, config: &Config) -> Result<()> {
    match engine.select(&config.rotation).await? {
        Selection::Selected(selected) => {
            println!("{} (index {})", selected.account.alias(), selected.index);
            Ok(())
        }
        Selection::NoAccounts => anyhow::bail!("no accounts configured"),
        Selection::Exhausted { total, available } => {
            anyhow::bail!("no account can serve right now ({available} of {total} available)")
        }
    }
}

async fn run(
    config: Config,
    engine: RotationEngine,
    lifecycle: Arc<TokenLifecycleManager>,
) -> Result<()> {
    metrics::install(config.metrics.listen_addr)?;
    if let Some(addr) = config.metrics.listen_addr {
        info!(%addr, "metrics listener started");
    }

    let mut tasks = vec![spawn_refresh_task(
        lifecycle,
        Duration::from_secs(config.refresh.interval_secs),
        Duration::from_secs(config.refresh.threshold_secs),
    )];

    if let Some(path) = config.sync.auth_file.clone() {
        tasks.push(spawn_sync_task(
            path,
            engine.store().clone(),
            Duration::from_secs(config.sync.interval_secs),
            Duration::from_secs(config.sync.ttl_secs),
        ));
    }

    let status = engine.status().await;
    info!(
        status = ?status.status,
        total = status.accounts_total,
        available = status.accounts_available,
        "account rotator running"
    );

    let mut health = tokio::time::interval(Duration::from_secs(config.refresh.interval_secs));
    health.tick().await;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = health.tick() => {
                let status = engine.status().await;
                info!(
                    status = ?status.status,
                    available = status.accounts_available,
                    cooling_down = status.accounts_cooling_down,
                    disabled = status.accounts_disabled,
                    "pool health"
                );
            }
        }
    }

    for task in tasks {
        task.abort();
    }
    info!("shutdown complete");
    Ok(())
}

/// Periodically import the external credential file. Runs once at startup.
fn spawn_sync_task(
    path: PathBuf,
    store: Arc<AccountStore>,
    interval: Duration,
    ttl: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ctx = SyncContext::new(ttl);
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let outcome = sync_external_auth(&path, &store, &mut ctx).await;
            metrics::record_sync(&outcome);
            if let Err(e) = outcome {
                warn!(path = %path.display(), error = %e, "external credential sync failed");
            }
        }
    })
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
