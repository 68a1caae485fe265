//! Ingestion service entry point for the Geode session reconciler.
//!
//! Loads `geode-config.yaml`, connects to `PostgreSQL` (or keeps everything
//! in memory with `--dry-run`), starts the status API, and runs one
//! watermark-driven worker per configured stream until `Ctrl-C` or until
//! every worker has halted.
//!
//! # Architecture
//!
//! ```text
//!                       +--> worker(dhcp)   --+
//! Splunk (governed) ----+--> worker(radius) --+--> Reconciler --> PostgreSQL
//!                       +--> worker(tomcat) --+        (sessions, stream_watermarks)
//!                                  |
//!                             StatusBoard --> status API (/health, /api/streams)
//! ```
//!
//! # Environment
//!
//! - `GEODE_CONFIG` -- config path (default `geode-config.yaml`)
//! - `DATABASE_URL`, `SPLUNK_URL`, `SPLUNK_USERNAME`, `SPLUNK_PASSWORD` --
//!   override the matching config values
//! - `RUST_LOG` -- overrides `logging.level`

mod error;
mod splunk;
mod workers;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use geode_core::config::{GeodeConfig, LoggingConfig};
use geode_core::memory::{MemoryStore, MemoryWatermarks};
use geode_core::source::GovernedSource;
use geode_core::status::StatusBoard;
use geode_db::PostgresPool;
use geode_observer::{AppState, ServerConfig};
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::splunk::SplunkSource;
use crate::workers::{Workers, spawn_streams, supervise};

/// Config file read when `GEODE_CONFIG` is unset.
const DEFAULT_CONFIG_PATH: &str = "geode-config.yaml";

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration, the database, or the search client
/// cannot be set up.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("GEODE_CONFIG")
        .map_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    let config = GeodeConfig::from_file(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    init_tracing(&config.logging);
    let dry_run = std::env::args().skip(1).any(|arg| arg == "--dry-run");
    info!(
        config = %config_path.display(),
        streams = config.streams.len(),
        dry_run,
        "geode-ingest starting"
    );

    let kinds = Arc::new(config.kind_table()?);
    let board = StatusBoard::new();
    let source = Arc::new(
        GovernedSource::new(SplunkSource::new(&config.source)?)
            .with_max_concurrent_jobs(config.source.max_concurrent_jobs)
            .with_query_timeout(config.source.query_timeout()),
    );
    info!(
        base_url = %config.source.base_url,
        max_concurrent_jobs = config.source.max_concurrent_jobs,
        max_events = config.source.max_events,
        "Search source configured"
    );

    let (stop_server, server_stopped) = oneshot::channel::<()>();
    let server = config.observer.enabled.then(|| {
        let server_config = ServerConfig {
            host: config.observer.host.clone(),
            port: config.observer.port,
        };
        let state = Arc::new(AppState::new(board.clone()));
        tokio::spawn(async move {
            let shutdown = async {
                // A dropped sender also means shut down.
                let _ = server_stopped.await;
            };
            if let Err(err) = geode_observer::start_server(&server_config, state, shutdown).await {
                error!(error = %err, "Status server failed");
            }
        })
    });

    let (mut workers, pool): (Workers, Option<PostgresPool>) = if dry_run {
        warn!("Dry run: sessions and watermarks are kept in memory and lost on exit");
        let workers = spawn_streams(
            &config,
            &source,
            &Arc::new(MemoryStore::new()),
            &Arc::new(MemoryWatermarks::new()),
            &kinds,
            &board,
        )?;
        (workers, None)
    } else {
        let pool = PostgresPool::connect(&config.database).await?;
        pool.run_migrations().await?;
        let workers = spawn_streams(
            &config,
            &source,
            &Arc::new(pool.sessions(Arc::clone(&kinds))),
            &Arc::new(pool.watermarks()),
            &kinds,
            &board,
        )?;
        (workers, Some(pool))
    };

    if workers.is_empty() {
        warn!("No streams configured");
    }

    tokio::select! {
        failed = supervise(&mut workers) => {
            warn!(failed, "All stream workers stopped");
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                error!(error = %err, "Failed to listen for Ctrl-C");
            }
            info!("Shutdown requested");
        }
    }

    workers.shutdown().await;
    let _ = stop_server.send(());
    if let Some(server) = server {
        server
            .await
            .unwrap_or_else(|err| warn!(error = %err, "Status server task failed"));
    }
    if let Some(pool) = pool {
        pool.close().await;
    }

    info!("geode-ingest stopped");
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` wins over `logging.level`.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
