//! Notification Dispatcher Service
//!
//! Runs the dispatch worker pool, the retry sweeper and the health server
//! against a shared Redis.
//!
//! ## Architecture
//!
//! ```text
//! Redis queue (notify:jobs)
//!   ↓ (leased delivery, visibility timeout)
//! QueueWorker<NotificationJob, Dispatcher>  ×  WORKER_CONCURRENCY
//!   ↓ (per-request lease, send with timeout)
//! ChannelRegistry → ChannelAdapter (SMTP / webhook / log)
//!   ↓
//! RedisDeliveryStore (attempt records, request state)
//!   ↑
//! RetrySweeper (repairs lost follow-ups every SWEEPER_INTERVAL_SECS)
//! ```
//!
//! Exit status is 0 after a clean drain or shutdown and non-zero when
//! startup fails.

pub mod channels;
pub mod cli;
pub mod config;
pub mod connector;
pub mod telemetry;

use axum::Router;
use domain_notifications::{Dispatcher, NotificationJob, RedisDeliveryStore, RetrySweeper};
use eyre::{Result, WrapErr};
use job_queue::{health_router, DispatchQueue, HealthState, QueueProbe, QueueWorker, RedisQueue};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::cli::Cli;
use crate::config::{DispatchConfig, Environment, FromEnv};

/// Start the health HTTP server
///
/// Provides endpoints for:
/// - Liveness probes: `/health`, `/healthz`
/// - Readiness probes: `/ready`, `/readyz`
/// - Queue monitoring: `/queue/info`
/// - Prometheus metrics: `/metrics`
async fn start_health_server(health_state: HealthState, port: u16) -> Result<()> {
    let app: Router = health_router(health_state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the dispatcher
///
/// 1. Sets up structured logging and the Prometheus recorder
/// 2. Loads configuration and builds the channel registry
/// 3. Connects to Redis with retry logic
/// 4. Runs the worker pool (and sweeper) until shutdown or, with `--drain`,
///    until no job is due and none is in flight
///
/// # Errors
///
/// Returns an error if configuration is invalid, a channel adapter cannot be
/// built, Redis is unreachable or the worker pool fails.
pub async fn run(cli: Cli) -> Result<()> {
    let environment = Environment::from_env();
    telemetry::init_tracing(&environment);

    job_queue::init_metrics().wrap_err("Failed to install metrics recorder")?;

    let name = env!("CARGO_PKG_NAME");
    let version = env!("CARGO_PKG_VERSION");
    info!(name = %name, version = %version, drain = %cli.drain, "Starting notification dispatcher");

    let config = DispatchConfig::from_env().wrap_err("Failed to load dispatcher configuration")?;
    let registry = Arc::new(channels::build_registry(&config).wrap_err("Failed to build channel registry")?);
    info!(channels = ?registry.ids(), "Channel registry ready");

    info!("Connecting to Redis...");
    let redis = connector::connect_with_retry(&config.redis_url, None)
        .await
        .wrap_err("Failed to connect to Redis")?;

    let queue = Arc::new(RedisQueue::<NotificationJob>::new(
        redis.clone(),
        config.queue_name.clone(),
        config.worker.visibility_timeout,
    ));
    let probe: Arc<dyn QueueProbe> = queue.clone();
    let queue: Arc<dyn DispatchQueue<NotificationJob>> = queue;
    let store = Arc::new(RedisDeliveryStore::new(redis, config.store_prefix.clone()));

    let dispatcher = Arc::new(
        Dispatcher::new(registry, store.clone(), store, queue.clone())
            .with_config(config.dispatcher_config()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let signal_tx = Arc::clone(&shutdown_tx);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = signal_tx.send(true);
    });

    let health_state = HealthState::new(probe, name, version);
    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    let sweeper = Arc::new(RetrySweeper::new(Arc::clone(&dispatcher), config.sweeper_config()));
    let sweeper_task = if cli.no_sweeper {
        info!("Retry sweeper disabled");
        None
    } else if cli.drain {
        // One pass so lost follow-ups are queued before the drain check.
        match sweeper.sweep_once().await {
            Ok(report) => info!(?report, "Startup sweep finished"),
            Err(e) => warn!(error = %e, "Startup sweep failed"),
        }
        None
    } else {
        let sweeper = Arc::clone(&sweeper);
        let rx = shutdown_rx.clone();
        Some(tokio::spawn(async move { sweeper.run(rx).await }))
    };

    let worker = QueueWorker::new(queue, dispatcher, config.worker_config(&cli));
    let worker_result = worker.run(shutdown_rx).await;

    let _ = shutdown_tx.send(true);
    if let Some(task) = sweeper_task {
        if let Err(e) = task.await {
            warn!(error = %e, "Retry sweeper task ended abnormally");
        }
    }

    worker_result.wrap_err("Worker pool failed")?;

    info!("Notification dispatcher stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }
}
