//! hookrelay webhook delivery service.
//!
//! Main entry point. Loads configuration, connects PostgreSQL, starts the
//! queue processor and coordinates graceful shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hookrelay_core::{storage::Storage, RealClock};
use hookrelay_delivery::{
    client::ReqwestTransport, metrics::MetricsRecorderSink, storage::PostgresStorage,
    ProcessorDeps, QueueProcessor,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

mod config;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    info!("Starting hookrelay delivery service");

    let config = Config::load()?;
    info!(
        database_url = %config.database_url_masked(),
        worker_count = config.worker_count,
        max_concurrent_deliveries = config.max_concurrent_deliveries,
        "Configuration loaded"
    );

    if let Some(addr) = config.metrics_socket_addr()? {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(addr = %addr, "Prometheus exporter listening");
    }

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    run_migrations(&db_pool).await?;
    info!("Database migrations completed");

    let storage = PostgresStorage::new(Arc::new(Storage::new(db_pool.clone())));
    let transport = ReqwestTransport::new(&config.to_client_config())
        .context("Failed to build webhook HTTP client")?;
    let deps = ProcessorDeps::with_storage(
        storage,
        Arc::new(transport),
        Arc::new(MetricsRecorderSink),
        Arc::new(RealClock::new()),
    );
    let processor = QueueProcessor::new(config.to_processor_config(), deps);

    processor.start().await.context("Failed to start queue processor")?;
    info!("hookrelay is processing deliveries");

    shutdown_signal().await;
    info!("Shutdown signal received, draining in-flight deliveries");

    let grace = Duration::from_secs(config.shutdown_timeout_secs);
    match tokio::time::timeout(grace, processor.stop()).await {
        Ok(Ok(())) => info!("Queue processor stopped"),
        Ok(Err(e)) => error!(error = %e, "Queue processor stopped with error"),
        Err(_) => warn!(grace_secs = grace.as_secs(), "Shutdown grace period expired"),
    }

    db_pool.close().await;
    info!("Database connections closed");

    info!("hookrelay shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,hookrelay=debug"))
        .context("Invalid RUST_LOG environment variable")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;
    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Ensures the delivery tables and indexes exist.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deliveries (
            id UUID PRIMARY KEY,
            subscription_id UUID NOT NULL,
            webhook_id UUID NOT NULL,
            event JSONB NOT NULL,
            payload JSONB NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            status TEXT NOT NULL,
            next_retry_time TIMESTAMPTZ,
            last_error TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create deliveries table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS webhook_configs (
            id UUID PRIMARY KEY,
            url TEXT NOT NULL,
            format TEXT,
            headers TEXT,
            timeout_ms BIGINT,
            retry_attempts INTEGER
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create webhook_configs table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dead_letters (
            id UUID PRIMARY KEY,
            delivery_id UUID NOT NULL,
            delivery JSONB NOT NULL,
            reason TEXT NOT NULL,
            last_error TEXT NOT NULL,
            moved_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create dead_letters table")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_deliveries_due
        ON deliveries(next_retry_time, created_at)
        WHERE status = 'pending'
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create deliveries due index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_deliveries_processing
        ON deliveries(updated_at)
        WHERE status = 'processing'
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create deliveries processing index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_dead_letters_moved_at
        ON dead_letters(moved_at DESC)
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create dead_letters index")?;

    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
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
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
