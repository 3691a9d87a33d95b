use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use nomflow_infra::broker::RedisStreamsBroker;
use nomflow_infra::build_router;
use nomflow_infra::config::WorkerConfig;
use nomflow_infra::tracker::PostgresTracker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    nomflow_observability::init();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(config.db_acquire_timeout)
        .connect(&config.database_url)
        .await
        .context("failed to connect to postgres")?;

    let tracker = PostgresTracker::new(pool);
    tracker.migrate().await.context("failed to run migrations")?;

    let broker = RedisStreamsBroker::new(
        &config.redis_url,
        Some(config.stream_prefix.clone()),
        config.consumer_name.clone(),
    )?;

    let router = build_router(&config, Arc::new(tracker), Arc::new(broker));
    tracing::info!(
        group = %config.consumer_group,
        consumer = %config.consumer_name,
        topics = ?router.topics(),
        "starting nominative user import worker"
    );

    let handle = router
        .start(CancellationToken::new())
        .await
        .context("failed to subscribe topics")?;

    shutdown_signal().await;
    tracing::info!("shutdown requested; draining topic workers");
    handle.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
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
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
