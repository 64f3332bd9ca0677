use std::sync::Arc;

use tollgate::config::loader::{apply_rule_seed, load_config, load_rule_seed_from_file};
use tollgate::config::watcher::watch_rules_file;
use tollgate::limiter::SystemClock;
use tollgate::metrics_server::start_metrics_server;
use tollgate::redis::{create_redis_pool, RedisBucketStore};
use tollgate::rules::RedisRuleStore;
use tollgate::{start_server, DecisionService, ServerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tollgate=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Tollgate rate limiter starting (version {})", env!("CARGO_PKG_VERSION"));

    let app_config = load_config()?;
    let server_config = ServerConfig::from_env();

    let pool = create_redis_pool(&app_config.redis).await?;
    let rules = Arc::new(RedisRuleStore::new(pool.clone()));
    let buckets = Arc::new(RedisBucketStore::new(pool).await?);
    let service = Arc::new(DecisionService::new(
        rules,
        buckets,
        Arc::new(SystemClock),
        app_config.limiter.clone(),
    ));

    if let Some(path) = app_config.rules_file.clone() {
        let seed = load_rule_seed_from_file(&path).await?;
        apply_rule_seed(&service, &seed).await?;

        let watched = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(e) = watch_rules_file(path, watched).await {
                tracing::error!("Rule seed watcher stopped: {}", e);
            }
        });
    }

    let metrics_service = Arc::clone(&service);
    let metrics_port = server_config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_port, metrics_service).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    tracing::info!("Server will listen on: {}", server_config.addr());
    start_server(&server_config, service, shutdown_signal()).await?;

    tracing::info!("Tollgate rate limiter stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
