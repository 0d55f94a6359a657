use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use market_feed::{
    config::Config,
    db::{create_pool, create_redis_client, run_migrations, Cache, RedisProfileCache},
    routes::{create_router, AppState},
    services::{
        dispatch::HttpChunkDispatcher, repository::PgFeedRepository, FeedPipeline,
        PipelineSettings,
    },
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let pool = create_pool(
        &config.database_url,
        config.database_max_connections,
        config.call_timeout(),
    )
    .await
    .context("Failed to connect to Postgres")?;
    run_migrations(&pool).await?;

    let redis_client = create_redis_client(&config.redis_url)?;
    let cache = Cache::new(redis_client);

    let repository = Arc::new(PgFeedRepository::new(pool));
    let settings = PipelineSettings::from_config(&config);

    let mut pipeline = FeedPipeline::new(repository.clone(), repository.clone(), settings)
        .with_profile_cache(Arc::new(RedisProfileCache::new(
            cache,
            config.profile_cache_ttl_secs,
        )));
    if let Some(worker_url) = &config.worker_url {
        tracing::info!(worker_url = %worker_url, "Chunks will be fanned out to workers");
        pipeline = pipeline.with_dispatcher(Arc::new(HttpChunkDispatcher::new(worker_url.clone())));
    }

    let state = AppState::new(repository, Arc::new(pipeline));
    let app = create_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(addr = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}
