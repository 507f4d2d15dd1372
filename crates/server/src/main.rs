mod bus;
mod db;
mod engine;
mod incremental_api;
mod router;
mod scheduler;
mod state;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use choreo_collector::{CatalogCollector, CollectorOptions, UpstreamClient};
use choreo_core::Config;
use choreo_store::{DatabaseEngine, EntitySink, IngestionStore, PgEntitySink};

use crate::bus::InProcessBus;
use crate::engine::IngestionEngine;
use crate::scheduler::TaskScheduler;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    choreo_core::config::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    config.validate()?;

    let pool = db::init_pg_pool(&config.database).await?;
    let engine_kind = DatabaseEngine::from_url(&config.database.url);
    let store = IngestionStore::new(engine_kind);
    let sink: Arc<dyn EntitySink> = Arc::new(PgEntitySink::new(pool.clone(), engine_kind));

    let client = UpstreamClient::from_config(&config.upstream)?;
    let collector =
        CatalogCollector::new(Arc::new(client), CollectorOptions::from(&config.upstream));

    let mut engine = IngestionEngine::new(
        pool.clone(),
        store.clone(),
        sink,
        config.ingestion.clone(),
    );
    engine.add_provider(&config.upstream.provider_name, collector);
    let engine = Arc::new(engine);

    let scheduler = TaskScheduler::new();
    let bus = Arc::new(InProcessBus::new(64));
    engine.start(&scheduler, &bus).await?;

    {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine.ready().wait_ready().await;
            info!("all providers connected — steady state reached");
        });
    }

    let state = Arc::new(AppState {
        config: config.clone(),
        pool,
        store,
        engine,
        bus,
    });
    let app = router::build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
