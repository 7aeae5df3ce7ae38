//! Anchor sync server — a real-time synchronization engine that streams a
//! declared object graph's initial state to a subscribing client and then
//! every subsequent change, via a WebSocket connection per anchor.

mod cache;
mod channel;
mod channel_registry;
mod coalescer;
mod config;
mod coordination;
mod delta;
mod demo;
mod error;
mod handlers;
mod loader;
mod router;
mod sweeper;
mod websocket;

use crate::cache::{DocumentCache, MongoDocumentCache};
use crate::coalescer::Coalescer;
use crate::config::Config;
use crate::coordination::{CoordinationClient, StateMachine};
use crate::delta::DeltaWriter;
use crate::loader::SnapshotLoader;
use crate::router::SubscriptionRouter;
use crate::sweeper::Sweeper;
use crate::websocket::ConnectionManager;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Every collaborator a connection handler needs, wired once at startup and
/// shared read-only thereafter.
pub struct AppServices {
    pub config: Config,
    pub coordination: CoordinationClient,
    pub state_machine: Arc<StateMachine>,
    pub cache: Arc<dyn DocumentCache>,
    pub loader: Arc<SnapshotLoader>,
    pub router: Arc<SubscriptionRouter>,
    pub coalescer: Arc<Coalescer>,
    pub connections: Arc<ConnectionManager>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sync_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("starting anchor sync server on {}:{}", config.host, config.port);

    let coordination = CoordinationClient::connect(&config.redis_url).await?;
    let state_machine = Arc::new(StateMachine::new(coordination.clone()));

    let cache: Arc<dyn DocumentCache> =
        Arc::new(MongoDocumentCache::connect(&config.mongo_url, &config.mongo_db).await?);
    let writer = Arc::new(DeltaWriter::new(cache.clone()));
    let loader = Arc::new(SnapshotLoader::new(state_machine.clone(), cache.clone(), writer.clone()));
    let router = Arc::new(SubscriptionRouter::new(coordination.clone()));
    let coalescer = Arc::new(Coalescer::new(writer.clone(), router.clone()));
    let connections = ConnectionManager::new_shared();

    demo::register(cache.clone(), router.clone()).await?;

    let sweeper = Sweeper::new(state_machine.clone(), cache.clone(), config.cache_ttl, config.sweep_interval);
    tokio::spawn(sweeper.run());

    let services = Arc::new(AppServices {
        config: config.clone(),
        coordination,
        state_machine,
        cache,
        loader,
        router,
        coalescer,
        connections,
    });

    let app = Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(services);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

mod routes;
