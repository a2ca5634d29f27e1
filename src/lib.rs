use std::sync::Arc;

use actix_web::{
    middleware::{NormalizePath, TrailingSlash},
    web::Data,
    App, HttpServer,
};
use config::Config;
use engine::ClientFactory;
use framework::{Backend, Operation, Request};
use server::AppState;
use sqlx::sqlite::SqlitePoolOptions;
use storage::{sqlite::SqliteStorage, Storage};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod config;
pub mod engine;
pub mod error;
pub mod framework;
pub mod iam;
pub mod server;
pub mod storage;
pub mod utils;

/// Returns a builder for the development server.
///
/// Without a `config` it is read from the environment. Without a
/// `client_factory` the engine talks to AWS.
#[bon::builder(finish_fn = start)]
pub async fn run(
    config: Option<Config>,
    client_factory: Option<Arc<dyn ClientFactory>>,
) -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("CREDVAULT_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("CREDVAULT_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = match config {
        Some(config) => config,
        None => Config::load()?,
    };

    let mut pool = SqlitePoolOptions::new();
    if config.db_path.is_none() {
        // Every connection to an in-memory database sees its own database.
        pool = pool.max_connections(1).idle_timeout(None).max_lifetime(None);
    }
    let pool = pool.connect_with(config.connect_options()).await?;
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::new(pool).await?);

    let mut backend_config = config.backend_config();
    if let Some(factory) = client_factory {
        backend_config.client_factory = factory;
    }

    let backend = Arc::new(engine::factory(backend_config));
    backend.initialize(storage.clone()).await?;

    let cancel = CancellationToken::new();

    let ticker = tokio::spawn(rollback_loop(
        backend.clone(),
        storage.clone(),
        config.periodic_interval(),
        cancel.clone(),
    ));

    let data = Data::new(AppState {
        backend,
        storage,
        cancel: cancel.clone(),
    });

    tracing::info!(address = %config.bind_address, "starting credvault");

    let served = HttpServer::new(move || {
        App::new()
            .wrap(NormalizePath::new(TrailingSlash::Trim))
            .wrap(TracingLogger::default())
            .service(server::service())
            .app_data(data.clone())
    })
    .bind(config.bind_address.as_str())?
    .run()
    .await;

    cancel.cancel();
    ticker.await?;

    Ok(served?)
}

/// Sends a rollback request every `interval`, which drains due static
/// rotations and reaps WAL entries older than the minimum age.
async fn rollback_loop(
    backend: Arc<Backend>,
    storage: Arc<dyn Storage>,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let req = Request::new(Operation::Rollback, "", storage.clone())
            .with_cancel(cancel.child_token());

        if let Err(e) = backend.handle_request(req).await {
            tracing::warn!(error = %e, "periodic rollback failed");
        }
    }
}
