#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

mod api;
pub mod chunking;
pub mod config;
pub mod controller;
pub mod database;
pub mod decompression;
pub mod dedup;
mod error;
pub mod evictor;
pub mod lock;
mod middleware;
pub mod narinfo;
pub mod nix_manifest;
mod storage;
pub mod upstream;

use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::Extension, http::Uri, Router};
use sea_orm::Database;
use tower_http::catch_panic::CatchPanicLayer;

use config::{Config, StorageConfig};
use controller::CacheController;
use database::migration::{Migrator, MigratorTrait};
use dedup::Deduplicator;
use error::{ServerError, ServerResult};
use lock::{LockClient, Locker};
use middleware::restrict_host;
use sea_orm::DatabaseConnection;
use storage::{LocalBackend, StorageBackend};
use upstream::UpstreamPool;

use pullcache_core::signing::NixKeypair;

pub(crate) type State = Arc<StateInner>;

/// Everything a running instance needs: the resolved configuration plus
/// every component the controller and evictor are built from. Unlike the
/// architectural precedent's state this is fully resolved at startup
/// rather than lazily, since the controller and the background evictor
/// both need every component wired up before they can run.
pub struct StateInner {
    pub(crate) config: Config,
    pub(crate) database: DatabaseConnection,
    pub(crate) storage: Arc<dyn StorageBackend>,
    pub(crate) locker: Arc<dyn Locker>,
    pub(crate) controller: Arc<CacheController<DatabaseConnection>>,
}

impl StateInner {
    async fn new(config: Config) -> Result<State> {
        let database = Database::connect(&config.database.url)
            .await
            .context("failed to connect to the metadata database")?;

        let storage: Arc<dyn StorageBackend> = match &config.storage {
            StorageConfig::Local(local_config) => Arc::new(LocalBackend::new(local_config.clone()).await?),
        };

        let locker: Arc<dyn Locker> = Arc::new(LockClient::connect(&config.lock.url, config.lock.retry.clone()).await?);

        let upstream = Arc::new(UpstreamPool::new(config.upstreams.clone())?);
        let dedup = Arc::new(Deduplicator::new());
        let keypair = Arc::new(load_or_generate_keypair(&config)?);

        let controller = Arc::new(CacheController::new(
            Arc::new(database.clone()),
            storage.clone(),
            locker.clone(),
            dedup,
            upstream,
            keypair,
            config.chunking.clone(),
            config.compression.clone(),
            config.cache_sign_info_record,
            config.record_age_ignore_touch,
            config.download_poll_timeout,
            config.lock.download_lock_ttl,
        ));

        Ok(Arc::new(Self {
            config,
            database,
            storage,
            locker,
            controller,
        }))
    }
}

/// Reads the Ed25519 signing keypair from `config.secret_key_path`,
/// generating and persisting one if the file doesn't exist yet.
fn load_or_generate_keypair(config: &Config) -> Result<NixKeypair> {
    match fs::read_to_string(&config.secret_key_path) {
        Ok(existing) => NixKeypair::from_str(existing.trim()).context("stored signing key is invalid"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let keypair = NixKeypair::generate(&config.hostname)?;

            if let Some(parent) = config.secret_key_path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {:?}", parent))?;
            }

            fs::write(&config.secret_key_path, keypair.export_keypair())
                .with_context(|| format!("failed to write signing key to {:?}", config.secret_key_path))?;

            tracing::info!("generated a new signing key at {:?}", config.secret_key_path);
            Ok(keypair)
        }
        Err(e) => Err(e).with_context(|| format!("failed to read signing key at {:?}", config.secret_key_path)),
    }
}

/// The fallback route.
async fn fallback(_: Uri) -> ServerResult<()> {
    Err(ServerError::NotFound)
}

/// Runs the API server and, if configured, the periodic LRU evictor
/// alongside it.
pub async fn run_api_server(cli_listen: Option<SocketAddr>, config: Config) -> Result<()> {
    eprintln!("Starting server...");

    let max_size = config.max_size;
    let eviction_config = config.eviction.clone();
    let state = StateInner::new(config).await?;

    let listen = cli_listen.unwrap_or(state.config.listen);

    let app = Router::new()
        .merge(api::get_router())
        .fallback(fallback)
        .layer(axum::middleware::from_fn(restrict_host))
        .layer(Extension(state.clone()))
        .layer(Extension(state.controller.clone()))
        .layer(CatchPanicLayer::new());

    eprintln!("Listening on {:?}...", listen);

    let evictor_db = Arc::new(state.database.clone());
    let evictor = evictor::run_periodic_eviction(
        evictor_db,
        state.storage.clone(),
        state.locker.clone(),
        max_size,
        eviction_config,
    );

    let (server_ret, _) = tokio::join!(
        axum::Server::bind(&listen).serve(app.into_make_service()),
        evictor,
    );

    server_ret?;

    Ok(())
}

/// Runs database migrations then exits.
pub async fn run_migrations(config: Config) -> Result<()> {
    eprintln!("Running migrations...");

    let database = Database::connect(&config.database.url)
        .await
        .context("failed to connect to the metadata database")?;
    Migrator::up(&database, None).await?;

    Ok(())
}

/// Runs one eviction pass then exits.
pub async fn run_eviction_once(config: Config) -> Result<()> {
    let max_size = config.max_size;
    let eviction_config = config.eviction.clone();
    let state = StateInner::new(config).await?;
    let db = Arc::new(state.database.clone());

    evictor::run_eviction_once(&*db, &state.storage, &state.locker, max_size, &eviction_config).await?;

    Ok(())
}
