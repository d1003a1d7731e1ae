use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use pullcache_server::config::{self, LogConfig};

/// Pull-through Nix binary cache.
#[derive(Debug, Parser)]
#[clap(version)]
#[clap(propagate_version = true)]
struct Opts {
    /// Path to the config file.
    #[clap(short = 'f', long)]
    config: Option<PathBuf>,

    /// Socket address to listen on.
    ///
    /// This overrides `listen` in the config.
    #[clap(short = 'l', long)]
    listen: Option<SocketAddr>,

    /// Mode to run.
    #[clap(long, default_value = "server")]
    mode: ServerMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ServerMode {
    /// Run the API server plus the periodic LRU evictor.
    Server,

    /// Run the database migrations then exit.
    DbMigrations,

    /// Run one eviction pass then exit.
    EvictOnce,

    /// Check the configuration then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();
    let config = config::load_config(opts.config.as_deref())?;

    init_logging(&config.log);
    dump_version();

    match opts.mode {
        ServerMode::Server => {
            pullcache_server::run_api_server(opts.listen, config).await?;
        }
        ServerMode::DbMigrations => {
            pullcache_server::run_migrations(config).await?;
        }
        ServerMode::EvictOnce => {
            pullcache_server::run_eviction_once(config).await?;
        }
        ServerMode::CheckConfig => {
            eprintln!();
            eprintln!("Config looks good!");
            eprintln!();
        }
    }

    Ok(())
}

fn init_logging(log: &LogConfig) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let error_layer = ErrorLayer::default();

    if log.json {
        let fmt_layer = tracing_subscriber::fmt::layer().json().with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).with(error_layer).init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).with(error_layer).init();
    }
}

fn dump_version() {
    #[cfg(debug_assertions)]
    eprintln!("pullcached {} (debug)", env!("CARGO_PKG_VERSION"));

    #[cfg(not(debug_assertions))]
    eprintln!("pullcached {} (release)", env!("CARGO_PKG_VERSION"));
}
