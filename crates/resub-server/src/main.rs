use std::sync::Arc;

use clap::Parser;
use resub_server::config::loader::load_config;
use resub_server::distributed::{CoordinatorSettings, DistributedCoordinator, RedisStore};
use resub_server::server::{AppState, ConnectionHub, build_app, serve};
use resub_server::subscriptions::{MemoryResourceProvider, SubscriptionEngine};

#[derive(Debug, Parser)]
#[command(name = "resub-server", version, about = "Resource subscription server")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, env = "RESUB_CONFIG", default_value = "resub.toml")]
    config: String,
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    resub_server::observability::init_tracing();

    let cli = Cli::parse();
    let cfg = match load_config(Some(&cli.config)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };
    tracing::info!(path = %cli.config, "Configuration loaded");

    resub_server::observability::apply_logging_level(&cfg.logging.level);
    resub_server::metrics::init_metrics();

    let provider = MemoryResourceProvider::new_shared();
    let hub = ConnectionHub::new_shared();
    let engine = SubscriptionEngine::builder(hub.clone())
        .settings(cfg.subscriptions.clone())
        .compression(cfg.compression.clone())
        .provider(provider.clone())
        .build();
    engine.start();

    let coordinator = if cfg.distributed.enabled {
        match RedisStore::connect(&cfg.distributed.redis_url, cfg.distributed.pool_size) {
            Ok(store) => {
                let coordinator = DistributedCoordinator::new(
                    CoordinatorSettings::from_config(&cfg.distributed),
                    Arc::new(store),
                    engine.registry().clone(),
                    engine.broadcaster().clone(),
                );
                coordinator.start();
                Some(coordinator)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Redis unavailable, running in local-only mode");
                None
            }
        }
    } else {
        None
    };

    let app = build_app(AppState {
        engine: engine.clone(),
        hub,
        provider,
        coordinator: coordinator.clone(),
    });

    if let Err(err) = serve(cfg.addr(), app).await {
        eprintln!("Server error: {err}");
    }

    if let Some(coordinator) = coordinator {
        coordinator.shutdown().await;
    }
    engine.shutdown().await;
}
