//! Postkeys server entry point.
//!
//! Wires the pieces together: configuration, logging, the connection
//! pool and schema, the cache stack, the three listener tasks, the
//! storage janitor, and the accept loop. Shutdown is a single
//! cancellation signal fanned out over a watch channel; a second signal
//! or an expired drain budget exits with status 1.

use clap::Parser;
use postkeys::cache::{
    spawn_invalidation_listener, Cache, CacheLayer, CachePolicy, InvalidationPublisher,
};
use postkeys::commands::{CommandHandler, ServerContext};
use postkeys::config::Config;
use postkeys::pubsub::hub::{spawn_hub_listener, Hub};
use postkeys::pubsub::notifier::{spawn_notifier_listener, ListNotifier};
use postkeys::server::{serve, ServerStats};
use postkeys::storage::{schema, start_janitor, Store};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(version = postkeys::VERSION, "postkeys starting");
    if config.db_sslmode == "require" {
        warn!("db-sslmode=require requested but TLS is not compiled in; connections use NoTls");
    }
    if let Some(addr) = &config.metrics_addr {
        info!(addr = %addr, "metrics-addr accepted but no exporter is built in");
    }

    // Pool and schema
    let pool = config.build_pool()?;
    {
        let client = pool.get().await?;
        let client: &tokio_postgres::Client = &client;
        schema::ensure_schema(client).await?;
    }
    let pg_config = config.pg_config();
    let store = Store::new(pool.clone());

    // Single cancellation signal fanned out to every task
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Cache stack
    let cache_layer = if config.cache_enabled {
        let cache = Cache::new(config.cache_ttl, config.cache_max_size, None);
        let publisher = if config.cache_distributed_invalidation {
            spawn_invalidation_listener(
                pg_config.clone(),
                Arc::clone(&cache),
                shutdown_rx.clone(),
            );
            Some(InvalidationPublisher::new(pool.clone()))
        } else {
            None
        };
        let policy = config
            .cache_smart_policy
            .then(|| CachePolicy::new(config.policy_config()));
        info!(
            ttl = ?config.cache_ttl,
            max_size = config.cache_max_size,
            distributed = config.cache_distributed_invalidation,
            smart_policy = config.cache_smart_policy,
            "read cache enabled"
        );
        CacheLayer::new(Some(cache), policy, publisher)
    } else {
        info!("read cache disabled");
        CacheLayer::disabled()
    };

    // Pub/sub hub and block-list notifier, each on a dedicated
    // listener connection
    let (hub, hub_cmd_rx) = Hub::new(pool.clone());
    spawn_hub_listener(
        Arc::clone(&hub),
        hub_cmd_rx,
        pg_config.clone(),
        shutdown_rx.clone(),
    );
    let (notifier, notifier_cmd_rx) = ListNotifier::new();
    spawn_notifier_listener(
        Arc::clone(&notifier),
        notifier_cmd_rx,
        pg_config.clone(),
        shutdown_rx.clone(),
    );

    // Expired-row reaper
    let janitor = start_janitor(store.clone());

    let stats = Arc::new(ServerStats::new());
    let ctx = Arc::new(ServerContext {
        store,
        cache: cache_layer,
        hub,
        notifier,
        auth_password: config.auth_password.clone(),
        start_time: Instant::now(),
        stats,
    });
    let handler = CommandHandler::new(Arc::clone(&ctx));

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "listening");

    let serve_task = tokio::spawn(serve(
        listener,
        handler,
        shutdown_rx.clone(),
        config.pubsub_outbound_buffer,
    ));

    // First signal: graceful stop. Second signal: immediate exit(1).
    signal::ctrl_c().await?;
    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);

    let drained = tokio::select! {
        result = serve_task => result.unwrap_or(false),
        _ = signal::ctrl_c() => {
            error!("second shutdown signal, exiting immediately");
            std::process::exit(1);
        }
    };

    ctx.cache.stop();
    janitor.stop();

    if !drained {
        error!("sessions did not drain within the shutdown budget");
        std::process::exit(1);
    }
    info!("server shutdown complete");
    Ok(())
}
