use anyhow::Result;
use clap::Parser;
use sentinela::bus::OutboxFlusher;
use sentinela::cli::{self, Role};
use sentinela::controller::{procedures::Procedures, Controller};
use sentinela::executor::{ActionRegistry, Executor};
use sentinela::registry::{self, Registry, APPLICATION_POOL};
use sentinela::store::{EventPolicy, Store};
use sentinela::{config, db, logging, monitors, queue, time};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    let config = config::AppConfig::load_from_env()?;
    logging::init(&config.logging);
    config.log_advisories();

    let dsns = config::database_dsns_from_env()?;
    let pools = db::connect(&config, &dsns)?;
    let cancel = CancellationToken::new();
    if config.database_log_query_metrics {
        db::start_pool_metrics(pools.clone(), cancel.clone());
    }

    let catalog = monitors::catalog(&config)?;
    let load_schedule = time::parse_schedule(&config.monitors_load_schedule)?;
    let registry = Arc::new(Registry::new(
        pools.application.clone(),
        catalog,
        load_schedule,
        config.time_zone(),
    ));
    let store = Store::new(
        pools.application.clone(),
        EventPolicy {
            log_all_events: config.log_all_events,
            reactions: registry.clone(),
        },
    );
    let queue = queue::build(&config.application_queue, &pools.application);

    let run_controller = args.has_role(Role::Controller);
    let run_executor = args.has_role(Role::Executor);

    if run_controller {
        let registered = registry::register_modules(&store, registry.catalog()).await?;
        tracing::info!(registered, "monitor registration complete");
    }
    let loaded = registry.reload().await?;
    tracing::info!(loaded, "registry loaded");

    registry.clone().start(cancel.clone());
    OutboxFlusher::new(store.clone(), queue.clone()).start(cancel.clone());

    if run_controller {
        Controller::new(
            store.clone(),
            registry.clone(),
            queue.clone(),
            config.clone(),
        )
        .start(cancel.clone());
        Procedures::new(store.clone(), config.clone()).start(cancel.clone());
        tracing::info!("controller started");
    }

    let mut workers = Vec::new();
    if run_executor {
        let mut context_pools = pools.named.clone();
        context_pools.insert(APPLICATION_POOL.to_string(), pools.application.clone());
        let executor = Arc::new(Executor::new(
            store,
            registry,
            queue,
            Arc::new(context_pools),
            Arc::new(ActionRegistry::new()),
            config.clone(),
        ));
        workers = executor.start(cancel.clone());
        tracing::info!(concurrency = config.executor_concurrency, "executor started");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    // Two-phase: stop accepting work, drain in-flight, then close pools.
    cancel.cancel();
    let drain = Duration::from_secs(config.shutdown_drain_timeout);
    if tokio::time::timeout(drain, futures::future::join_all(workers))
        .await
        .is_err()
    {
        tracing::warn!("drain deadline reached with handlers still in flight");
    }
    pools
        .close(Duration::from_secs(config.database_close_timeout))
        .await;
    tracing::info!("shutdown complete");
    Ok(())
}
