use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, DatabaseDsns};

/// The engine's own pool plus the named pools exposed to monitor modules.
#[derive(Debug, Clone)]
pub struct Pools {
    pub application: PgPool,
    pub named: BTreeMap<String, PgPool>,
}

pub fn connect(config: &AppConfig, dsns: &DatabaseDsns) -> Result<Pools> {
    let acquire = Duration::from_secs(config.database_default_acquire_timeout);
    let query_timeout = config.database_default_query_timeout;

    let application = build_pool(
        &dsns.application,
        config.application_database_settings.pool_size,
        acquire,
        query_timeout,
    )?;

    let mut named = BTreeMap::new();
    for (name, dsn) in &dsns.named {
        let pool_size = config
            .databases_pools_configs
            .get(name)
            .map(|settings| settings.pool_size)
            .unwrap_or(2);
        named.insert(
            name.clone(),
            build_pool(dsn, pool_size, acquire, query_timeout)?,
        );
    }

    Ok(Pools { application, named })
}

fn build_pool(
    database_url: &str,
    pool_size: u32,
    acquire_timeout: Duration,
    query_timeout_seconds: u64,
) -> Result<PgPool> {
    let statement_timeout = format!("SET statement_timeout = '{query_timeout_seconds}s'");
    PgPoolOptions::new()
        .max_connections(pool_size)
        .acquire_timeout(acquire_timeout)
        .after_connect(move |conn, _meta| {
            let statement_timeout = statement_timeout.clone();
            Box::pin(async move {
                conn.execute(statement_timeout.as_str()).await?;
                Ok(())
            })
        })
        .connect_lazy(database_url)
        .context("failed to create lazy database pool")
}

impl Pools {
    pub async fn close(&self, timeout: Duration) {
        let all = std::iter::once(&self.application).chain(self.named.values());
        for pool in all {
            if tokio::time::timeout(timeout, pool.close()).await.is_err() {
                tracing::warn!("database pool close timed out");
            }
        }
    }
}

/// Periodically logs pool occupancy when `database_log_query_metrics` is on.
pub fn start_pool_metrics(pools: Pools, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    tracing::info!(
                        size = pools.application.size(),
                        idle = pools.application.num_idle(),
                        "application pool occupancy"
                    );
                    for (name, pool) in &pools.named {
                        tracing::info!(
                            pool = %name,
                            size = pool.size(),
                            idle = pool.num_idle(),
                            "named pool occupancy"
                        );
                    }
                }
            }
        }
    });
}
