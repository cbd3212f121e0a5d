use anyhow::Result;
use chrono::Utc;
use chrono_tz::Tz;
use sqlx::{FromRow, PgPool};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::domain::{normalize_monitor_name, EventName};
use crate::store::{ReactionLookup, Store};

pub mod definition;
pub mod options;

pub use definition::{
    MonitorContext, MonitorDefinition, MonitorModule, ReactionBinding, ReactionFn,
    APPLICATION_POOL,
};
pub use options::{
    AlertOptions, IssueOptions, MonitorOptions, MonitorOptionsDocument, NotificationConfig,
};

/// Advisory lock key electing the sole registrar of built-in monitors.
const REGISTRAR_LOCK_KEY: i64 = 0x53_45_4e_54_49_4e_45;
/// Minimum spacing between early-wake reloads.
const EARLY_LOAD_MARGIN: Duration = Duration::from_secs(10);

/// Compiled monitor modules available to this process, keyed by
/// normalized name.
#[derive(Default)]
pub struct ModuleCatalog {
    modules: BTreeMap<String, Arc<dyn MonitorModule>>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, module: Arc<dyn MonitorModule>) -> Result<()> {
        let name = normalize_monitor_name(module.name());
        if name.is_empty() {
            anyhow::bail!("module name {:?} normalizes to an empty string", module.name());
        }
        if self.modules.insert(name.clone(), module).is_some() {
            anyhow::bail!("duplicate monitor module {name:?}");
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MonitorModule>> {
        self.modules.get(&normalize_monitor_name(name)).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn MonitorModule>)> {
        self.modules.iter()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[derive(Default)]
struct Snapshot {
    by_name: HashMap<String, Arc<MonitorDefinition>>,
    by_id: HashMap<i64, Arc<MonitorDefinition>>,
}

#[derive(Debug, Clone, FromRow)]
struct EnabledMonitorRow {
    id: i64,
    name: String,
}

/// Live catalogue of loaded monitor definitions. Readers clone an `Arc`
/// snapshot under a short read lock; reloads build a fresh snapshot and
/// swap it in.
pub struct Registry {
    pool: PgPool,
    catalog: ModuleCatalog,
    snapshot: RwLock<Arc<Snapshot>>,
    reload_requested: Notify,
    schedule: cron::Schedule,
    tz: Tz,
}

impl Registry {
    pub fn new(
        pool: PgPool,
        catalog: ModuleCatalog,
        schedule: cron::Schedule,
        tz: Tz,
    ) -> Self {
        Self {
            pool,
            catalog,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            reload_requested: Notify::new(),
            schedule,
            tz,
        }
    }

    pub fn catalog(&self) -> &ModuleCatalog {
        &self.catalog
    }

    pub fn get(&self, name: &str) -> Option<Arc<MonitorDefinition>> {
        let snapshot = self.snapshot.read().expect("registry lock poisoned").clone();
        snapshot.by_name.get(&normalize_monitor_name(name)).cloned()
    }

    pub fn get_by_id(&self, monitor_id: i64) -> Option<Arc<MonitorDefinition>> {
        let snapshot = self.snapshot.read().expect("registry lock poisoned").clone();
        snapshot.by_id.get(&monitor_id).cloned()
    }

    pub fn definitions(&self) -> Vec<Arc<MonitorDefinition>> {
        let snapshot = self.snapshot.read().expect("registry lock poisoned").clone();
        let mut definitions: Vec<Arc<MonitorDefinition>> =
            snapshot.by_id.values().cloned().collect();
        definitions.sort_by_key(|definition| definition.monitor_id);
        definitions
    }

    /// Signals the loader that a consumer missed a monitor.
    pub fn request_reload(&self) {
        self.reload_requested.notify_one();
    }

    /// Re-reads enabled monitors and atomically replaces the mapping.
    /// Rows without a catalogue module and modules with invalid options
    /// are skipped, never unloading a previously good definition map.
    pub async fn reload(&self) -> Result<usize> {
        let rows: Vec<EnabledMonitorRow> = sqlx::query_as(
            r#"
            SELECT id, name
            FROM monitors
            WHERE enabled = TRUE
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut next = Snapshot::default();
        for row in rows {
            let Some(module) = self.catalog.get(&row.name) else {
                tracing::debug!(monitor = %row.name, "no module for registered monitor");
                continue;
            };
            match MonitorDefinition::build(row.id, row.name.clone(), module) {
                Ok(definition) => {
                    let definition = Arc::new(definition);
                    next.by_name.insert(definition.name.clone(), definition.clone());
                    next.by_id.insert(definition.monitor_id, definition);
                }
                Err(err) => {
                    tracing::error!(monitor = %row.name, error = %err, "monitor options invalid; skipping");
                    crate::metrics::incr(crate::metrics::VALIDATION_ERRORS);
                }
            }
        }

        let loaded = next.by_id.len();
        *self.snapshot.write().expect("registry lock poisoned") = Arc::new(next);
        tracing::debug!(loaded, "registry reloaded");
        Ok(loaded)
    }

    /// Reload loop: fires on the configured cron, or earlier when a
    /// consumer requests it (spaced by the early-load margin).
    pub fn start(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next_tick = crate::time::next_fire(&self.schedule, now, self.tz)
                    .map(|fire| (fire - now).to_std().unwrap_or(Duration::ZERO))
                    .unwrap_or(Duration::from_secs(60));

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(next_tick) => {}
                    _ = self.reload_requested.notified() => {
                        // Collapse bursts of wake requests.
                        tokio::time::sleep(EARLY_LOAD_MARGIN.min(next_tick)).await;
                    }
                }

                if let Err(err) = self.reload().await {
                    tracing::warn!(error = %err, "registry reload failed");
                }
            }
        });
    }
}

impl ReactionLookup for Registry {
    fn has_reaction(&self, monitor_id: i64, event: EventName) -> bool {
        self.get_by_id(monitor_id)
            .map(|definition| definition.has_reaction(event))
            .unwrap_or(false)
    }
}

/// Registers every catalogue module in the store. Guarded by an advisory
/// lock so duplicate controllers insert once; the upserts are idempotent
/// regardless.
pub async fn register_modules(store: &Store, catalog: &ModuleCatalog) -> Result<usize> {
    let mut conn = store.pool().acquire().await?;
    let (elected,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
        .bind(REGISTRAR_LOCK_KEY)
        .fetch_one(&mut *conn)
        .await?;
    if !elected {
        tracing::info!("another process holds the registrar lock; skipping registration");
        return Ok(0);
    }

    let result = register_all(store, catalog).await;

    let unlock: Result<(bool,), sqlx::Error> = sqlx::query_as("SELECT pg_advisory_unlock($1)")
        .bind(REGISTRAR_LOCK_KEY)
        .fetch_one(&mut *conn)
        .await;
    if let Err(err) = unlock {
        // The lock dies with the session either way.
        tracing::warn!(error = %err, "registrar unlock failed");
    }
    result
}

async fn register_all(store: &Store, catalog: &ModuleCatalog) -> Result<usize> {
    let mut registered = 0;
    for (name, module) in catalog.iter() {
        let document = module.options();
        if let Err(err) = document.validate() {
            anyhow::bail!("module {name:?} declares invalid options: {err}");
        }
        let source = module.source();
        let options_json = serde_json::to_string(&document)?;
        let code_hash =
            crate::ids::stable_hex_id("monitor-code", &format!("{source}|{options_json}"));
        let monitor_id = store.register_monitor(name, &source, &code_hash).await?;
        tracing::info!(monitor = %name, monitor_id, "registered monitor");
        registered += 1;
    }
    Ok(registered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::options::MonitorOptionsDocument;
    use async_trait::async_trait;
    use serde_json::Value as JsonValue;

    struct FakeModule {
        name: String,
    }

    #[async_trait]
    impl MonitorModule for FakeModule {
        fn name(&self) -> &str {
            &self.name
        }

        fn options(&self) -> MonitorOptionsDocument {
            serde_json::from_value(serde_json::json!({
                "monitor_options": { "search_cron": "*/5 * * * *" },
                "issue_options": { "model_id_key": "id" }
            }))
            .expect("options")
        }

        async fn search(&self, _ctx: &MonitorContext) -> Result<Option<Vec<JsonValue>>> {
            Ok(None)
        }

        fn is_solved(&self, _data: &JsonValue) -> Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn catalog_normalizes_names_and_rejects_duplicates() {
        let mut catalog = ModuleCatalog::new();
        catalog
            .insert(Arc::new(FakeModule {
                name: "CPU Load".to_string(),
            }))
            .expect("insert");
        assert!(catalog.get("cpu_load").is_some());
        assert!(catalog.get("CPU  load").is_some());

        let err = catalog.insert(Arc::new(FakeModule {
            name: "cpu_load".to_string(),
        }));
        assert!(err.is_err());
    }

    #[test]
    fn definitions_pre_parse_their_schedules() {
        let module: Arc<dyn MonitorModule> = Arc::new(FakeModule {
            name: "cpu_load".to_string(),
        });
        let definition =
            MonitorDefinition::build(7, "cpu_load".to_string(), module).expect("definition");
        assert!(definition.search_schedule.is_some());
        assert!(definition.update_schedule.is_none());
        assert_eq!(definition.monitor_id, 7);
        assert!(!definition.has_reaction(EventName::AlertCreated));
    }
}
