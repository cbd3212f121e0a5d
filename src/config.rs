use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const CONFIGS_FILE_ENV: &str = "CONFIGS_FILE";
pub const APPLICATION_DATABASE_ENV: &str = "DATABASE_APPLICATION";
const DATABASE_ENV_PREFIX: &str = "DATABASE_";

/// Immutable engine configuration, built once at startup and handed to
/// every component. Loaded from the YAML file named by `CONFIGS_FILE`;
/// every key has a default, so an empty file (or no file) is valid.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub plugins: Vec<String>,
    pub load_sample_monitors: bool,
    pub sample_monitors_path: Option<String>,
    pub internal_monitors_path: Option<String>,
    pub internal_monitors_notification: InternalMonitorsNotification,
    pub monitors_load_schedule: String,
    pub logging: LoggingSettings,
    pub application_database_settings: ApplicationDatabaseSettings,
    pub application_queue: QueueSettings,
    pub http_server: HttpServerSettings,
    pub time_zone: String,
    pub controller_process_schedule: String,
    pub controller_concurrency: usize,
    pub controller_procedures: BTreeMap<String, ProcedureSettings>,
    pub executor_concurrency: usize,
    pub executor_sleep: u64,
    pub executor_monitor_timeout: u64,
    pub executor_reaction_timeout: u64,
    pub executor_request_timeout: u64,
    pub executor_monitor_heartbeat_time: u64,
    pub max_issues_creation: usize,
    pub database_default_acquire_timeout: u64,
    pub database_default_query_timeout: u64,
    pub database_close_timeout: u64,
    pub database_log_query_metrics: bool,
    pub databases_pools_configs: BTreeMap<String, PoolSettings>,
    pub log_all_events: bool,
    pub shutdown_drain_timeout: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            plugins: Vec::new(),
            load_sample_monitors: false,
            sample_monitors_path: None,
            internal_monitors_path: None,
            internal_monitors_notification: InternalMonitorsNotification::default(),
            monitors_load_schedule: "*/5 * * * *".to_string(),
            logging: LoggingSettings::default(),
            application_database_settings: ApplicationDatabaseSettings::default(),
            application_queue: QueueSettings::default(),
            http_server: HttpServerSettings::default(),
            time_zone: "UTC".to_string(),
            controller_process_schedule: "* * * * *".to_string(),
            controller_concurrency: 10,
            controller_procedures: default_procedures(),
            executor_concurrency: 4,
            executor_sleep: 2,
            executor_monitor_timeout: 300,
            executor_reaction_timeout: 60,
            executor_request_timeout: 60,
            executor_monitor_heartbeat_time: 30,
            max_issues_creation: 100,
            database_default_acquire_timeout: 8,
            database_default_query_timeout: 30,
            database_close_timeout: 10,
            database_log_query_metrics: false,
            databases_pools_configs: BTreeMap::new(),
            log_all_events: false,
            shutdown_drain_timeout: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    pub mode: LoggingMode,
    /// Default env-filter directive when `RUST_LOG` is unset.
    pub format: Option<String>,
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoggingMode {
    #[default]
    Friendly,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApplicationDatabaseSettings {
    pub pool_size: u32,
}

impl Default for ApplicationDatabaseSettings {
    fn default() -> Self {
        Self { pool_size: 10 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    pub pool_size: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self { pool_size: 2 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueSettings {
    #[serde(rename = "type")]
    pub kind: QueueKind,
    pub queue_wait_message_time: u64,
    pub queue_visibility_time: u64,
    pub max_pending_messages: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            kind: QueueKind::Memory,
            queue_wait_message_time: 2,
            queue_visibility_time: 60,
            max_pending_messages: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpServerSettings {
    pub port: u16,
}

impl Default for HttpServerSettings {
    fn default() -> Self {
        Self { port: 8000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcedureSettings {
    pub schedule: String,
    pub params: JsonValue,
}

impl Default for ProcedureSettings {
    fn default() -> Self {
        Self {
            schedule: "* * * * *".to_string(),
            params: JsonValue::Null,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InternalMonitorsNotification {
    pub enabled: bool,
    pub notification_class: String,
    pub params: JsonValue,
}

impl Default for InternalMonitorsNotification {
    fn default() -> Self {
        Self {
            enabled: false,
            notification_class: "default".to_string(),
            params: JsonValue::Null,
        }
    }
}

fn default_procedures() -> BTreeMap<String, ProcedureSettings> {
    BTreeMap::from([
        (
            "monitors_stuck".to_string(),
            ProcedureSettings {
                schedule: "* * * * *".to_string(),
                params: serde_json::json!({ "time_tolerance": 120 }),
            },
        ),
        (
            "notifications_alert_solved".to_string(),
            ProcedureSettings {
                schedule: "* * * * *".to_string(),
                params: serde_json::json!({ "solved_age": 300 }),
            },
        ),
    ])
}

impl AppConfig {
    /// Loads from the file named by `CONFIGS_FILE`. An unset variable
    /// yields the defaults; a set-but-unreadable file refuses startup.
    pub fn load_from_env() -> Result<Self> {
        match std::env::var(CONFIGS_FILE_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::load(Path::new(path.trim())),
            _ => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = if contents.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(&contents)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        crate::time::parse_time_zone(&self.time_zone)?;
        crate::time::parse_schedule(&self.monitors_load_schedule)
            .context("monitors_load_schedule")?;
        crate::time::parse_schedule(&self.controller_process_schedule)
            .context("controller_process_schedule")?;
        for (name, procedure) in &self.controller_procedures {
            crate::time::parse_schedule(&procedure.schedule)
                .with_context(|| format!("controller_procedures.{name}.schedule"))?;
        }
        if self.controller_concurrency == 0 {
            anyhow::bail!("controller_concurrency must be >= 1");
        }
        if self.executor_concurrency == 0 {
            anyhow::bail!("executor_concurrency must be >= 1");
        }
        if self.executor_monitor_heartbeat_time == 0 {
            anyhow::bail!("executor_monitor_heartbeat_time must be >= 1");
        }
        if self.application_database_settings.pool_size == 0 {
            anyhow::bail!("application_database_settings.pool_size must be >= 1");
        }
        Ok(())
    }

    /// Non-fatal configuration smells, logged once the subscriber is up.
    pub fn log_advisories(&self) {
        if self.application_queue.queue_visibility_time
            < self.executor_monitor_heartbeat_time.saturating_mul(2)
        {
            tracing::warn!(
                visibility = self.application_queue.queue_visibility_time,
                heartbeat = self.executor_monitor_heartbeat_time,
                "queue visibility below twice the heartbeat interval risks redelivery of live work"
            );
        }
    }

    pub fn time_zone(&self) -> chrono_tz::Tz {
        // Checked by validate(); UTC only as a belt for hand-built configs.
        crate::time::parse_time_zone(&self.time_zone).unwrap_or(chrono_tz::UTC)
    }

    pub fn executor_timeout(&self, kind: crate::queue::MessageKind) -> Duration {
        let seconds = match kind {
            crate::queue::MessageKind::Monitor => self.executor_monitor_timeout,
            crate::queue::MessageKind::Event => self.executor_reaction_timeout,
            crate::queue::MessageKind::Request => self.executor_request_timeout,
        };
        Duration::from_secs(seconds)
    }
}

/// DSNs come from the environment, never from the config file.
#[derive(Debug, Clone)]
pub struct DatabaseDsns {
    pub application: String,
    pub named: BTreeMap<String, String>,
}

pub fn database_dsns_from_env() -> Result<DatabaseDsns> {
    let application = std::env::var(APPLICATION_DATABASE_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .with_context(|| format!("{APPLICATION_DATABASE_ENV} must be set"))?;

    let mut named = BTreeMap::new();
    for (key, value) in std::env::vars() {
        let Some(suffix) = key.strip_prefix(DATABASE_ENV_PREFIX) else {
            continue;
        };
        if suffix.eq_ignore_ascii_case("APPLICATION") || value.trim().is_empty() {
            continue;
        }
        named.insert(suffix.to_lowercase(), value.trim().to_string());
    }

    Ok(DatabaseDsns { application, named })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.controller_procedures.contains_key("monitors_stuck"));
        assert!(config
            .controller_procedures
            .contains_key("notifications_alert_solved"));
    }

    #[test]
    fn parses_a_full_document() {
        let yaml = r#"
load_sample_monitors: true
monitors_load_schedule: "*/2 * * * *"
logging:
  mode: json
  fields:
    service: sentinela
application_database_settings:
  pool_size: 20
application_queue:
  type: postgres
  queue_wait_message_time: 5
  queue_visibility_time: 120
time_zone: America/Sao_Paulo
controller_process_schedule: "* * * * *"
controller_concurrency: 3
controller_procedures:
  monitors_stuck:
    schedule: "*/3 * * * *"
    params:
      time_tolerance: 300
executor_concurrency: 8
executor_monitor_timeout: 600
databases_pools_configs:
  warehouse:
    pool_size: 4
log_all_events: true
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).expect("parse");
        assert!(config.validate().is_ok());
        assert!(config.load_sample_monitors);
        assert_eq!(config.logging.mode, LoggingMode::Json);
        assert_eq!(config.application_queue.kind, QueueKind::Postgres);
        assert_eq!(config.controller_concurrency, 3);
        assert_eq!(config.executor_concurrency, 8);
        assert_eq!(
            config
                .databases_pools_configs
                .get("warehouse")
                .map(|pool| pool.pool_size),
            Some(4)
        );
        assert_eq!(config.time_zone().name(), "America/Sao_Paulo");
        assert!(config.log_all_events);
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = serde_yaml::from_str::<AppConfig>("definitely_not_a_key: 1");
        assert!(err.is_err());
    }

    #[test]
    fn rejects_invalid_cron_and_time_zone() {
        let mut config = AppConfig::default();
        config.controller_process_schedule = "whenever".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.time_zone = "Mars/Olympus".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.executor_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_an_empty_file_as_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, "  \n").expect("write");
        let config = AppConfig::load(file.path()).expect("load");
        assert_eq!(config.executor_concurrency, 4);
    }

    #[test]
    fn missing_file_is_fatal() {
        let err = AppConfig::load(Path::new("/definitely/not/here.yaml"));
        assert!(err.is_err());
    }
}
