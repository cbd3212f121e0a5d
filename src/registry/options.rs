use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::domain::rule::AlertRule;
use crate::domain::Priority;

/// The options document a monitor module declares. Parsed and validated
/// at registration and on every registry reload; an invalid document
/// never replaces a loaded definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorOptionsDocument {
    #[serde(default)]
    pub monitor_options: MonitorOptions,
    pub issue_options: IssueOptions,
    #[serde(default)]
    pub alert_options: Option<AlertOptions>,
    #[serde(default)]
    pub notification_options: Vec<NotificationConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorOptions {
    pub search_cron: Option<String>,
    pub update_cron: Option<String>,
    /// Seconds; falls back to the executor's per-kind timeout.
    pub execution_timeout: Option<u64>,
    /// Falls back to the global `max_issues_creation`.
    pub max_issues_creation: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IssueOptions {
    pub model_id_key: String,
    #[serde(default = "default_true")]
    pub solvable: bool,
    #[serde(default)]
    pub unique: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertOptions {
    pub rule: AlertRule,
    #[serde(default)]
    pub dismiss_acknowledge_on_new_issues: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationConfig {
    pub notification_class: String,
    #[serde(default = "default_min_priority")]
    pub min_priority_to_send: Priority,
    #[serde(default)]
    pub mention: JsonValue,
    #[serde(default)]
    pub params: JsonValue,
}

fn default_true() -> bool {
    true
}

fn default_min_priority() -> Priority {
    Priority::Informational
}

impl MonitorOptionsDocument {
    pub fn validate(&self) -> Result<(), String> {
        if self.issue_options.model_id_key.trim().is_empty() {
            return Err("issue_options.model_id_key must not be empty".to_string());
        }
        if let Some(cron) = &self.monitor_options.search_cron {
            crate::time::parse_schedule(cron)
                .map_err(|err| format!("monitor_options.search_cron: {err}"))?;
        }
        if let Some(cron) = &self.monitor_options.update_cron {
            crate::time::parse_schedule(cron)
                .map_err(|err| format!("monitor_options.update_cron: {err}"))?;
        }
        if self.monitor_options.execution_timeout == Some(0) {
            return Err("monitor_options.execution_timeout must be >= 1".to_string());
        }
        if self.monitor_options.max_issues_creation == Some(0) {
            return Err("monitor_options.max_issues_creation must be >= 1".to_string());
        }
        if let Some(alert_options) = &self.alert_options {
            alert_options.rule.validate().map_err(|err| format!("alert_options.rule: {err}"))?;
        }
        for notification in &self.notification_options {
            if notification.notification_class.trim().is_empty() {
                return Err("notification_options.notification_class must not be empty".to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(value: serde_json::Value) -> Result<MonitorOptionsDocument, String> {
        let document: MonitorOptionsDocument =
            serde_json::from_value(value).map_err(|err| err.to_string())?;
        document.validate()?;
        Ok(document)
    }

    #[test]
    fn parses_a_complete_document() {
        let document = document(serde_json::json!({
            "monitor_options": {
                "search_cron": "*/5 * * * *",
                "update_cron": "* * * * *",
                "execution_timeout": 120,
                "max_issues_creation": 50
            },
            "issue_options": {
                "model_id_key": "host",
                "solvable": true,
                "unique": false
            },
            "alert_options": {
                "rule": {
                    "type": "count",
                    "priority_levels": { "low": 0, "high": 20 }
                },
                "dismiss_acknowledge_on_new_issues": true
            },
            "notification_options": [
                { "notification_class": "chat", "min_priority_to_send": "moderate" }
            ]
        }))
        .expect("valid document");

        assert_eq!(document.issue_options.model_id_key, "host");
        assert!(document.alert_options.is_some());
        assert_eq!(document.notification_options.len(), 1);
        assert_eq!(
            document.notification_options[0].min_priority_to_send,
            Priority::Moderate
        );
    }

    #[test]
    fn minimal_document_gets_defaults() {
        let document = document(serde_json::json!({
            "issue_options": { "model_id_key": "id" }
        }))
        .expect("minimal document");

        assert!(document.issue_options.solvable);
        assert!(!document.issue_options.unique);
        assert!(document.monitor_options.search_cron.is_none());
        assert!(document.alert_options.is_none());
        assert!(document.notification_options.is_empty());
    }

    #[test]
    fn rejects_bad_documents() {
        assert!(document(serde_json::json!({
            "issue_options": { "model_id_key": "  " }
        }))
        .is_err());

        assert!(document(serde_json::json!({
            "monitor_options": { "search_cron": "whenever" },
            "issue_options": { "model_id_key": "id" }
        }))
        .is_err());

        assert!(document(serde_json::json!({
            "issue_options": { "model_id_key": "id" },
            "alert_options": { "rule": { "type": "count", "priority_levels": {} } }
        }))
        .is_err());

        assert!(document(serde_json::json!({
            "issue_options": { "model_id_key": "id" },
            "surprise": true
        }))
        .is_err());
    }
}
