use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json as SqlJson;
use sqlx::FromRow;

pub mod event;
pub mod name;
pub mod payload;
pub mod priority;
pub mod rule;

pub use event::{parse_event_name, EventName, EventSource, NewEvent};
pub use name::normalize_monitor_name;
pub use priority::{parse_priority, Priority};
pub use rule::{AlertRule, RuleIssue, ValueOperation};

/// Which of a monitor's routines a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorTask {
    Search,
    Update,
}

impl MonitorTask {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Update => "update",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueStatus {
    Active,
    Solved,
    Dropped,
}

impl IssueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Solved => "solved",
            Self::Dropped => "dropped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertStatus {
    Active,
    Solved,
}

impl AlertStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Solved => "solved",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct MonitorRow {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub queued: bool,
    pub running: bool,
    pub queued_at: Option<DateTime<Utc>>,
    pub running_at: Option<DateTime<Utc>>,
    pub search_executed_at: Option<DateTime<Utc>>,
    pub update_executed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_successful_execution: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct IssueRow {
    pub id: i64,
    pub monitor_id: i64,
    pub model_id: String,
    pub data: SqlJson<serde_json::Value>,
    pub status: String,
    pub alert_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl IssueRow {
    pub fn as_rule_issue(&self) -> RuleIssue {
        RuleIssue {
            id: self.id,
            created_at: self.created_at,
            data: self.data.0.clone(),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AlertRow {
    pub id: i64,
    pub monitor_id: i64,
    pub priority: String,
    pub status: String,
    pub locked: bool,
    pub acknowledged: SqlJson<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub solved_at: Option<DateTime<Utc>>,
}

impl AlertRow {
    pub fn priority(&self) -> Priority {
        parse_priority(&self.priority).unwrap_or(Priority::None)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct NotificationRow {
    pub id: i64,
    pub alert_id: i64,
    pub notification_class: String,
    pub target: String,
    pub status: String,
    pub min_priority_to_send: String,
    pub created_at: DateTime<Utc>,
}

