use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Closed set of lifecycle event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    AlertCreated,
    AlertUpdated,
    AlertSolved,
    AlertLocked,
    AlertUnlocked,
    AlertPriorityIncreased,
    AlertPriorityDecreased,
    AlertAcknowledged,
    AlertAcknowledgeDismissed,
    AlertIssuesLinked,
    IssueCreated,
    IssueLinked,
    IssueSolved,
    IssueDropped,
    IssueUpdatedSolved,
    IssueUpdatedNotSolved,
    MonitorEnabledChanged,
    MonitorExecutionSuccess,
    MonitorExecutionError,
    MonitorStuck,
    NotificationCreated,
    NotificationClosed,
    SearchIssuesLimitReached,
}

impl EventName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlertCreated => "alert_created",
            Self::AlertUpdated => "alert_updated",
            Self::AlertSolved => "alert_solved",
            Self::AlertLocked => "alert_locked",
            Self::AlertUnlocked => "alert_unlocked",
            Self::AlertPriorityIncreased => "alert_priority_increased",
            Self::AlertPriorityDecreased => "alert_priority_decreased",
            Self::AlertAcknowledged => "alert_acknowledged",
            Self::AlertAcknowledgeDismissed => "alert_acknowledge_dismissed",
            Self::AlertIssuesLinked => "alert_issues_linked",
            Self::IssueCreated => "issue_created",
            Self::IssueLinked => "issue_linked",
            Self::IssueSolved => "issue_solved",
            Self::IssueDropped => "issue_dropped",
            Self::IssueUpdatedSolved => "issue_updated_solved",
            Self::IssueUpdatedNotSolved => "issue_updated_not_solved",
            Self::MonitorEnabledChanged => "monitor_enabled_changed",
            Self::MonitorExecutionSuccess => "monitor_execution_success",
            Self::MonitorExecutionError => "monitor_execution_error",
            Self::MonitorStuck => "monitor_stuck",
            Self::NotificationCreated => "notification_created",
            Self::NotificationClosed => "notification_closed",
            Self::SearchIssuesLimitReached => "search_issues_limit_reached",
        }
    }
}

pub fn parse_event_name(value: &str) -> Option<EventName> {
    serde_json::from_value(JsonValue::String(value.trim().to_string())).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Monitor,
    Issue,
    Alert,
    Notification,
}

impl EventSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Monitor => "monitor",
            Self::Issue => "issue",
            Self::Alert => "alert",
            Self::Notification => "notification",
        }
    }
}

/// An event appended by a state-transition operation, before persistence.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub source: EventSource,
    pub source_id: i64,
    pub monitor_id: i64,
    pub name: EventName,
    pub data: JsonValue,
}

impl NewEvent {
    pub fn new(
        source: EventSource,
        source_id: i64,
        monitor_id: i64,
        name: EventName,
        data: JsonValue,
    ) -> Self {
        Self {
            source,
            source_id,
            monitor_id,
            name,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_round_trip_through_their_wire_form() {
        for name in [
            EventName::AlertCreated,
            EventName::AlertPriorityIncreased,
            EventName::AlertAcknowledgeDismissed,
            EventName::IssueUpdatedNotSolved,
            EventName::MonitorStuck,
            EventName::NotificationClosed,
            EventName::SearchIssuesLimitReached,
        ] {
            assert_eq!(parse_event_name(name.as_str()), Some(name));
        }
        assert_eq!(parse_event_name("alert_exploded"), None);
    }
}
