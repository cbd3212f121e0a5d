use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use super::priority::Priority;

/// Aggregation rule mapping a monitor's active issues to an alert priority.
///
/// All level comparisons are strict: a measurement exactly equal to a level
/// does not trigger that level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertRule {
    Count {
        priority_levels: BTreeMap<Priority, i64>,
    },
    Age {
        priority_levels: BTreeMap<Priority, i64>,
    },
    Value {
        value_key: String,
        operation: ValueOperation,
        priority_levels: BTreeMap<Priority, f64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueOperation {
    GreaterThan,
    LessThan,
}

/// The slice of an issue the rules need. Callers pass active issues only.
#[derive(Debug, Clone)]
pub struct RuleIssue {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub data: JsonValue,
}

impl AlertRule {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Count { priority_levels } | Self::Age { priority_levels } => {
                if priority_levels.is_empty() {
                    return Err("rule requires at least one priority level".to_string());
                }
                if priority_levels.contains_key(&Priority::None) {
                    return Err("priority level 'none' is not assignable".to_string());
                }
                if priority_levels.values().any(|level| *level < 0) {
                    return Err("priority levels must be >= 0".to_string());
                }
            }
            Self::Value {
                value_key,
                priority_levels,
                ..
            } => {
                if value_key.trim().is_empty() {
                    return Err("value rule requires value_key".to_string());
                }
                if priority_levels.is_empty() {
                    return Err("rule requires at least one priority level".to_string());
                }
                if priority_levels.contains_key(&Priority::None) {
                    return Err("priority level 'none' is not assignable".to_string());
                }
                if priority_levels.values().any(|level| !level.is_finite()) {
                    return Err("priority levels must be finite".to_string());
                }
            }
        }
        Ok(())
    }

    /// Deterministic evaluation over the currently active issues.
    pub fn evaluate(&self, issues: &[RuleIssue], now: DateTime<Utc>) -> Priority {
        if issues.is_empty() {
            return Priority::None;
        }
        match self {
            Self::Count { priority_levels } => {
                let count = issues.len() as i64;
                highest_triggered_int(priority_levels, count)
            }
            Self::Age { priority_levels } => {
                let age = issues
                    .iter()
                    .map(|issue| (now - issue.created_at).num_seconds())
                    .max()
                    .unwrap_or(0);
                highest_triggered_int(priority_levels, age)
            }
            Self::Value {
                value_key,
                operation,
                priority_levels,
            } => {
                // Stable by issue id so ties resolve the same way every pass.
                let mut ordered: Vec<&RuleIssue> = issues.iter().collect();
                ordered.sort_by_key(|issue| issue.id);

                let mut result = Priority::None;
                for issue in ordered {
                    let Some(value) = numeric_field(&issue.data, value_key) else {
                        continue;
                    };
                    let triggered = highest_triggered_value(priority_levels, *operation, value);
                    result = Priority::most_severe(result, triggered);
                }
                result
            }
        }
    }
}

fn highest_triggered_int(levels: &BTreeMap<Priority, i64>, measured: i64) -> Priority {
    let mut result = Priority::None;
    for (priority, level) in levels {
        if measured > *level {
            result = Priority::most_severe(result, *priority);
        }
    }
    result
}

fn highest_triggered_value(
    levels: &BTreeMap<Priority, f64>,
    operation: ValueOperation,
    value: f64,
) -> Priority {
    let mut result = Priority::None;
    for (priority, level) in levels {
        let triggered = match operation {
            ValueOperation::GreaterThan => *level < value,
            ValueOperation::LessThan => *level > value,
        };
        if triggered {
            result = Priority::most_severe(result, *priority);
        }
    }
    result
}

fn numeric_field(data: &JsonValue, key: &str) -> Option<f64> {
    match data.get(key)? {
        JsonValue::Number(number) => number.as_f64(),
        JsonValue::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn issue(id: i64, created_at: DateTime<Utc>, data: JsonValue) -> RuleIssue {
        RuleIssue {
            id,
            created_at,
            data,
        }
    }

    fn issues_at(now: DateTime<Utc>, count: usize) -> Vec<RuleIssue> {
        (0..count)
            .map(|index| issue(index as i64, now, serde_json::json!({})))
            .collect()
    }

    fn count_rule() -> AlertRule {
        AlertRule::Count {
            priority_levels: BTreeMap::from([
                (Priority::Low, 0),
                (Priority::Moderate, 10),
                (Priority::High, 20),
                (Priority::Critical, 30),
            ]),
        }
    }

    #[test]
    fn count_rule_promotion_ladder() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let rule = count_rule();

        assert_eq!(rule.evaluate(&issues_at(now, 11), now), Priority::Moderate);
        assert_eq!(rule.evaluate(&issues_at(now, 21), now), Priority::High);
        // After solving down to 15 active issues the alert demotes.
        assert_eq!(rule.evaluate(&issues_at(now, 15), now), Priority::Moderate);
    }

    #[test]
    fn count_rule_equal_to_level_does_not_trigger() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let rule = count_rule();

        assert_eq!(rule.evaluate(&issues_at(now, 10), now), Priority::Low);
        assert_eq!(rule.evaluate(&issues_at(now, 20), now), Priority::Moderate);
    }

    #[test]
    fn count_rule_no_issues_is_none() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(count_rule().evaluate(&[], now), Priority::None);
    }

    #[test]
    fn age_rule_uses_oldest_issue() {
        let rule = AlertRule::Age {
            priority_levels: BTreeMap::from([(Priority::Low, 60), (Priority::High, 300)]),
        };
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let issues = vec![issue(1, start, serde_json::json!({}))];

        let at_65 = start + chrono::Duration::seconds(65);
        assert_eq!(rule.evaluate(&issues, at_65), Priority::Low);

        let at_301 = start + chrono::Duration::seconds(301);
        assert_eq!(rule.evaluate(&issues, at_301), Priority::High);

        let at_60 = start + chrono::Duration::seconds(60);
        assert_eq!(rule.evaluate(&issues, at_60), Priority::None);
    }

    #[test]
    fn value_rule_greater_than_is_strict() {
        let rule = AlertRule::Value {
            value_key: "value".to_string(),
            operation: ValueOperation::GreaterThan,
            priority_levels: BTreeMap::from([
                (Priority::Low, 10.0),
                (Priority::Moderate, 50.0),
                (Priority::High, 90.0),
            ]),
        };
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let issues: Vec<RuleIssue> = [10.0, 50.0, 51.0]
            .iter()
            .enumerate()
            .map(|(index, value)| {
                issue(index as i64, now, serde_json::json!({ "value": value }))
            })
            .collect();

        // 50 is not > 50, so the moderate level only triggers at 51.
        assert_eq!(rule.evaluate(&issues, now), Priority::Moderate);
        assert_eq!(rule.evaluate(&issues[..1], now), Priority::None);
        assert_eq!(rule.evaluate(&issues[..2], now), Priority::Low);
    }

    #[test]
    fn value_rule_less_than_inverts_the_comparison() {
        let rule = AlertRule::Value {
            value_key: "free_mb".to_string(),
            operation: ValueOperation::LessThan,
            priority_levels: BTreeMap::from([
                (Priority::Moderate, 1024.0),
                (Priority::Critical, 128.0),
            ]),
        };
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();

        let healthy = vec![issue(1, now, serde_json::json!({"free_mb": 4096}))];
        assert_eq!(rule.evaluate(&healthy, now), Priority::None);

        let shrinking = vec![issue(1, now, serde_json::json!({"free_mb": 512}))];
        assert_eq!(rule.evaluate(&shrinking, now), Priority::Moderate);

        let exhausted = vec![issue(1, now, serde_json::json!({"free_mb": 64}))];
        assert_eq!(rule.evaluate(&exhausted, now), Priority::Critical);
    }

    #[test]
    fn value_rule_skips_non_numeric_payloads() {
        let rule = AlertRule::Value {
            value_key: "value".to_string(),
            operation: ValueOperation::GreaterThan,
            priority_levels: BTreeMap::from([(Priority::Low, 0.0)]),
        };
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let issues = vec![
            issue(1, now, serde_json::json!({"value": "not a number"})),
            issue(2, now, serde_json::json!({"other": 3})),
            issue(3, now, serde_json::json!({"value": "7"})),
        ];

        // Numeric strings still count; everything else is ignored.
        assert_eq!(rule.evaluate(&issues, now), Priority::Low);
    }

    #[test]
    fn validation_rejects_empty_and_unassignable_levels() {
        let empty = AlertRule::Count {
            priority_levels: BTreeMap::new(),
        };
        assert!(empty.validate().is_err());

        let none_level = AlertRule::Count {
            priority_levels: BTreeMap::from([(Priority::None, 1)]),
        };
        assert!(none_level.validate().is_err());

        let blank_key = AlertRule::Value {
            value_key: "  ".to_string(),
            operation: ValueOperation::GreaterThan,
            priority_levels: BTreeMap::from([(Priority::Low, 1.0)]),
        };
        assert!(blank_key.validate().is_err());
    }

    #[test]
    fn rules_deserialize_from_tagged_documents() {
        let rule: AlertRule = serde_json::from_value(serde_json::json!({
            "type": "value",
            "value_key": "lag_seconds",
            "operation": "greater_than",
            "priority_levels": { "moderate": 60, "critical": 600 }
        }))
        .expect("value rule");
        assert!(matches!(rule, AlertRule::Value { .. }));

        let rule: AlertRule = serde_json::from_value(serde_json::json!({
            "type": "count",
            "priority_levels": { "low": 0 }
        }))
        .expect("count rule");
        assert!(rule.validate().is_ok());
    }
}
