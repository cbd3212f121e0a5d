use serde::{Deserialize, Serialize};

/// Alert priority scale. Declaration order is severity order, most severe
/// first, so the derived `Ord` sorts critical ahead of informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Moderate,
    Low,
    Informational,
    None,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Moderate => "moderate",
            Self::Low => "low",
            Self::Informational => "informational",
            Self::None => "none",
        }
    }

    /// Lower rank means more severe.
    pub fn rank(self) -> i32 {
        match self {
            Self::Critical => 1,
            Self::High => 2,
            Self::Moderate => 3,
            Self::Low => 4,
            Self::Informational => 5,
            Self::None => 99,
        }
    }

    pub fn more_severe_than(self, other: Priority) -> bool {
        self.rank() < other.rank()
    }

    pub fn most_severe(a: Priority, b: Priority) -> Priority {
        if a.more_severe_than(b) {
            a
        } else {
            b
        }
    }
}

pub fn parse_priority(value: &str) -> Option<Priority> {
    match value.trim().to_lowercase().as_str() {
        "critical" => Some(Priority::Critical),
        "high" => Some(Priority::High),
        "moderate" => Some(Priority::Moderate),
        "low" => Some(Priority::Low),
        "informational" => Some(Priority::Informational),
        "none" => Some(Priority::None),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_puts_critical_first() {
        assert!(Priority::Critical.more_severe_than(Priority::High));
        assert!(Priority::High.more_severe_than(Priority::Moderate));
        assert!(Priority::Moderate.more_severe_than(Priority::Low));
        assert!(Priority::Low.more_severe_than(Priority::Informational));
        assert!(Priority::Informational.more_severe_than(Priority::None));
        assert!(!Priority::None.more_severe_than(Priority::Critical));
    }

    #[test]
    fn most_severe_picks_the_lower_rank() {
        assert_eq!(
            Priority::most_severe(Priority::Low, Priority::High),
            Priority::High
        );
        assert_eq!(
            Priority::most_severe(Priority::None, Priority::Informational),
            Priority::Informational
        );
    }

    #[test]
    fn parses_round_trip() {
        for priority in [
            Priority::Critical,
            Priority::High,
            Priority::Moderate,
            Priority::Low,
            Priority::Informational,
            Priority::None,
        ] {
            assert_eq!(parse_priority(priority.as_str()), Some(priority));
        }
        assert_eq!(parse_priority("p1"), None);
    }
}
