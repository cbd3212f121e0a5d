use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

/// Parses a cron expression. Five-field expressions (minute granularity)
/// are accepted by pinning the seconds field to zero.
pub fn parse_schedule(expression: &str) -> Result<Schedule> {
    let trimmed = expression.trim();
    let field_count = trimmed.split_whitespace().count();
    let normalized = if field_count == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized)
        .with_context(|| format!("invalid cron expression {expression:?}"))
}

pub fn parse_time_zone(name: &str) -> Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|err| anyhow::anyhow!("invalid time zone {name:?}: {err}"))
}

/// True when the schedule has a fire time in `(last, now]`, evaluated in
/// the given time zone. With no prior execution the schedule is due
/// immediately.
pub fn is_due(
    schedule: &Schedule,
    last: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    tz: Tz,
) -> bool {
    let Some(last) = last else {
        return true;
    };
    schedule
        .after(&last.with_timezone(&tz))
        .next()
        .map(|fire| fire.with_timezone(&Utc) <= now)
        .unwrap_or(false)
}

/// Next fire time strictly after `now`, as UTC.
pub fn next_fire(schedule: &Schedule, now: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
    schedule
        .after(&now.with_timezone(&tz))
        .next()
        .map(|fire| fire.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn accepts_five_and_six_field_expressions() {
        assert!(parse_schedule("* * * * *").is_ok());
        assert!(parse_schedule("*/5 * * * *").is_ok());
        assert!(parse_schedule("0 0 3 * * *").is_ok());
        assert!(parse_schedule("not a cron").is_err());
        assert!(parse_schedule("* * *").is_err());
    }

    #[test]
    fn due_without_prior_execution() {
        let schedule = parse_schedule("0 3 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        assert!(is_due(&schedule, None, now, chrono_tz::UTC));
    }

    #[test]
    fn due_only_after_a_fire_time_passes() {
        let schedule = parse_schedule("0 3 * * *").unwrap();
        let last = Utc.with_ymd_and_hms(2026, 3, 1, 3, 0, 0).unwrap();

        let before = Utc.with_ymd_and_hms(2026, 3, 2, 2, 59, 0).unwrap();
        assert!(!is_due(&schedule, Some(last), before, chrono_tz::UTC));

        let after = Utc.with_ymd_and_hms(2026, 3, 2, 3, 0, 30).unwrap();
        assert!(is_due(&schedule, Some(last), after, chrono_tz::UTC));
    }

    #[test]
    fn due_respects_the_configured_time_zone() {
        // 03:00 in Sao Paulo (UTC-3) is 06:00 UTC.
        let schedule = parse_schedule("0 3 * * *").unwrap();
        let tz: Tz = "America/Sao_Paulo".parse().unwrap();
        let last = Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).unwrap();

        let utc_3am = Utc.with_ymd_and_hms(2026, 3, 2, 3, 30, 0).unwrap();
        assert!(!is_due(&schedule, Some(last), utc_3am, tz));

        let local_3am = Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap();
        assert!(is_due(&schedule, Some(last), local_3am, tz));
    }

    #[test]
    fn next_fire_advances_strictly() {
        let schedule = parse_schedule("* * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let next = next_fire(&schedule, now, chrono_tz::UTC).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 12, 1, 0).unwrap());
    }

    #[test]
    fn time_zone_parsing() {
        assert!(parse_time_zone("UTC").is_ok());
        assert!(parse_time_zone("America/Sao_Paulo").is_ok());
        assert!(parse_time_zone("Mars/Olympus").is_err());
    }
}
