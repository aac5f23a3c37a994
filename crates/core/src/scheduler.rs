//! Fire-time arithmetic for time triggers.

use crate::error::{EngineError, Result};
use crate::types::TriggerSchedule;
use crate::clock::{self, MAX_DURATION_SECS};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

/// The `cron` crate wants a seconds field; plain five-field Unix
/// expressions fire at second 0.
fn normalize_cron_expr(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        expression.trim().to_string()
    }
}

fn parse_cron(expression: &str) -> Result<Schedule> {
    Schedule::from_str(&normalize_cron_expr(expression)).map_err(|e| {
        EngineError::validation(format!("invalid cron expression '{}': {}", expression, e))
    })
}

/// Reject schedules that could never fire
pub fn validate_schedule(schedule: &TriggerSchedule) -> Result<()> {
    match schedule {
        TriggerSchedule::Once => Ok(()),
        TriggerSchedule::Interval { secs } if *secs == 0 => Err(EngineError::validation(
            "interval trigger needs secs > 0",
        )),
        TriggerSchedule::Interval { secs } if *secs > MAX_DURATION_SECS => {
            Err(EngineError::validation(format!(
                "interval of {} seconds exceeds the {} second limit",
                secs, MAX_DURATION_SECS
            )))
        }
        TriggerSchedule::Interval { .. } => Ok(()),
        TriggerSchedule::Cron { expression } => parse_cron(expression).map(|_| ()),
    }
}

/// First fire time strictly after `after`; `None` for one-shot triggers and
/// when no later time is representable
pub fn next_fire_after(
    schedule: &TriggerSchedule,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match schedule {
        TriggerSchedule::Once => Ok(None),
        TriggerSchedule::Interval { secs } => Ok(clock::after(after, *secs)),
        TriggerSchedule::Cron { expression } => Ok(parse_cron(expression)?.after(&after).next()),
    }
}

/// Next fire time once the trigger fired for `fired_at`, skipping slots that
/// already passed while no worker was polling
pub fn next_fire_time(
    schedule: &TriggerSchedule,
    fired_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let Some(mut next) = next_fire_after(schedule, fired_at)? else {
        return Ok(None);
    };
    if next <= now {
        tracing::debug!("Skipping missed trigger slots up to {}", now);
        match next_fire_after(schedule, now)? {
            Some(upcoming) => next = upcoming,
            None => return Ok(None),
        }
    }
    Ok(Some(next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_normalize_cron_expr() {
        assert_eq!(normalize_cron_expr("*/15 * * * *"), "0 */15 * * * *");
        assert_eq!(normalize_cron_expr("30 0 * * * *"), "30 0 * * * *");
    }

    #[test]
    fn test_cron_next_fire() {
        let schedule = TriggerSchedule::Cron {
            expression: "*/15 * * * *".to_string(),
        };
        assert_eq!(
            next_fire_after(&schedule, at(10, 7, 0)).unwrap(),
            Some(at(10, 15, 0))
        );
        // Strictly after
        assert_eq!(
            next_fire_after(&schedule, at(10, 15, 0)).unwrap(),
            Some(at(10, 30, 0))
        );
    }

    #[test]
    fn test_interval_and_once() {
        let interval = TriggerSchedule::Interval { secs: 90 };
        assert_eq!(
            next_fire_after(&interval, at(8, 0, 0)).unwrap(),
            Some(at(8, 1, 30))
        );
        assert_eq!(next_fire_after(&TriggerSchedule::Once, at(8, 0, 0)).unwrap(), None);
    }

    #[test]
    fn test_oversized_interval_never_panics() {
        let huge = TriggerSchedule::Interval { secs: u64::MAX };
        assert!(validate_schedule(&huge).is_err());
        assert_eq!(next_fire_after(&huge, at(8, 0, 0)).unwrap(), None);
        assert_eq!(next_fire_time(&huge, at(8, 0, 0), at(9, 0, 0)).unwrap(), None);

        let largest = TriggerSchedule::Interval {
            secs: MAX_DURATION_SECS,
        };
        assert!(validate_schedule(&largest).is_ok());
        assert!(next_fire_after(&largest, at(8, 0, 0)).unwrap().is_some());
    }

    #[test]
    fn test_missed_slots_are_skipped() {
        let interval = TriggerSchedule::Interval { secs: 60 };
        let next = next_fire_time(&interval, at(8, 0, 0), at(8, 10, 30)).unwrap();
        assert_eq!(next, Some(at(8, 11, 30)));
    }

    #[test]
    fn test_validation() {
        assert!(validate_schedule(&TriggerSchedule::Interval { secs: 0 }).is_err());
        assert!(validate_schedule(&TriggerSchedule::Cron {
            expression: "not a cron".into()
        })
        .is_err());
        assert!(validate_schedule(&TriggerSchedule::Cron {
            expression: "0 0 * * *".into()
        })
        .is_ok());
    }
}
