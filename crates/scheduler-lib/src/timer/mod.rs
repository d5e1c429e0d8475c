//! Recurring timer trigger
//!
//! Fires a [`PowerJob`](crate::jobs::PowerJob) on a cron schedule evaluated
//! in UTC. Each firing carries a past-due flag when it runs later than its
//! scheduled instant.

mod r#loop;

pub use r#loop::{TimerConfig, TimerLoop, TimerLoopBuilder};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TimerError {
    #[error("cron expression cannot be empty")]
    Empty,

    #[error("invalid cron expression '{expression}': {reason}")]
    Invalid { expression: String, reason: String },
}

/// A parsed six- or seven-field cron schedule (seconds first)
#[derive(Debug, Clone)]
pub struct TimerSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl TimerSchedule {
    pub fn parse(expression: &str) -> Result<Self, TimerError> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err(TimerError::Empty);
        }

        let schedule =
            cron::Schedule::from_str(expression).map_err(|e| TimerError::Invalid {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First firing strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Next firing to run given the previous one, collapsing missed firings.
    ///
    /// If several firings fell due while the previous run was in progress,
    /// only the most recent one is returned (and will be past due).
    pub fn next_due(&self, last: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut upcoming = self.schedule.after(&last);
        let mut candidate = upcoming.next()?;

        while candidate <= now {
            match upcoming.next() {
                Some(next) if next <= now => candidate = next,
                _ => break,
            }
        }

        Some(candidate)
    }
}

/// The event handed to a job on each firing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerTrigger {
    pub scheduled_at: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
    pub past_due: bool,
}

impl TimerTrigger {
    /// Build the trigger for a firing, flagging it past due beyond `threshold`
    pub fn fire(scheduled_at: DateTime<Utc>, fired_at: DateTime<Utc>, threshold: Duration) -> Self {
        let threshold = ChronoDuration::from_std(threshold).unwrap_or(ChronoDuration::zero());
        Self {
            scheduled_at,
            fired_at,
            past_due: fired_at - scheduled_at > threshold,
        }
    }

    /// Trigger for an on-demand run
    pub fn immediate() -> Self {
        let now = Utc::now();
        Self {
            scheduled_at: now,
            fired_at: now,
            past_due: false,
        }
    }

    pub fn lateness(&self) -> ChronoDuration {
        (self.fired_at - self.scheduled_at).max(ChronoDuration::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        // 2024-01-15 is a Monday
        Utc.with_ymd_and_hms(2024, 1, 15, h, m, s).unwrap()
    }

    #[test]
    fn test_parse_valid_schedule() {
        let schedule = TimerSchedule::parse("0 0 19 * * Mon-Fri").unwrap();
        assert_eq!(schedule.expression(), "0 0 19 * * Mon-Fri");
    }

    #[test]
    fn test_parse_invalid_schedule() {
        assert!(matches!(TimerSchedule::parse("   "), Err(TimerError::Empty)));

        let err = TimerSchedule::parse("every evening").unwrap_err();
        assert!(err.to_string().contains("invalid cron expression"));
    }

    #[test]
    fn test_next_after() {
        let schedule = TimerSchedule::parse("0 0 19 * * *").unwrap();

        assert_eq!(schedule.next_after(at(8, 0, 0)), Some(at(19, 0, 0)));
        // Strictly after
        assert_eq!(
            schedule.next_after(at(19, 0, 0)),
            Some(Utc.with_ymd_and_hms(2024, 1, 16, 19, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_next_due_in_future() {
        let schedule = TimerSchedule::parse("0 */5 * * * *").unwrap();

        assert_eq!(schedule.next_due(at(10, 0, 0), at(10, 1, 0)), Some(at(10, 5, 0)));
    }

    #[test]
    fn test_next_due_collapses_missed_firings() {
        let schedule = TimerSchedule::parse("0 */5 * * * *").unwrap();

        // Last run was scheduled at 10:00 and took until 10:17
        assert_eq!(schedule.next_due(at(10, 0, 0), at(10, 17, 0)), Some(at(10, 15, 0)));
    }

    #[test]
    fn test_trigger_past_due_threshold() {
        let threshold = Duration::from_secs(30);

        let on_time = TimerTrigger::fire(at(19, 0, 0), at(19, 0, 2), threshold);
        assert!(!on_time.past_due);

        let late = TimerTrigger::fire(at(19, 0, 0), at(19, 2, 0), threshold);
        assert!(late.past_due);
        assert_eq!(late.lateness().num_seconds(), 120);
    }

    #[test]
    fn test_immediate_trigger() {
        let trigger = TimerTrigger::immediate();
        assert!(!trigger.past_due);
        assert_eq!(trigger.lateness(), ChronoDuration::zero());
    }
}
