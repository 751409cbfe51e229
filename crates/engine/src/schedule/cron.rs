//! Cron normalization and the default cron evaluator.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use super::ScheduleError;

/// Normalize a 5-field cron expression to 6-field by prepending "0 " for seconds.
///
/// The `cron` crate requires 6 fields: `sec min hour day-of-month month day-of-week`.
/// Admins usually write standard 5-field cron: `min hour day-of-month month day-of-week`.
pub fn normalize_cron(expr: &str) -> String {
    let trimmed = expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

/// "Next occurrence after T in timezone Z": the only contract the
/// scheduler needs from a cron implementation.
pub trait CronEvaluator: Send + Sync {
    /// Check that an expression parses.
    fn validate(&self, expr: &str) -> Result<(), ScheduleError>;

    /// First occurrence strictly after `after`, evaluated in `tz`.
    fn next_after(
        &self,
        expr: &str,
        after: DateTime<Utc>,
        tz: Tz,
    ) -> Result<DateTime<Utc>, ScheduleError>;
}

/// [`CronEvaluator`] backed by the `cron` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct CronCrateEvaluator;

impl CronCrateEvaluator {
    fn parse(expr: &str) -> Result<Schedule, ScheduleError> {
        Schedule::from_str(&normalize_cron(expr)).map_err(|e| ScheduleError::InvalidCron {
            expr: expr.to_string(),
            reason: e.to_string(),
        })
    }
}

impl CronEvaluator for CronCrateEvaluator {
    fn validate(&self, expr: &str) -> Result<(), ScheduleError> {
        Self::parse(expr).map(|_| ())
    }

    fn next_after(
        &self,
        expr: &str,
        after: DateTime<Utc>,
        tz: Tz,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        let schedule = Self::parse(expr)?;
        let local = after.with_timezone(&tz);
        schedule
            .after(&local)
            .next()
            .map(|next| next.with_timezone(&Utc))
            .ok_or_else(|| ScheduleError::NoUpcoming(expr.to_string()))
    }
}
