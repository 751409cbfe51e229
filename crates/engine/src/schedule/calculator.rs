//! [`ScheduleCalculator`]: next-due, period and staleness computations.

use std::sync::Arc;

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::types::{Frequency, Recurrence};

use super::cron::{CronCrateEvaluator, CronEvaluator};
use super::ScheduleError;

/// Pure recurrence arithmetic over a swappable cron evaluator.
#[derive(Clone)]
pub struct ScheduleCalculator {
    cron: Arc<dyn CronEvaluator>,
}

impl Default for ScheduleCalculator {
    fn default() -> Self {
        Self::new(Arc::new(CronCrateEvaluator))
    }
}

impl std::fmt::Debug for ScheduleCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleCalculator").finish_non_exhaustive()
    }
}

impl ScheduleCalculator {
    pub fn new(cron: Arc<dyn CronEvaluator>) -> Self {
        Self { cron }
    }

    /// Validate frequency, cron expression and timezone as a unit.
    pub fn validate(&self, recurrence: &Recurrence) -> Result<(), ScheduleError> {
        match recurrence.frequency {
            Frequency::Custom => {
                let expr = cron_expression(recurrence)?;
                let tz = recurrence
                    .timezone
                    .as_deref()
                    .filter(|s| !s.trim().is_empty())
                    .ok_or(ScheduleError::MissingTimezone)?;
                parse_timezone(tz)?;
                self.cron.validate(expr)
            }
            fixed => {
                if recurrence
                    .cron_expression
                    .as_deref()
                    .is_some_and(|s| !s.trim().is_empty())
                {
                    return Err(ScheduleError::UnexpectedCron(fixed));
                }
                parse_timezone(recurrence.timezone_name()).map(|_| ())
            }
        }
    }

    /// When a definition is next due.
    ///
    /// Never run → `now`. HOURLY adds one elapsed hour; DAILY, TWICE_DAILY
    /// and FOUR_TIMES_DAILY step the local wall clock; CUSTOM takes the next
    /// cron occurrence strictly after `last_run_at`.
    pub fn next_due(
        &self,
        recurrence: &Recurrence,
        last_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        let Some(last) = last_run_at else {
            return Ok(now);
        };
        let tz = parse_timezone(recurrence.timezone_name())?;
        match recurrence.frequency {
            Frequency::Hourly => Ok(last + Duration::hours(1)),
            Frequency::Daily => add_wall_clock(last, Duration::hours(24), tz),
            Frequency::TwiceDaily => add_wall_clock(last, Duration::hours(12), tz),
            Frequency::FourTimesDaily => add_wall_clock(last, Duration::hours(6), tz),
            Frequency::Custom => {
                let expr = cron_expression(recurrence)?;
                self.cron.next_after(expr, last, tz)
            }
        }
    }

    /// Nominal gap between runs. For CUSTOM this is the gap between the two
    /// cron occurrences following `from`.
    pub fn expected_period(
        &self,
        recurrence: &Recurrence,
        from: DateTime<Utc>,
    ) -> Result<Duration, ScheduleError> {
        match recurrence.frequency {
            Frequency::Hourly => Ok(Duration::hours(1)),
            Frequency::Daily => Ok(Duration::hours(24)),
            Frequency::TwiceDaily => Ok(Duration::hours(12)),
            Frequency::FourTimesDaily => Ok(Duration::hours(6)),
            Frequency::Custom => {
                let expr = cron_expression(recurrence)?;
                let tz = parse_timezone(recurrence.timezone_name())?;
                let first = self.cron.next_after(expr, from, tz)?;
                let second = self.cron.next_after(expr, first, tz)?;
                Ok(second - first)
            }
        }
    }

    /// A result is stale once it is older than `factor` expected periods.
    pub fn is_stale(
        &self,
        recurrence: &Recurrence,
        produced_at: DateTime<Utc>,
        now: DateTime<Utc>,
        factor: f64,
    ) -> Result<bool, ScheduleError> {
        let period = self.expected_period(recurrence, produced_at)?;
        let age_ms = (now - produced_at).num_milliseconds() as f64;
        Ok(age_ms > period.num_milliseconds() as f64 * factor)
    }
}

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| ScheduleError::UnknownTimezone(name.to_string()))
}

fn cron_expression(recurrence: &Recurrence) -> Result<&str, ScheduleError> {
    recurrence
        .cron_expression
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or(ScheduleError::MissingCron)
}

/// Add `step` to the local wall-clock time of `instant` and map back to UTC.
fn add_wall_clock(
    instant: DateTime<Utc>,
    step: Duration,
    tz: Tz,
) -> Result<DateTime<Utc>, ScheduleError> {
    let local = instant.with_timezone(&tz).naive_local() + step;
    resolve_local(tz, local)
}

/// Ambiguous local times (fall back) take the earlier instant; local times
/// inside a gap (spring forward) move forward until they exist.
pub(crate) fn resolve_local(tz: Tz, local: NaiveDateTime) -> Result<DateTime<Utc>, ScheduleError> {
    let mut candidate = local;
    // No zone has a gap longer than a few hours.
    for _ in 0..4 {
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(dt) => return Ok(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => return Ok(earliest.with_timezone(&Utc)),
            LocalResult::None => candidate += Duration::hours(1),
        }
    }
    Err(ScheduleError::Unresolvable(local.to_string(), tz.name().to_string()))
}
