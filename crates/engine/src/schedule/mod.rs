//! Recurrence arithmetic: when is a definition next due.
//!
//! Fixed frequencies are computed in the definition's timezone so DAILY
//! runs keep their wall-clock time across DST transitions. CUSTOM
//! recurrences go through a [`CronEvaluator`], swappable behind a trait.

mod calculator;
pub(crate) mod cron;


use thiserror::Error;

use crate::types::Frequency;

pub use self::calculator::{parse_timezone, ScheduleCalculator};
pub use self::cron::{normalize_cron, CronCrateEvaluator, CronEvaluator};

/// Errors from recurrence validation and evaluation. All are configuration
/// errors: retrying does not help.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),

    #[error("CUSTOM frequency requires a cron_expression")]
    MissingCron,

    #[error("CUSTOM frequency requires a timezone")]
    MissingTimezone,

    #[error("frequency {0} does not accept a cron_expression")]
    UnexpectedCron(Frequency),

    #[error("cron expression '{0}' has no upcoming occurrence")]
    NoUpcoming(String),

    #[error("local time {0} cannot be resolved in timezone {1}")]
    Unresolvable(String, String),
}
