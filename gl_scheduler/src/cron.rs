//! ABOUTME: Cron expression parsing and next-fire-time computation
//! ABOUTME: Thin wrapper over the `cron` crate with 5-field and @keyword support

use crate::error::{Result, SchedulerError};
use chrono::{DateTime, Utc};
use std::str::FromStr;

/// A parsed, validated cron schedule.
///
/// Accepts standard 5-field expressions (`minute hour day-of-month month
/// day-of-week`) and the `@yearly`/`@monthly`/`@weekly`/`@daily`/`@hourly`
/// aliases. Internally these are expanded to the 6-field (seconds-first)
/// syntax the underlying `cron` crate expects, so callers never need to
/// think about seconds. Evaluation is always in local wall-clock time via
/// `chrono::Utc` — there is no timezone override, per spec.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    source: String,
    inner: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let normalized = expand_alias(expr.trim());
        let six_field = to_six_field(&normalized);
        let inner = cron::Schedule::from_str(&six_field).map_err(|e| {
            SchedulerError::InvalidCronExpression {
                expr: expr.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            source: expr.to_string(),
            inner,
        })
    }

    /// The first instant strictly after `from` at which this schedule
    /// fires. Always `> from`; repeated calls are pure and deterministic.
    pub fn next(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.inner.after(&from).next()
    }

    /// The firings strictly inside `(start, end]`, in ascending order.
    pub fn firings_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        self.inner
            .after(&start)
            .take_while(|t| *t <= end)
            .collect()
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

fn expand_alias(expr: &str) -> String {
    match expr {
        "@yearly" | "@annually" => "0 0 1 1 *".to_string(),
        "@monthly" => "0 0 1 * *".to_string(),
        "@weekly" => "0 0 * * 0".to_string(),
        "@daily" | "@midnight" => "0 0 * * *".to_string(),
        "@hourly" => "0 * * * *".to_string(),
        other => other.to_string(),
    }
}

/// Prepend a `0` seconds field to a 5-field expression so the `cron` crate
/// (which requires seconds) accepts it. Expressions that already carry 6
/// or 7 fields are passed through unchanged.
fn to_six_field(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Validate a cron expression without keeping the parsed schedule around.
pub fn validate(expr: &str) -> Result<()> {
    CronSchedule::parse(expr).map(|_| ())
}
