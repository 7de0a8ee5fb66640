use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;

use super::ScheduleDefinition;
use crate::error::{CoreError, CoreResult};

/// A validated cron expression.
///
/// Accepts the classic 5-field form (minute precision, seconds implied `0`,
/// days of week `0`-`7` with Sunday as `0` or `7`) as well as the 6-field
/// (with seconds) and 7-field (with year) forms. The 6 and 7 field forms use
/// the `cron` crate's own numbering, where Sunday is `1`.
#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    schedule: CronSchedule,
}

impl CronExpr {
    pub fn parse(expr: &str) -> CoreResult<Self> {
        let fields = expr.split_whitespace().count();
        let normalized = match fields {
            5 => {
                let parts: Vec<&str> = expr.split_whitespace().collect();
                let dow = classic_day_of_week(parts[4]).map_err(|reason| {
                    CoreError::Validation(format!("Invalid cron expression '{}': {}", expr, reason))
                })?;
                format!("0 {} {}", parts[..4].join(" "), dow)
            }
            6 | 7 => expr.trim().to_string(),
            n => {
                return Err(CoreError::Validation(format!(
                    "Invalid cron expression '{}': expected 5, 6 or 7 fields, found {}",
                    expr, n
                )))
            }
        };

        let schedule = CronSchedule::from_str(&normalized).map_err(|e| {
            CoreError::Validation(format!("Invalid cron expression '{}': {}", expr, e))
        })?;

        Ok(Self {
            source: expr.trim().to_string(),
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First matching instant strictly after `after`.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(after).next()
    }

    /// All matching instants in `(from, until]`.
    pub fn upcoming_until(&self, from: &DateTime<Utc>, until: &DateTime<Utc>) -> Vec<DateTime<Utc>> {
        self.schedule.after(from).take_while(|t| t <= until).collect()
    }
}

/// Rewrite a classic day-of-week field (0-7, Sunday = 0 or 7) into the
/// `cron` crate's 1-7 numbering (Sunday = 1). Numeric items are expanded into
/// an explicit list, so ranges and steps keep their classic meaning. Named
/// days (`MON`, `SUN-SAT`) pass through unchanged.
fn classic_day_of_week(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut named = Vec::new();
    let mut days = BTreeSet::new();
    for item in field.split(',') {
        if item.chars().any(|c| c.is_ascii_alphabetic()) {
            named.push(item.to_string());
            continue;
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step '{}'", item))?;
                (range, Some(step))
            }
            None => (item, None),
        };
        if step == Some(0) {
            return Err(format!("day-of-week step must be positive in '{}'", item));
        }

        let (lo, hi) = if range == "*" {
            (0, 6)
        } else if let Some((a, b)) = range.split_once('-') {
            (day_number(a)?, day_number(b)?)
        } else {
            let n = day_number(range)?;
            // `5/2` means "from 5, every 2" in classic cron
            (n, if step.is_some() { 7 } else { n })
        };
        if lo > hi {
            return Err(format!("day-of-week range '{}' runs backwards", item));
        }

        for d in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
            days.insert(d % 7);
        }
    }

    named.extend(days.iter().map(|d| (d + 1).to_string()));
    Ok(named.join(","))
}

fn day_number(raw: &str) -> Result<u32, String> {
    match raw.parse::<u32>() {
        Ok(n) if n <= 7 => Ok(n),
        _ => Err(format!("day of week '{}' is not in 0-7", raw)),
    }
}

/// One predicted firing, as shown by the dry-run preview.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PlannedRun {
    pub at: DateTime<Utc>,
    pub schedule_name: String,
    pub target_suite: String,
}

/// Calculate the firings of the given schedules over the next `hours`.
/// This is strictly a dry-run preview. Inactive or unparsable schedules are ignored.
pub fn preview_runs(schedules: &[ScheduleDefinition], now: DateTime<Utc>, hours: u64) -> Vec<PlannedRun> {
    let end = now + Duration::hours(hours as i64);
    let mut preview = Vec::new();

    for s in schedules.iter().filter(|s| s.is_active) {
        if let Ok(expr) = CronExpr::parse(&s.cron_expression) {
            for at in expr.upcoming_until(&now, &end) {
                preview.push(PlannedRun {
                    at,
                    schedule_name: s.schedule_name.clone(),
                    target_suite: s.target_suite.clone(),
                });
            }
        }
    }

    // Sort by time
    preview.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.schedule_name.cmp(&b.schedule_name)));
    preview
}
