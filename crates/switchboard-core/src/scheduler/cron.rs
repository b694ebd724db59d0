//! Cron expressions.
//!
//! Five fields (`min hour dom month dow`, fires at second 0) or six fields
//! with a leading seconds column. Each field accepts `*`, `n`, `a-b`, lists
//! `a,b,c` and steps `*/n`, `a-b/n`, `a/n`. Months and weekdays also accept
//! three-letter names (`JAN`, `MON`); weekday `7` is Sunday. When both
//! day-of-month and day-of-week are restricted a day matching either fires.
//!
//! Shorthands: `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`,
//! `@midnight`, `@hourly`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};

use crate::error::CoreError;

const MONTH_NAMES: &[(&str, u32)] = &[
    ("jan", 1),
    ("feb", 2),
    ("mar", 3),
    ("apr", 4),
    ("may", 5),
    ("jun", 6),
    ("jul", 7),
    ("aug", 8),
    ("sep", 9),
    ("oct", 10),
    ("nov", 11),
    ("dec", 12),
];

const DAY_NAMES: &[(&str, u32)] = &[
    ("sun", 0),
    ("mon", 1),
    ("tue", 2),
    ("wed", 3),
    ("thu", 4),
    ("fri", 5),
    ("sat", 6),
];

/// Searches give up after this many years without a match (e.g. `30 2`).
const MAX_SEARCH_YEARS: i32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expr: String,
    seconds: u64,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, CoreError> {
        let trimmed = expr.trim();
        let expanded = match trimmed.to_lowercase().as_str() {
            "@yearly" | "@annually" => "0 0 1 1 *".to_string(),
            "@monthly" => "0 0 1 * *".to_string(),
            "@weekly" => "0 0 * * 0".to_string(),
            "@daily" | "@midnight" => "0 0 * * *".to_string(),
            "@hourly" => "0 * * * *".to_string(),
            other if other.starts_with('@') => {
                return Err(invalid(expr, "unknown shorthand"));
            }
            _ => trimmed.to_string(),
        };

        let mut fields: Vec<&str> = expanded.split_whitespace().collect();
        match fields.len() {
            5 => fields.insert(0, "0"),
            6 => {}
            n => return Err(invalid(expr, &format!("expected 5 or 6 fields, got {}", n))),
        }

        let mut days_of_week = parse_field(expr, fields[5], 0, 7, DAY_NAMES)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week | 1) & !(1 << 7);
        }

        Ok(Self {
            expr: trimmed.to_string(),
            seconds: parse_field(expr, fields[0], 0, 59, &[])?,
            minutes: parse_field(expr, fields[1], 0, 59, &[])?,
            hours: parse_field(expr, fields[2], 0, 23, &[])?,
            days_of_month: parse_field(expr, fields[3], 1, 31, &[])?,
            months: parse_field(expr, fields[4], 1, 12, MONTH_NAMES)?,
            days_of_week,
            dom_restricted: !fields[3].starts_with('*'),
            dow_restricted: !fields[5].starts_with('*'),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.expr
    }

    /// Next firing strictly after `after`, or `None` if the expression never
    /// matches within the search horizon.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let base = after.naive_utc().with_nanosecond(0)?;
        let mut t = base + Duration::seconds(1);
        let last_year = t.year() + MAX_SEARCH_YEARS;

        loop {
            if t.year() > last_year {
                return None;
            }
            if !has(self.months, t.month()) {
                t = start_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !has(self.hours, t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !has(self.minutes, t.minute()) {
                t = t.date().and_hms_opt(t.hour(), t.minute(), 0)? + Duration::minutes(1);
                continue;
            }
            if !has(self.seconds, t.second()) {
                t += Duration::seconds(1);
                continue;
            }
            return Some(Utc.from_utc_datetime(&t));
        }
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = has(self.days_of_month, date.day());
        let dow = has(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

impl FromStr for CronSchedule {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

fn has(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn start_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn invalid(expr: &str, reason: &str) -> CoreError {
    CoreError::Config(format!("Invalid cron expression '{}': {}", expr, reason))
}

fn parse_field(expr: &str, field: &str, min: u32, max: u32, names: &[(&str, u32)]) -> Result<u64, CoreError> {
    let mut mask = 0u64;
    for part in field.split(',') {
        if part.is_empty() {
            return Err(invalid(expr, &format!("empty list item in '{}'", field)));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(expr, &format!("bad step '{}'", step)))?;
                if step == 0 {
                    return Err(invalid(expr, "step must be positive"));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(expr, a, names)?, parse_value(expr, b, names)?)
        } else {
            let v = parse_value(expr, range, names)?;
            // `5/15` means "from 5 every 15".
            (v, if step.is_some() { max } else { v })
        };

        if start < min || end > max || start > end {
            return Err(invalid(
                expr,
                &format!("'{}' out of range {}-{}", part, min, max),
            ));
        }

        let step = step.unwrap_or(1);
        let mut v = start;
        while v <= end {
            mask |= 1u64 << v;
            v += step;
        }
    }
    Ok(mask)
}

fn parse_value(expr: &str, raw: &str, names: &[(&str, u32)]) -> Result<u32, CoreError> {
    if let Ok(v) = raw.parse::<u32>() {
        return Ok(v);
    }
    let lower = raw.to_lowercase();
    names
        .iter()
        .find(|(name, _)| *name == lower)
        .map(|(_, v)| *v)
        .ok_or_else(|| invalid(expr, &format!("bad value '{}'", raw)))
}
