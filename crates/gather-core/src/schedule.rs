//! Cron-like schedule descriptors.
//!
//! Supported forms, evaluated in UTC:
//! - five fields `minute hour day-of-month month day-of-week` with `*`,
//!   values, ranges, lists and steps (`*/15`, `1-5`, `0,30`, `10-50/10`);
//!   month and weekday fields accept three-letter names
//! - `@hourly`, `@daily`, `@weekly`, `@monthly`, `@yearly`
//! - `every <n><s|m|h|d>`, e.g. `every 30m`

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, Timelike, Utc};

use crate::error::AppError;

/// Upper bound on day-level skips while searching for the next run.
const MAX_SEARCH_DAYS: u32 = 366 * 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Cron(CronSpec),
    Every(TimeDelta),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
    source: String,
    minutes: Vec<bool>,
    hours: Vec<bool>,
    days_of_month: Vec<bool>,
    months: Vec<bool>,
    /// 0 = Sunday.
    days_of_week: Vec<bool>,
    dom_restricted: bool,
    dow_restricted: bool,
}

const MONTH_NAMES: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: &[&str] = &["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

fn parse_value(token: &str, names: &[&str], name_offset: u32) -> Result<u32, AppError> {
    let lower = token.to_lowercase();
    if let Some(pos) = names.iter().position(|n| *n == lower) {
        return Ok(pos as u32 + name_offset);
    }
    token
        .parse()
        .map_err(|_| AppError::InvalidRequest(format!("invalid schedule value '{token}'")))
}

/// Parse one cron field into a membership table over `min..=max`.
fn parse_field(
    field: &str,
    min: u32,
    max: u32,
    names: &[&str],
    name_offset: u32,
) -> Result<(Vec<bool>, bool), AppError> {
    let mut table = vec![false; (max + 1) as usize];
    let restricted = field != "*";

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| AppError::InvalidRequest(format!("invalid step in '{part}'")))?;
                if step == 0 {
                    return Err(AppError::InvalidRequest(format!("zero step in '{part}'")));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (
                parse_value(a, names, name_offset)?,
                parse_value(b, names, name_offset)?,
            )
        } else {
            let v = parse_value(range, names, name_offset)?;
            // "5/10" means from 5 to the end in steps of 10.
            if step > 1 { (v, max) } else { (v, v) }
        };

        if start < min || end > max || start > end {
            return Err(AppError::InvalidRequest(format!(
                "'{part}' is outside {min}-{max}"
            )));
        }
        for v in (start..=end).step_by(step as usize) {
            table[v as usize] = true;
        }
    }

    Ok((table, restricted))
}

impl CronSpec {
    fn parse(expr: &str) -> Result<Self, AppError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(AppError::InvalidRequest(format!(
                "schedule '{expr}' must have five fields"
            )));
        };

        let (minutes, _) = parse_field(minute, 0, 59, &[], 0)?;
        let (hours, _) = parse_field(hour, 0, 23, &[], 0)?;
        let (days_of_month, dom_restricted) = parse_field(dom, 1, 31, &[], 0)?;
        let (months, _) = parse_field(month, 1, 12, MONTH_NAMES, 1)?;
        let (mut days_of_week, dow_restricted) = parse_field(dow, 0, 7, DAY_NAMES, 0)?;
        if days_of_week[7] {
            days_of_week[0] = true;
        }
        days_of_week.truncate(7);

        Ok(Self {
            source: expr.to_string(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted,
            dow_restricted,
        })
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month[date.day() as usize];
        let dow = self.days_of_week[date.weekday().num_days_from_sunday() as usize];
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after.with_second(0)?.with_nanosecond(0)? + TimeDelta::minutes(1);
        let mut day_skips = 0;

        loop {
            if !self.months[t.month() as usize] || !self.day_matches(t.date_naive()) {
                day_skips += 1;
                if day_skips > MAX_SEARCH_DAYS {
                    return None;
                }
                let next_day = t.date_naive().succ_opt()?;
                t = next_day.and_hms_opt(0, 0, 0)?.and_utc();
                continue;
            }
            if !self.hours[t.hour() as usize] {
                t = t.with_minute(0)? + TimeDelta::hours(1);
                continue;
            }
            if !self.minutes[t.minute() as usize] {
                t += TimeDelta::minutes(1);
                continue;
            }
            return Some(t);
        }
    }
}

impl Schedule {
    /// First run strictly after `after`, or `None` if the expression can
    /// never fire (e.g. February 31st).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron(spec) => spec.next_after(after),
            Schedule::Every(interval) => Some(after + *interval),
        }
    }
}

fn parse_every(spec: &str) -> Result<TimeDelta, AppError> {
    let spec = spec.trim();
    let invalid = || AppError::InvalidRequest(format!("invalid interval 'every {spec}'"));
    let unit = spec.chars().last().ok_or_else(invalid)?;
    let n: i64 = spec[..spec.len() - unit.len_utf8()]
        .trim()
        .parse()
        .map_err(|_| invalid())?;
    if n <= 0 {
        return Err(invalid());
    }
    match unit {
        's' => Ok(TimeDelta::seconds(n)),
        'm' => Ok(TimeDelta::minutes(n)),
        'h' => Ok(TimeDelta::hours(n)),
        'd' => Ok(TimeDelta::days(n)),
        _ => Err(invalid()),
    }
}

impl FromStr for Schedule {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let expr = match s {
            "@hourly" => "0 * * * *",
            "@daily" | "@midnight" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            "@yearly" | "@annually" => "0 0 1 1 *",
            other => {
                if let Some(rest) = other.strip_prefix("every ") {
                    return parse_every(rest).map(Schedule::Every);
                }
                other
            }
        };
        CronSpec::parse(expr).map(Schedule::Cron)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Cron(spec) => f.write_str(&spec.source),
            Schedule::Every(interval) => write!(f, "every {}s", interval.num_seconds()),
        }
    }
}
