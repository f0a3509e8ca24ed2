// Cron schedule parsing and fire-time enumeration
//
// Five-field expressions (minute, hour, day-of-month, month, day-of-week)
// plus the `@` aliases, evaluated in an IANA time zone. Fire instants are
// generated per local calendar day over a bounded window, so no call ever
// walks an unbounded sequence.

use crate::errors::ScheduleError;
use chrono::{DateTime, Datelike, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use std::fmt;

/// Days scanned forward by `next_after` before giving up. A valid schedule
/// fires at least once every eight years (Feb 29 across a skipped leap year).
const MAX_FORWARD_SCAN_DAYS: i64 = 366 * 9;

const MONTH_NAMES: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: &[&str] = &["sun", "mon", "tue", "wed", "thu", "fri", "sat"];
const MAX_DAYS_IN_MONTH: [u32; 12] = [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

/// Bounds and accepted names of one cron field
#[derive(Debug, Clone, Copy)]
struct FieldBounds {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    allows_question: bool,
}

const MINUTE: FieldBounds = FieldBounds {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
    allows_question: false,
};
const HOUR: FieldBounds = FieldBounds {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
    allows_question: false,
};
const DAY_OF_MONTH: FieldBounds = FieldBounds {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    allows_question: true,
};
const MONTH: FieldBounds = FieldBounds {
    name: "month",
    min: 1,
    max: 12,
    names: MONTH_NAMES,
    allows_question: false,
};
// 7 is accepted as a second spelling of Sunday
const DAY_OF_WEEK: FieldBounds = FieldBounds {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: DAY_NAMES,
    allows_question: true,
};

/// A parsed field: one bit per allowed value, plus whether it was a wildcard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    bits: u64,
    wildcard: bool,
}

impl Field {
    fn contains(&self, value: u32) -> bool {
        self.bits & (1u64 << value) != 0
    }
}

/// A parsed five-field cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
}

impl CronSchedule {
    /// Parse a cron expression or alias
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let invalid = |reason: String| ScheduleError::InvalidSchedule {
            expression: expression.to_string(),
            reason,
        };

        let trimmed = expression.trim();
        if trimmed.starts_with("TZ=") || trimmed.starts_with("CRON_TZ=") {
            return Err(invalid(
                "time zone prefixes are not supported, use time_zone instead".to_string(),
            ));
        }

        let expanded = if trimmed.starts_with('@') {
            expand_alias(trimmed).ok_or_else(|| invalid(format!("unknown alias {}", trimmed)))?
        } else {
            trimmed
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
        }

        let minutes = parse_field(fields[0], MINUTE).map_err(invalid)?;
        let hours = parse_field(fields[1], HOUR).map_err(invalid)?;
        let days_of_month = parse_field(fields[2], DAY_OF_MONTH).map_err(invalid)?;
        let months = parse_field(fields[3], MONTH).map_err(invalid)?;
        let mut days_of_week = parse_field(fields[4], DAY_OF_WEEK).map_err(invalid)?;

        if days_of_week.contains(7) {
            days_of_week.bits = (days_of_week.bits | 1) & !(1u64 << 7);
        }

        let schedule = Self {
            source: expression.to_string(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
        };

        if !schedule.can_fire() {
            return Err(invalid("schedule never fires".to_string()));
        }

        Ok(schedule)
    }

    /// The expression as it was written
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Both day fields restricted: a day matches if either matches.
    /// Otherwise both must match (a wildcard matches every day).
    pub fn matches_date(&self, date: NaiveDate) -> bool {
        if !self.months.contains(date.month()) {
            return false;
        }
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        if !self.days_of_month.wildcard && !self.days_of_week.wildcard {
            dom || dow
        } else {
            dom && dow
        }
    }

    fn can_fire(&self) -> bool {
        if !self.days_of_week.wildcard {
            // Every weekday occurs in every month
            return true;
        }
        (1..=12).any(|month| {
            self.months.contains(month)
                && (1..=MAX_DAYS_IN_MONTH[(month - 1) as usize])
                    .any(|day| self.days_of_month.contains(day))
        })
    }

    fn times_of_day(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        (0..24u32)
            .filter(move |h| self.hours.contains(*h))
            .flat_map(move |h| {
                (0..60u32)
                    .filter(move |m| self.minutes.contains(*m))
                    .map(move |m| (h, m))
            })
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn expand_alias(alias: &str) -> Option<&'static str> {
    match alias.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Some("0 0 1 1 *"),
        "@monthly" => Some("0 0 1 * *"),
        "@weekly" => Some("0 0 * * 0"),
        "@daily" | "@midnight" => Some("0 0 * * *"),
        "@hourly" => Some("0 * * * *"),
        _ => None,
    }
}

fn parse_field(field: &str, bounds: FieldBounds) -> Result<Field, String> {
    let mut bits = 0u64;
    let mut wildcard = false;

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{}' in {} field", step, bounds.name))?;
                if step == 0 {
                    return Err(format!("step must be positive in {} field", bounds.name));
                }
                if step > bounds.max {
                    return Err(format!(
                        "step {} exceeds {} field maximum {}",
                        step, bounds.name, bounds.max
                    ));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let is_star = range == "*" || (bounds.allows_question && range == "?");
        let (start, end) = if is_star {
            (bounds.min, bounds.max)
        } else if let Some((low, high)) = range.split_once('-') {
            (parse_value(low, bounds)?, parse_value(high, bounds)?)
        } else {
            let value = parse_value(range, bounds)?;
            // "N/step" runs from N to the end of the field
            if step.is_some() {
                (value, bounds.max)
            } else {
                (value, value)
            }
        };

        if start > end {
            return Err(format!(
                "range {}-{} is reversed in {} field",
                start, end, bounds.name
            ));
        }

        let step = step.unwrap_or(1);
        if is_star && step == 1 {
            wildcard = true;
        }
        let mut value = start;
        while value <= end {
            bits |= 1u64 << value;
            value += step;
        }
    }

    Ok(Field { bits, wildcard })
}

fn parse_value(token: &str, bounds: FieldBounds) -> Result<u32, String> {
    if token.is_empty() {
        return Err(format!("empty value in {} field", bounds.name));
    }
    let lowered = token.to_ascii_lowercase();
    let value = match bounds.names.iter().position(|name| *name == lowered) {
        Some(index) => index as u32 + if bounds.min == 1 { 1 } else { 0 },
        None => token
            .parse::<u32>()
            .map_err(|_| format!("invalid value '{}' in {} field", token, bounds.name))?,
    };
    if value < bounds.min || value > bounds.max {
        return Err(format!(
            "value {} out of range {}-{} in {} field",
            value, bounds.min, bounds.max, bounds.name
        ));
    }
    Ok(value)
}

/// Get the default time zone for schedules
pub fn default_timezone() -> Tz {
    chrono_tz::UTC
}

/// Parse an IANA time zone identifier
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    name.parse::<Tz>()
        .map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))
}

/// A cron schedule bound to the time zone it is evaluated in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    cron: CronSchedule,
    tz: Tz,
}

impl Schedule {
    /// Parse the expression and resolve the time zone (UTC when absent)
    pub fn new(expression: &str, time_zone: Option<&str>) -> Result<Self, ScheduleError> {
        let cron = CronSchedule::parse(expression)?;
        let tz = match time_zone {
            Some(name) => parse_timezone(name)?,
            None => default_timezone(),
        };
        Ok(Self { cron, tz })
    }

    pub fn cron(&self) -> &CronSchedule {
        &self.cron
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Fire instants of one local calendar day, ascending.
    ///
    /// Local times inside a spring-forward gap do not exist and are skipped.
    /// Local times repeated by a fall-back transition resolve to their first
    /// occurrence only.
    fn instants_on(&self, date: NaiveDate) -> Vec<DateTime<Utc>> {
        if !self.cron.matches_date(date) {
            return Vec::new();
        }
        let mut instants: Vec<DateTime<Utc>> = self
            .cron
            .times_of_day()
            .filter_map(|(hour, minute)| {
                let local = date.and_hms_opt(hour, minute, 0)?;
                match self.tz.from_local_datetime(&local) {
                    LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
                    LocalResult::Ambiguous(first, second) => {
                        Some(first.min(second).with_timezone(&Utc))
                    }
                    LocalResult::None => None,
                }
            })
            .collect();
        instants.sort();
        instants
    }

    /// Local date range covering `(after, until]`, padded by a day on each
    /// side for zones whose transitions cross midnight
    fn local_date_range(&self, after: DateTime<Utc>, until: DateTime<Utc>) -> (NaiveDate, NaiveDate) {
        let first = after.with_timezone(&self.tz).date_naive();
        let last = until.with_timezone(&self.tz).date_naive();
        (
            first.pred_opt().unwrap_or(first),
            last.succ_opt().unwrap_or(last),
        )
    }

    /// Fire instants in `(after, until]`, ascending. When more than `cap`
    /// instants fall inside the window only the latest `cap` are returned.
    pub fn instants_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
        cap: usize,
    ) -> Vec<DateTime<Utc>> {
        let mut found = Vec::new();
        if until <= after || cap == 0 {
            return found;
        }

        let (first, last) = self.local_date_range(after, until);
        let mut date = last;
        'days: loop {
            for instant in self.instants_on(date).into_iter().rev() {
                if instant > until {
                    continue;
                }
                if instant <= after {
                    break 'days;
                }
                found.push(instant);
                if found.len() == cap {
                    break 'days;
                }
            }
            if date <= first {
                break;
            }
            date = match date.pred_opt() {
                Some(previous) => previous,
                None => break,
            };
        }

        found.reverse();
        found
    }

    /// Latest fire instant in `(after, until]`
    pub fn latest_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.instants_between(after, until, 1).pop()
    }

    /// First fire instant strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_timezone(&self.tz).date_naive();
        let mut date = start.pred_opt().unwrap_or(start);
        for _ in 0..MAX_FORWARD_SCAN_DAYS {
            if let Some(instant) = self
                .instants_on(date)
                .into_iter()
                .find(|instant| *instant > after)
            {
                return Some(instant);
            }
            date = date.succ_opt()?;
        }
        None
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.cron, self.tz)
    }
}
