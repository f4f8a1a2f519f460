//! Timezone-aware cron evaluation (5-field: minute hour dom month dow).
//!
//! Schedules are evaluated in an IANA zone resolved from an inline
//! `CRON_TZ=`/`TZ=` prefix, the caller-supplied zone, or UTC, in that order.
//!
//! DST handling: local times inside a spring-forward gap are skipped; a
//! fall-back overlap resolves to the earliest (pre-transition) instant.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;

/// Errors produced while parsing or evaluating a schedule.
#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid cron spec {spec:?}: {reason}")]
    InvalidSpec { spec: String, reason: String },

    #[error("unknown time zone {0:?}")]
    UnknownTimeZone(String),

    #[error("no upcoming occurrence within the search horizon")]
    NoUpcomingOccurrence,
}

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DOW_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// How far ahead of `after` to search before giving up. Bounds schedules that
/// can never fire (e.g. `0 0 31 2 *`).
const SEARCH_HORIZON_DAYS: i64 = 366 * 5;

/// A parsed 5-field schedule bound to a time zone.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    // Classic cron rule: when both day fields are restricted, a day matches
    // if either field matches; a field written with `*` counts as unrestricted
    // even when it carries a step.
    dom_star: bool,
    dow_star: bool,
    tz: Tz,
}

/// Resolve the next occurrence of `spec` strictly after `after`.
///
/// `tz` names the zone the schedule is evaluated in; an inline `CRON_TZ=` or
/// `TZ=` prefix in the spec takes precedence, and an empty zone means UTC.
pub fn next_after(spec: &str, tz: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
    CronSchedule::parse(spec, tz)?
        .next_after(after)
        .ok_or(CronError::NoUpcomingOccurrence)
}

impl CronSchedule {
    /// Parse a 5-field spec, resolving the evaluation zone as for
    /// [`next_after`].
    pub fn parse(spec: &str, tz: &str) -> Result<Self, CronError> {
        let trimmed = spec.trim();
        let (zone_name, fields_str) = split_inline_zone(trimmed);
        let zone_name = match zone_name {
            Some(inline) => inline,
            None if tz.is_empty() => "UTC",
            None => tz,
        };
        let zone: Tz = zone_name
            .parse()
            .map_err(|_| CronError::UnknownTimeZone(zone_name.to_string()))?;

        let fields: Vec<&str> = fields_str.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::InvalidSpec {
                spec: spec.to_string(),
                reason: format!("expected 5 fields, got {}", fields.len()),
            });
        }

        let invalid = |reason: String| CronError::InvalidSpec {
            spec: spec.to_string(),
            reason,
        };

        Ok(Self {
            minutes: parse_field(fields[0], 0, 59, None).map_err(&invalid)?,
            hours: parse_field(fields[1], 0, 23, None).map_err(&invalid)? as u32,
            days_of_month: parse_field(fields[2], 1, 31, None).map_err(&invalid)? as u32,
            months: parse_field(fields[3], 1, 12, Some(&MONTH_NAMES)).map_err(&invalid)? as u16,
            days_of_week: parse_field(fields[4], 0, 6, Some(&DOW_NAMES)).map_err(&invalid)? as u8,
            dom_star: fields[2].starts_with('*'),
            dow_star: fields[4].starts_with('*'),
            tz: zone,
        })
    }

    /// Next matching instant strictly after `after`, or `None` when no match
    /// exists within the search horizon.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.tz).naive_local();
        let mut candidate = local.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let horizon = local + Duration::days(SEARCH_HORIZON_DAYS);

        while candidate <= horizon {
            if self.months & (1 << candidate.month()) == 0 {
                candidate = first_minute_of_next_month(candidate.date())?;
                continue;
            }
            if !self.day_matches(&candidate) {
                candidate = candidate.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if self.hours & (1 << candidate.hour()) == 0 {
                candidate = candidate.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if self.minutes & (1 << candidate.minute()) == 0 {
                candidate += Duration::minutes(1);
                continue;
            }

            match self.tz.from_local_datetime(&candidate) {
                chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                chrono::LocalResult::Ambiguous(earliest, _) => {
                    return Some(earliest.with_timezone(&Utc));
                }
                // Spring-forward gap: this local minute does not exist.
                chrono::LocalResult::None => candidate += Duration::minutes(1),
            }
        }

        None
    }

    fn day_matches(&self, dt: &NaiveDateTime) -> bool {
        let dom = self.days_of_month & (1 << dt.day()) != 0;
        let dow = self.days_of_week & (1 << dt.weekday().num_days_from_sunday()) != 0;

        if self.dom_star || self.dow_star {
            dom && dow
        } else {
            dom || dow
        }
    }
}

/// Split an inline `CRON_TZ=<zone>`/`TZ=<zone>` prefix off the spec.
fn split_inline_zone(spec: &str) -> (Option<&str>, &str) {
    for prefix in ["CRON_TZ=", "TZ="] {
        if let Some(rest) = spec.strip_prefix(prefix) {
            let (zone, fields) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));

            return (Some(zone), fields);
        }
    }

    (None, spec)
}

/// Parse one cron field into a bitmask over `min..=max`.
fn parse_field(
    field: &str,
    min: u32,
    max: u32,
    names: Option<&[&str]>,
) -> Result<u64, String> {
    let mut mask = 0u64;

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step {step:?} in {field:?}"))?;
                if step == 0 {
                    return Err(format!("zero step in {field:?}"));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (
                parse_value(lo, min, max, names)?,
                parse_value(hi, min, max, names)?,
            )
        } else {
            let value = parse_value(range, min, max, names)?;
            // A bare value with a step means "from value to max".
            if part.contains('/') {
                (value, max)
            } else {
                (value, value)
            }
        };

        if start > end {
            return Err(format!("descending range {range:?} in {field:?}"));
        }

        let mut value = start;
        while value <= end {
            mask |= 1 << value;
            value += step;
        }
    }

    if mask == 0 {
        return Err(format!("empty field {field:?}"));
    }

    Ok(mask)
}

fn parse_value(raw: &str, min: u32, max: u32, names: Option<&[&str]>) -> Result<u32, String> {
    if let Some(names) = names {
        let lowered = raw.to_ascii_lowercase();
        if let Some(index) = names.iter().position(|n| *n == lowered) {
            return Ok(min + index as u32);
        }
    }

    let mut value: u32 = raw
        .parse()
        .map_err(|_| format!("invalid value {raw:?}"))?;
    // Both 0 and 7 name Sunday in the day-of-week field.
    if max == 6 && value == 7 {
        value = 0;
    }
    if value < min || value > max {
        return Err(format!("value {value} out of range {min}..={max}"));
    }

    Ok(value)
}

fn first_minute_of_next_month(date: NaiveDate) -> Option<NaiveDateTime> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };

    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}
