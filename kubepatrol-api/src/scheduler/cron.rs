//! Cron expression parsing
//!
//! Five fields (minute hour day-of-month month day-of-week) plus the usual
//! `@` descriptors and `@every <duration>`.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use kubepatrol_common::{Error, Result};

/// Parsed five-field cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    /// Minutes (0-59)
    pub minutes: Vec<u8>,
    /// Hours (0-23)
    pub hours: Vec<u8>,
    /// Days of month (1-31)
    pub days: Vec<u8>,
    /// Months (1-12)
    pub months: Vec<u8>,
    /// Days of week (0-6, 0=Sunday)
    pub weekdays: Vec<u8>,
    days_restricted: bool,
    weekdays_restricted: bool,
}

impl CronSchedule {
    /// Parse cron expression
    pub fn parse(expr: &str) -> Result<Self> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(Error::Validation(format!(
                "Invalid cron expression '{}': expected 5 fields (minute hour day month weekday)",
                expr
            )));
        }

        let mut weekdays: Vec<u8> = Self::parse_field(parts[4], 0, 7)?
            .into_iter()
            .map(|d| d % 7)
            .collect();
        weekdays.sort_unstable();
        weekdays.dedup();

        Ok(Self {
            minutes: Self::parse_field(parts[0], 0, 59)?,
            hours: Self::parse_field(parts[1], 0, 23)?,
            days: Self::parse_field(parts[2], 1, 31)?,
            months: Self::parse_field(parts[3], 1, 12)?,
            weekdays,
            days_restricted: !Self::is_wildcard(parts[2]),
            weekdays_restricted: !Self::is_wildcard(parts[4]),
        })
    }

    fn is_wildcard(field: &str) -> bool {
        field == "*" || field == "?"
    }

    /// Parse a single cron field
    fn parse_field(field: &str, min: u8, max: u8) -> Result<Vec<u8>> {
        let mut values = Vec::new();

        for part in field.split(',') {
            // Handle step (*/n or x-y/n)
            let (range_part, step) = if let Some((r, s)) = part.split_once('/') {
                let step = s
                    .parse::<u8>()
                    .map_err(|_| Error::Validation(format!("Invalid step value: {}", s)))?;
                if step == 0 {
                    return Err(Error::Validation("Step value must be positive".to_string()));
                }
                (r, step)
            } else {
                (part, 1)
            };

            let range_values: Vec<u8> = if range_part == "*" || range_part == "?" {
                (min..=max).collect()
            } else if let Some((start, end)) = range_part.split_once('-') {
                let start = start
                    .parse::<u8>()
                    .map_err(|_| Error::Validation(format!("Invalid range start: {}", start)))?;
                let end = end
                    .parse::<u8>()
                    .map_err(|_| Error::Validation(format!("Invalid range end: {}", end)))?;
                if start > end || start < min || end > max {
                    return Err(Error::Validation(format!(
                        "Invalid range: {}-{} (must be {}-{})",
                        start, end, min, max
                    )));
                }
                (start..=end).collect()
            } else {
                let val = range_part
                    .parse::<u8>()
                    .map_err(|_| Error::Validation(format!("Invalid value: {}", range_part)))?;
                if val < min || val > max {
                    return Err(Error::Validation(format!(
                        "Value {} out of range {}-{}",
                        val, min, max
                    )));
                }
                // `5/15` means from 5 to the end of the range in steps
                if step > 1 {
                    (val..=max).collect()
                } else {
                    vec![val]
                }
            };

            for v in range_values.into_iter().step_by(step as usize) {
                if !values.contains(&v) {
                    values.push(v);
                }
            }
        }

        values.sort_unstable();
        Ok(values)
    }

    /// Check if the schedule matches the given time.
    ///
    /// When both day fields are restricted a match on either is enough.
    pub fn matches(&self, dt: &DateTime<Utc>) -> bool {
        let minute = dt.minute() as u8;
        let hour = dt.hour() as u8;
        let day = dt.day() as u8;
        let month = dt.month() as u8;
        let weekday = dt.weekday().num_days_from_sunday() as u8;

        let day_match = if self.days_restricted && self.weekdays_restricted {
            self.days.contains(&day) || self.weekdays.contains(&weekday)
        } else {
            self.days.contains(&day) && self.weekdays.contains(&weekday)
        };

        self.minutes.contains(&minute) && self.hours.contains(&hour) && self.months.contains(&month) && day_match
    }

    /// Calculate the next run time after the given time
    pub fn next_run_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut current = *after + Duration::minutes(1);
        current = current.with_second(0)?.with_nanosecond(0)?;

        // Search for up to 5 years so Feb 29 schedules resolve
        let max_iterations = 366 * 24 * 60 * 5;

        for _ in 0..max_iterations {
            if !self.months.contains(&(current.month() as u8)) {
                current = Self::start_of_next_month(&current)?;
                continue;
            }
            if self.matches(&current) {
                return Some(current);
            }
            current += Duration::minutes(1);
        }

        None
    }

    fn start_of_next_month(dt: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let (year, month) = if dt.month() == 12 {
            (dt.year() + 1, 1)
        } else {
            (dt.year(), dt.month() + 1)
        };
        dt.with_day(1)?
            .with_hour(0)?
            .with_minute(0)?
            .with_year(year)?
            .with_month(month)
    }
}

/// When a job fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSchedule {
    Cron(CronSchedule),
    Every(Duration),
}

impl JobSchedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        let standard = match expr {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            _ => {
                if let Some(interval) = expr.strip_prefix("@every") {
                    return Ok(JobSchedule::Every(parse_interval(interval.trim())?));
                }
                if expr.starts_with('@') {
                    return Err(Error::Validation(format!("Unknown cron descriptor: {}", expr)));
                }
                expr
            }
        };
        Ok(JobSchedule::Cron(CronSchedule::parse(standard)?))
    }

    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            JobSchedule::Cron(cron) => cron.next_run_after(after),
            JobSchedule::Every(interval) => after.checked_add_signed(*interval),
        }
    }
}

/// Parse intervals such as `90s`, `5m` or `1h30m`
fn parse_interval(s: &str) -> Result<Duration> {
    if s.is_empty() {
        return Err(Error::Validation("@every requires a duration".to_string()));
    }

    let mut total = Duration::zero();
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n: i64 = digits
            .parse()
            .map_err(|_| Error::Validation(format!("Invalid duration: {}", s)))?;
        digits.clear();
        let part = match c {
            's' => Duration::try_seconds(n),
            'm' => Duration::try_minutes(n),
            'h' => Duration::try_hours(n),
            _ => return Err(Error::Validation(format!("Invalid duration unit '{}' in {}", c, s))),
        };
        total = part
            .and_then(|part| total.checked_add(&part))
            .ok_or_else(|| Error::Validation(format!("Duration {} is out of range", s)))?;
    }
    if !digits.is_empty() {
        return Err(Error::Validation(format!("Duration {} is missing a unit", s)));
    }
    if total < Duration::seconds(1) {
        return Err(Error::Validation(format!("Duration {} must be at least 1s", s)));
    }
    Ok(total)
}
