// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Classic 5-field cron expressions (minute, hour, day-of-month, month,
//! day-of-week) with UTC next-occurrence computation.
//!
//! Vixie semantics for the day fields: when both day-of-month and
//! day-of-week are restricted, a day matches if either does.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

/// Cron parse/validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronError(pub String);

impl std::fmt::Display for CronError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid cron expression: {}", self.0)
    }
}

impl std::error::Error for CronError {}

/// A parsed cron expression. Field vectors are sorted and deduplicated.
#[derive(Debug, Clone)]
pub struct CronExpr {
    minutes: Vec<u8>,
    hours: Vec<u8>,
    doms: Vec<u8>,
    months: Vec<u8>,
    dows: Vec<u8>,
    dom_restricted: bool,
    dow_restricted: bool,
}

/// Parse a 5-field cron expression.
pub fn parse(expr: &str) -> Result<CronExpr, CronError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(CronError(format!("expected 5 fields, got {}", fields.len())));
    }
    Ok(CronExpr {
        minutes: parse_field(fields[0], 0, 59)?,
        hours: parse_field(fields[1], 0, 23)?,
        doms: parse_field(fields[2], 1, 31)?,
        months: parse_field(fields[3], 1, 12)?,
        dows: parse_field(fields[4], 0, 6)?,
        dom_restricted: fields[2] != "*",
        dow_restricted: fields[4] != "*",
    })
}

/// Whether an expression parses. Used at scheduled-task creation time.
pub fn validate(expr: &str) -> bool {
    parse(expr).is_ok()
}

fn parse_field(token: &str, min: u8, max: u8) -> Result<Vec<u8>, CronError> {
    let mut out: Vec<u8> = Vec::new();
    for part in token.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(CronError("empty list item".to_owned()));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u8 =
                    step.parse().map_err(|_| CronError(format!("bad step in `{part}`")))?;
                if step == 0 {
                    return Err(CronError("step must be positive".to_owned()));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            let lo: u8 = lo.parse().map_err(|_| CronError(format!("bad range in `{part}`")))?;
            let hi: u8 = hi.parse().map_err(|_| CronError(format!("bad range in `{part}`")))?;
            if lo > hi {
                return Err(CronError(format!("range start > end in `{part}`")));
            }
            (lo, hi)
        } else {
            let v: u8 = range.parse().map_err(|_| CronError(format!("bad value `{part}`")))?;
            (v, v)
        };

        if start < min || end > max {
            return Err(CronError(format!("`{part}` outside {min}-{max}")));
        }

        let mut v = start;
        while v <= end {
            out.push(v);
            match v.checked_add(step) {
                Some(next) => v = next,
                None => break,
            }
        }
    }
    out.sort_unstable();
    out.dedup();
    Ok(out)
}

impl CronExpr {
    fn day_matches(&self, date: chrono::NaiveDate) -> bool {
        if !self.months.contains(&(date.month() as u8)) {
            return false;
        }
        let dom_ok = self.doms.contains(&(date.day() as u8));
        let dow_ok = self.dows.contains(&(date.weekday().num_days_from_sunday() as u8));
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_ok || dow_ok,
            (true, false) => dom_ok,
            (false, true) => dow_ok,
            (false, false) => true,
        }
    }

    /// Next fire time strictly after `after`, or `None` if nothing matches
    /// within four years (e.g. Feb 30).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = (after + Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;
        let start_date = start.date_naive();
        let mut date = start_date;

        // Four years bounds leap-day-only schedules.
        for _ in 0..1461 {
            if self.day_matches(date) {
                let (min_hour, min_minute) = if date == start_date {
                    (start.hour() as u8, start.minute() as u8)
                } else {
                    (0, 0)
                };
                for &hour in &self.hours {
                    if hour < min_hour {
                        continue;
                    }
                    for &minute in &self.minutes {
                        if hour == min_hour && minute < min_minute {
                            continue;
                        }
                        let naive = date.and_hms_opt(hour as u32, minute as u32, 0)?;
                        return Utc.from_utc_datetime(&naive).into();
                    }
                }
            }
            date = date.succ_opt()?;
        }
        None
    }
}

#[cfg(test)]
#[path = "cron_tests.rs"]
mod tests;
