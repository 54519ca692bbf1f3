//! ISO-8601 repeating intervals for cron triggers.
//!
//! A repeating interval has the shape `R[n]/[start/]duration`, e.g.
//! `R/PT1H` (hourly, forever), `R3/P1D` (daily, three times), or
//! `R/2024-01-01T00:00:00Z/P1M` (monthly from new year's day).
//! Occurrences fall on the grid `start, start+d, start+2d, ...`; with no
//! start, the interval simply measures a delay from "now".

use crate::error::IntervalError;
use chrono::{DateTime, Duration, Months, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Upper bound on calendar-stepping iterations in `next_after`, reached
/// only with a pathological start far in the past.
const MAX_CALENDAR_STEPS: u32 = 10_000;

/// A parsed ISO-8601 repeating interval.
///
/// The original expression is retained verbatim so the value round-trips
/// through serialization unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct RepeatingInterval {
    raw: String,
    repetitions: Option<u32>,
    start: Option<DateTime<Utc>>,
    months: u32,
    span: Duration,
}

impl RepeatingInterval {
    /// Parses a repeating-interval expression.
    ///
    /// # Errors
    ///
    /// Returns an error if the expression is not a valid repeating
    /// interval or describes a zero-length period.
    pub fn parse(expression: &str) -> Result<Self, IntervalError> {
        let invalid = |reason: &str| IntervalError::Invalid {
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = expression.split('/').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(invalid("expected R[n]/[start/]duration"));
        }

        let repeat = parts[0]
            .strip_prefix('R')
            .ok_or_else(|| invalid("must begin with R"))?;
        let repetitions = if repeat.is_empty() {
            None
        } else {
            Some(
                repeat
                    .parse::<u32>()
                    .map_err(|_| invalid("repetition count is not a number"))?,
            )
        };

        let (start, duration_part) = if parts.len() == 3 {
            let start = DateTime::parse_from_rfc3339(parts[1])
                .map_err(|_| invalid("start is not an RFC-3339 timestamp"))?
                .with_timezone(&Utc);
            (Some(start), parts[2])
        } else {
            (None, parts[1])
        };

        let (months, span) = parse_duration(duration_part).map_err(|reason| invalid(&reason))?;
        if months == 0 && span.is_zero() {
            return Err(invalid("interval has zero length"));
        }

        Ok(Self {
            raw: expression.to_string(),
            repetitions,
            start,
            months,
            span,
        })
    }

    /// Returns the original expression.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns the declared repetition count, if bounded.
    #[must_use]
    pub fn repetitions(&self) -> Option<u32> {
        self.repetitions
    }

    /// Returns the first occurrence strictly after the given instant.
    ///
    /// Returns `None` only when the date arithmetic overflows.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.start {
            None => self.add_to(after),
            Some(start) if start > after => Some(start),
            Some(start) if self.months == 0 => {
                // Pure time spans align to the grid arithmetically.
                let span_ns = self.span.num_nanoseconds()?;
                let elapsed_ns = (after - start).num_nanoseconds()?;
                let steps = elapsed_ns / span_ns + 1;
                start.checked_add_signed(Duration::nanoseconds(steps.checked_mul(span_ns)?))
            }
            Some(start) => {
                // Calendar spans step month by month.
                let mut t = start;
                for _ in 0..MAX_CALENDAR_STEPS {
                    t = self.add_to(t)?;
                    if t > after {
                        return Some(t);
                    }
                }
                None
            }
        }
    }

    fn add_to(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let with_months = if self.months > 0 {
            t.checked_add_months(Months::new(self.months))?
        } else {
            t
        };
        with_months.checked_add_signed(self.span)
    }
}

/// Parses an ISO-8601 duration into calendar months and an exact span.
///
/// Years and months are calendar-relative; weeks, days, hours, minutes,
/// and seconds are exact.
fn parse_duration(input: &str) -> Result<(u32, Duration), String> {
    let body = input
        .strip_prefix('P')
        .ok_or_else(|| "duration must begin with P".to_string())?;
    if body.is_empty() {
        return Err("duration has no components".to_string());
    }

    let mut months: u32 = 0;
    let mut span = Duration::zero();
    let mut in_time = false;
    let mut number = String::new();
    let mut saw_component = false;

    for c in body.chars() {
        match c {
            'T' => {
                if !number.is_empty() {
                    return Err("dangling number before T".to_string());
                }
                in_time = true;
            }
            '0'..='9' => number.push(c),
            designator => {
                let value: i64 = number
                    .parse()
                    .map_err(|_| format!("missing number before {designator}"))?;
                number.clear();
                saw_component = true;

                let component = match (designator, in_time) {
                    ('Y', false) => {
                        months = add_months(months, value, 12)?;
                        Some(Duration::zero())
                    }
                    ('M', false) => {
                        months = add_months(months, value, 1)?;
                        Some(Duration::zero())
                    }
                    ('W', false) => Duration::try_weeks(value),
                    ('D', false) => Duration::try_days(value),
                    ('H', true) => Duration::try_hours(value),
                    ('M', true) => Duration::try_minutes(value),
                    ('S', true) => Duration::try_seconds(value),
                    _ => return Err(format!("unexpected designator {designator}")),
                };
                let component = component
                    .ok_or_else(|| format!("{designator} component out of range"))?;
                span = span + component;
            }
        }
    }

    if !number.is_empty() {
        return Err("dangling number at end of duration".to_string());
    }
    if !saw_component {
        return Err("duration has no components".to_string());
    }

    Ok((months, span))
}

fn add_months(current: u32, value: i64, scale: u32) -> Result<u32, String> {
    let value = u32::try_from(value).map_err(|_| "month count out of range".to_string())?;
    value
        .checked_mul(scale)
        .and_then(|m| current.checked_add(m))
        .ok_or_else(|| "month count out of range".to_string())
}

impl fmt::Display for RepeatingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for RepeatingInterval {
    type Err = IntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for RepeatingInterval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for RepeatingInterval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(D::Error::custom)
    }
}
