//! Request parameter parsing.
//!
//! Everything here is pure: strings in, typed values or a [`ParamError`] out.

use crate::expr::{self, ParseError};
use crate::model::{
    Matcher, Timestamp, MAX_TIME, MAX_TIME_FORMATTED, MIN_TIME, MIN_TIME_FORMATTED,
};
use chrono::{DateTime, TimeDelta};
use thiserror::Error;

/// Parameter validation errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParamError {
    #[error("cannot parse {0:?} to a valid timestamp")]
    Timestamp(String),
    #[error("invalid time value for '{name}': {cause}")]
    TimeValue { name: String, cause: Box<ParamError> },
    #[error("cannot parse {0:?} to a valid duration")]
    Duration(String),
    #[error("cannot parse {0:?} to a valid duration. It overflows int64")]
    DurationOverflow(String),
    #[error("cannot parse {0:?} to a valid limit")]
    Limit(String),
    #[error("limit must be non-negative")]
    NegativeLimit,
    #[error("match[] must contain at least one non-empty matcher")]
    EmptyMatchers,
    #[error("{0}")]
    Selector(#[from] ParseError),
    #[error("cannot parse {0:?} to a valid boolean")]
    Bool(String),
}

/// Parse a timestamp: float Unix seconds (rounded to the millisecond),
/// RFC3339 with optional fractional seconds, or one of the two boundary
/// sentinels.
pub fn parse_time(s: &str) -> Result<Timestamp, ParamError> {
    if let Ok(t) = s.parse::<f64>() {
        if t.is_finite() {
            let secs = t.trunc();
            let frac_ms = ((t - secs) * 1000.0).round();
            return Ok((secs as i64)
                .saturating_mul(1000)
                .saturating_add(frac_ms as i64));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }

    // The calendar parser only handles four digit years.
    match s {
        MIN_TIME_FORMATTED => Ok(MIN_TIME),
        MAX_TIME_FORMATTED => Ok(MAX_TIME),
        _ => Err(ParamError::Timestamp(s.to_string())),
    }
}

/// Parse an optional time parameter, falling back to `default` when empty.
pub fn parse_time_param(
    name: &str,
    value: Option<&str>,
    default: Timestamp,
) -> Result<Timestamp, ParamError> {
    match value {
        None | Some("") => Ok(default),
        Some(v) => parse_time(v).map_err(|cause| ParamError::TimeValue {
            name: name.to_string(),
            cause: Box::new(cause),
        }),
    }
}

/// Parse a duration: float seconds or the compact `1h30m` grammar.
///
/// The float form may be negative; callers decide whether that is valid.
pub fn parse_duration(s: &str) -> Result<TimeDelta, ParamError> {
    if let Ok(secs) = s.parse::<f64>() {
        let nanos = secs * 1e9;
        if nanos.is_nan() || nanos > i64::MAX as f64 || nanos < i64::MIN as f64 {
            return Err(ParamError::DurationOverflow(s.to_string()));
        }
        return Ok(TimeDelta::nanoseconds(nanos as i64));
    }

    crate::model::parse_compact_duration(s).map_err(|_| ParamError::Duration(s.to_string()))
}

/// Parse a result limit. Empty means unlimited (0).
pub fn parse_limit(s: &str) -> Result<usize, ParamError> {
    if s.is_empty() {
        return Ok(0);
    }
    let limit: i64 = s.parse().map_err(|_| ParamError::Limit(s.to_string()))?;
    if limit < 0 {
        return Err(ParamError::NegativeLimit);
    }
    usize::try_from(limit).map_err(|_| ParamError::Limit(s.to_string()))
}

/// The limit to hand to storage: one more than requested so truncation can
/// be detected. Zero stays unlimited.
pub fn to_hint_limit(limit: usize) -> usize {
    if limit > 0 && limit < usize::MAX {
        limit + 1
    } else {
        limit
    }
}

/// Parse every `match[]` value as a metric selector.
///
/// Each selector must contain at least one matcher that rejects the empty
/// string, otherwise it would select every series.
pub fn parse_matchers(values: &[String]) -> Result<Vec<Vec<Matcher>>, ParamError> {
    let mut sets = Vec::with_capacity(values.len());
    for v in values {
        sets.push(expr::parse_metric_selector(v)?);
    }

    for set in &sets {
        if !set.iter().any(|m| !m.matches("")) {
            return Err(ParamError::EmptyMatchers);
        }
    }
    Ok(sets)
}

/// Boolean flags use the usual short and long spellings.
pub fn parse_bool(s: &str) -> Result<bool, ParamError> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(ParamError::Bool(s.to_string())),
    }
}
