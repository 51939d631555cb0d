//! Millisecond timestamps and the compact duration grammar (`1h30m`).

use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use std::sync::OnceLock;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Default start of optional time ranges.
///
/// Kept at its historical value rather than the true `i64` extreme so that
/// clients echoing it back keep working.
pub const MIN_TIME: Timestamp = (i64::MIN / 1000 + 62_135_596_801) * 1000;

/// Default end of optional time ranges.
pub const MAX_TIME: Timestamp = (i64::MAX / 1000 - 62_135_596_801) * 1000 + 999;

/// RFC3339 spelling of [`MIN_TIME`]. The calendar parser rejects the year.
pub const MIN_TIME_FORMATTED: &str = "-292273086-05-16T16:47:06Z";

/// RFC3339 spelling of [`MAX_TIME`].
pub const MAX_TIME_FORMATTED: &str = "292277026-12-04T15:30:07.999999999Z";

const MS_PER_SECOND: i64 = 1000;
const MS_PER_MINUTE: i64 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: i64 = 60 * MS_PER_MINUTE;
const MS_PER_DAY: i64 = 24 * MS_PER_HOUR;
const MS_PER_WEEK: i64 = 7 * MS_PER_DAY;
const MS_PER_YEAR: i64 = 365 * MS_PER_DAY;

/// Current wall clock time in milliseconds.
pub fn now() -> Timestamp {
    Utc::now().timestamp_millis()
}

/// Convert a millisecond timestamp into a calendar time, if representable.
pub fn to_datetime(t: Timestamp) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(t)
}

fn duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(([0-9]+)y)?(([0-9]+)w)?(([0-9]+)d)?(([0-9]+)h)?(([0-9]+)m)?(([0-9]+)s)?(([0-9]+)ms)?$",
        )
        .unwrap_or_else(|e| panic!("duration pattern must compile: {e}"))
    })
}

/// Parse the compact duration grammar: units `y w d h m s ms`, each at most
/// once and in that order. `"0"` is accepted as zero.
pub fn parse_compact_duration(s: &str) -> Result<TimeDelta, String> {
    match s {
        "" => return Err("empty duration string".to_string()),
        "0" => return Ok(TimeDelta::zero()),
        _ => {}
    }

    let caps = duration_regex()
        .captures(s)
        .ok_or_else(|| format!("not a valid duration string: {:?}", s))?;

    let units = [
        (2, MS_PER_YEAR),
        (4, MS_PER_WEEK),
        (6, MS_PER_DAY),
        (8, MS_PER_HOUR),
        (10, MS_PER_MINUTE),
        (12, MS_PER_SECOND),
        (14, 1),
    ];

    let mut total: i64 = 0;
    for (group, mult) in units {
        let Some(m) = caps.get(group) else { continue };
        let n: i64 = m
            .as_str()
            .parse()
            .map_err(|_| format!("invalid value {:?} in duration {:?}", m.as_str(), s))?;
        total = n
            .checked_mul(mult)
            .and_then(|ms| total.checked_add(ms))
            .ok_or_else(|| format!("duration {:?} out of range", s))?;
    }

    TimeDelta::try_milliseconds(total).ok_or_else(|| format!("duration {:?} out of range", s))
}

/// Render milliseconds in the compact duration grammar, largest units first.
pub fn format_compact_duration(ms: i64) -> String {
    if ms == 0 {
        return "0s".to_string();
    }

    let (sign, mut rest) = if ms < 0 { ("-", -ms) } else { ("", ms) };
    let mut out = String::from(sign);

    // Years and weeks are only used when they divide evenly.
    for (unit, mult, exact) in [
        ("y", MS_PER_YEAR, true),
        ("w", MS_PER_WEEK, true),
        ("d", MS_PER_DAY, false),
        ("h", MS_PER_HOUR, false),
        ("m", MS_PER_MINUTE, false),
        ("s", MS_PER_SECOND, false),
        ("ms", 1, false),
    ] {
        if exact && rest % mult != 0 {
            continue;
        }
        let v = rest / mult;
        if v > 0 {
            out.push_str(&format!("{}{}", v, unit));
            rest -= v * mult;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_constants() {
        assert_eq!(MIN_TIME, -9_223_309_901_257_974_000);
        assert_eq!(MAX_TIME, 9_223_309_901_257_974_999);
    }

    #[test]
    fn test_parse_compact_duration() {
        assert_eq!(parse_compact_duration("5m").unwrap(), TimeDelta::minutes(5));
        assert_eq!(
            parse_compact_duration("1h30m").unwrap(),
            TimeDelta::minutes(90)
        );
        assert_eq!(
            parse_compact_duration("1s500ms").unwrap(),
            TimeDelta::milliseconds(1500)
        );
        assert_eq!(parse_compact_duration("0").unwrap(), TimeDelta::zero());

        // Units out of order or repeated
        assert!(parse_compact_duration("30m1h").is_err());
        assert!(parse_compact_duration("1m1m").is_err());
        assert!(parse_compact_duration("").is_err());
        assert!(parse_compact_duration("1.5h").is_err());
    }

    #[test]
    fn test_format_compact_duration() {
        assert_eq!(format_compact_duration(0), "0s");
        assert_eq!(format_compact_duration(90 * MS_PER_MINUTE), "1h30m");
        assert_eq!(format_compact_duration(MS_PER_WEEK), "1w");
        assert_eq!(format_compact_duration(8 * MS_PER_DAY), "8d");
        assert_eq!(format_compact_duration(1500), "1s500ms");
    }
}
