use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

const NANOS_PER_MICRO: i128 = 1_000;
const NANOS_PER_MILLI: i128 = 1_000_000;
const NANOS_PER_SECOND: i128 = 1_000_000_000;
const NANOS_PER_MINUTE: i128 = 60 * NANOS_PER_SECOND;
const NANOS_PER_HOUR: i128 = 60 * NANOS_PER_MINUTE;
const MAX_FRACTION_DIGITS: usize = 18;

/// Time range `[start, end)` used to bound call and message queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ReportWindow {
    /// Resolves `start = now + start_offset` and `end = start + duration`.
    ///
    /// Both arguments are duration strings such as `-10m` or `1h30m`.
    pub fn resolve(
        now: DateTime<Utc>,
        start_offset: &str,
        duration: &str,
    ) -> Result<Self, WindowError> {
        let offset = parse_go_duration(start_offset)?;
        let length = parse_go_duration(duration)?;

        let start = now
            .checked_add_signed(offset)
            .ok_or_else(|| WindowError::OutOfRange(start_offset.to_string()))?;
        let end = start
            .checked_add_signed(length)
            .ok_or_else(|| WindowError::OutOfRange(duration.to_string()))?;

        Ok(Self { start, end })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("invalid duration {value:?}: {reason}")]
    InvalidDuration { value: String, reason: &'static str },
    #[error("duration {0:?} is out of range")]
    OutOfRange(String),
}

/// Parses the duration grammar used by Go's `time.ParseDuration`.
///
/// Accepts an optional sign followed by one or more `<decimal><unit>` terms,
/// e.g. `-10m`, `1h30m`, `1.5s`, `250ms`. Units: `ns`, `us`/`µs`, `ms`, `s`, `m`, `h`.
pub fn parse_go_duration(value: &str) -> Result<Duration, WindowError> {
    let invalid = |reason| WindowError::InvalidDuration {
        value: value.to_string(),
        reason,
    };

    let (negative, mut rest) = match value.as_bytes().first() {
        Some(b'-') => (true, &value[1..]),
        Some(b'+') => (false, &value[1..]),
        _ => (false, value),
    };

    if rest == "0" {
        return Ok(Duration::zero());
    }
    if rest.is_empty() {
        return Err(invalid("empty duration"));
    }

    let mut total: i128 = 0;
    while !rest.is_empty() {
        let number_end = rest
            .find(|ch: char| !(ch.is_ascii_digit() || ch == '.'))
            .unwrap_or(rest.len());
        let number = &rest[..number_end];
        rest = &rest[number_end..];

        let unit_end = rest
            .find(|ch: char| ch.is_ascii_digit() || ch == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_end];
        rest = &rest[unit_end..];

        let scale = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => NANOS_PER_MICRO,
            "ms" => NANOS_PER_MILLI,
            "s" => NANOS_PER_SECOND,
            "m" => NANOS_PER_MINUTE,
            "h" => NANOS_PER_HOUR,
            "" => return Err(invalid("missing unit")),
            _ => return Err(invalid("unknown unit")),
        };

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid("missing number"));
        }
        if !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("malformed number"));
        }

        let whole_value: i128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid("malformed number"))?
        };

        let fraction = &fraction[..fraction.len().min(MAX_FRACTION_DIGITS)];
        let fraction_nanos = if fraction.is_empty() {
            0
        } else {
            let digits: i128 = fraction.parse().map_err(|_| invalid("malformed number"))?;
            digits * scale / 10_i128.pow(fraction.len() as u32)
        };

        total = whole_value
            .checked_mul(scale)
            .and_then(|nanos| nanos.checked_add(fraction_nanos))
            .and_then(|nanos| total.checked_add(nanos))
            .filter(|nanos| *nanos <= i64::MAX as i128)
            .ok_or_else(|| WindowError::OutOfRange(value.to_string()))?;
    }

    let nanos = total as i64;
    Ok(Duration::nanoseconds(if negative { -nanos } else { nanos }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T12:00:00Z")
            .expect("fixed time")
            .with_timezone(&Utc)
    }

    #[test]
    fn parses_common_durations() {
        assert_eq!(parse_go_duration("-10m"), Ok(Duration::minutes(-10)));
        assert_eq!(parse_go_duration("5m"), Ok(Duration::minutes(5)));
        assert_eq!(
            parse_go_duration("1h30m"),
            Ok(Duration::minutes(90))
        );
        assert_eq!(
            parse_go_duration("1.5s"),
            Ok(Duration::milliseconds(1500))
        );
        assert_eq!(parse_go_duration("250ms"), Ok(Duration::milliseconds(250)));
        assert_eq!(parse_go_duration("2µs"), Ok(Duration::microseconds(2)));
        assert_eq!(parse_go_duration("+3h"), Ok(Duration::hours(3)));
        assert_eq!(parse_go_duration("0"), Ok(Duration::zero()));
        assert_eq!(parse_go_duration("-0"), Ok(Duration::zero()));
    }

    #[test]
    fn rejects_malformed_durations() {
        for value in ["", "-", "10", "10x", "m", "1..5s", "ten minutes", ".s"] {
            assert!(
                parse_go_duration(value).is_err(),
                "{value:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_overflowing_durations() {
        let err = parse_go_duration("9999999999999h").expect_err("overflow");
        assert!(matches!(err, WindowError::OutOfRange(_)));
    }

    #[test]
    fn resolves_window_from_offset_and_duration() {
        let window = ReportWindow::resolve(fixed_now(), "-10m", "5m").expect("window");
        assert_eq!(window.start.to_rfc3339(), "2024-01-01T11:50:00+00:00");
        assert_eq!(window.end.to_rfc3339(), "2024-01-01T11:55:00+00:00");
    }

    #[test]
    fn invalid_offset_fails_resolution() {
        let err = ReportWindow::resolve(fixed_now(), "yesterday", "5m").expect_err("invalid");
        assert!(matches!(err, WindowError::InvalidDuration { ref value, .. } if value == "yesterday"));
    }
}
