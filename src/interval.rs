//! Duration strings in the `1h30m`, `24h`, `90s`, `250ms` form.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntervalError {
    #[error("empty duration")]
    Empty,
    #[error("invalid duration {0:?}")]
    Invalid(String),
    #[error("unknown unit {unit:?} in duration {input:?}")]
    UnknownUnit { unit: String, input: String },
    #[error("duration {0:?} is out of range")]
    Overflow(String),
}

/// Inclusive time window used by administrative requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// The window ending at `now` and reaching back `interval`.
    pub fn trailing(interval: Duration, now: DateTime<Utc>) -> Self {
        Self {
            start: now - interval,
            end: now,
        }
    }
}

/// Parses a sequence of `<number><unit>` pairs. Units: ns, us, µs, ms, s, m, h.
/// A leading `-` is rejected; fractional numbers are allowed (`1.5h`).
pub fn parse_duration(input: &str) -> Result<Duration, IntervalError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(IntervalError::Empty);
    }
    if trimmed == "0" {
        return Ok(Duration::zero());
    }

    let mut total_nanos: f64 = 0.0;
    let mut rest = trimmed;

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| IntervalError::Invalid(trimmed.to_string()))?;
        if number_len == 0 {
            return Err(IntervalError::Invalid(trimmed.to_string()));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| IntervalError::Invalid(trimmed.to_string()))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let scale = match unit {
            "ns" => 1.0,
            "us" | "µs" => 1_000.0,
            "ms" => 1_000_000.0,
            "s" => 1_000_000_000.0,
            "m" => 60.0 * 1_000_000_000.0,
            "h" => 3_600.0 * 1_000_000_000.0,
            _ => {
                return Err(IntervalError::UnknownUnit {
                    unit: unit.to_string(),
                    input: trimmed.to_string(),
                });
            }
        };
        total_nanos += value * scale;
    }

    if !total_nanos.is_finite() || total_nanos > i64::MAX as f64 {
        return Err(IntervalError::Overflow(trimmed.to_string()));
    }
    Ok(Duration::nanoseconds(total_nanos.round() as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse_duration("24h"), Ok(Duration::hours(24)));
        assert_eq!(
            parse_duration("1h30m"),
            Ok(Duration::hours(1) + Duration::minutes(30))
        );
        assert_eq!(parse_duration("250ms"), Ok(Duration::milliseconds(250)));
        assert_eq!(parse_duration("1.5h"), Ok(Duration::minutes(90)));
        assert_eq!(parse_duration("0"), Ok(Duration::zero()));
    }

    #[test]
    fn rejects_malformed_durations() {
        assert_eq!(parse_duration(""), Err(IntervalError::Empty));
        assert!(matches!(parse_duration("10"), Err(IntervalError::Invalid(_))));
        assert!(matches!(parse_duration("-5m"), Err(IntervalError::Invalid(_))));
        assert!(matches!(
            parse_duration("3d"),
            Err(IntervalError::UnknownUnit { .. })
        ));
    }

    #[test]
    fn trailing_range_ends_now() {
        let now = Utc::now();
        let range = TimeRange::trailing(Duration::hours(2), now);
        assert_eq!(range.end, now);
        assert_eq!(range.end - range.start, Duration::hours(2));
    }
}
