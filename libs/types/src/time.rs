//! Wire timestamp parsing
//!
//! All collector timestamps are Unix nanoseconds (i64). The exchange sends
//! RFC 3339 strings with up to nanosecond precision.

use chrono::DateTime;
use thiserror::Error;

/// Failure to interpret a wire timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimestampError {
    #[error("unparseable RFC 3339 timestamp: {0}")]
    BadFormat(String),

    #[error("timestamp outside nanosecond range: {0}")]
    OutOfRange(String),
}

/// Parse an RFC 3339 timestamp into Unix nanoseconds.
pub fn parse_rfc3339_nanos(s: &str) -> Result<i64, TimestampError> {
    let dt = DateTime::parse_from_rfc3339(s)
        .map_err(|_| TimestampError::BadFormat(s.to_string()))?;
    dt.timestamp_nanos_opt()
        .ok_or_else(|| TimestampError::OutOfRange(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_epoch_second() {
        assert_eq!(
            parse_rfc3339_nanos("1970-01-01T00:00:01Z").unwrap(),
            1_000_000_000
        );
    }

    #[test]
    fn test_parse_nanosecond_precision() {
        // Full nine fractional digits survive the round trip
        let nanos = parse_rfc3339_nanos("2025-12-28T20:58:55.156352116Z").unwrap();
        assert_eq!(nanos % 1_000_000_000, 156_352_116);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(
            parse_rfc3339_nanos("not-a-timestamp"),
            Err(TimestampError::BadFormat("not-a-timestamp".to_string()))
        );
    }

    #[test]
    fn test_ordering_preserved() {
        let earlier = parse_rfc3339_nanos("2025-12-28T20:58:54.000000Z").unwrap();
        let later = parse_rfc3339_nanos("2025-12-28T20:58:55.000000Z").unwrap();
        assert!(earlier < later);
    }
}
