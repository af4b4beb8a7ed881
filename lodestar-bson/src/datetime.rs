//! Millisecond-precision UTC date-times as stored on the wire.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};

use crate::error::{BsonError, BsonResult};

/// Milliseconds since the Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DateTime(i64);

impl DateTime {
    pub const MIN: Self = Self(i64::MIN);
    pub const MAX: Self = Self(i64::MAX);
    pub const UNIX_EPOCH: Self = Self(0);
    /// 9999-12-31T23:59:59.999Z, the last instant with a four-digit year.
    pub const MAX_FOUR_DIGIT_YEAR: Self = Self(253_402_300_799_999);

    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub const fn timestamp_millis(self) -> i64 {
        self.0
    }

    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    pub fn from_chrono(value: chrono::DateTime<Utc>) -> Self {
        Self(value.timestamp_millis())
    }

    /// `None` when the instant is outside chrono's range.
    pub fn to_chrono(self) -> Option<chrono::DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.0).single()
    }

    /// Whether the instant falls in years 1970 through 9999, the range the
    /// relaxed JSON dialect writes as an ISO-8601 string.
    pub fn is_in_relaxed_range(self) -> bool {
        (0..=Self::MAX_FOUR_DIGIT_YEAR.0).contains(&self.0)
    }

    /// ISO-8601 text such as `1970-01-01T00:00:00Z`, with milliseconds only
    /// when non-zero. `None` outside chrono's range.
    pub fn to_iso_string(self) -> Option<String> {
        let value = self.to_chrono()?;
        let format = if self.0.rem_euclid(1000) == 0 {
            SecondsFormat::Secs
        } else {
            SecondsFormat::Millis
        };
        Some(value.to_rfc3339_opts(format, true))
    }

    /// Parse RFC 3339 text, a naive `YYYY-MM-DDTHH:MM:SS[.fff]` (taken as
    /// UTC), or a bare `YYYY-MM-DD`.
    pub fn parse_iso(s: &str) -> BsonResult<Self> {
        if let Ok(value) = chrono::DateTime::parse_from_rfc3339(s) {
            return Ok(Self(value.timestamp_millis()));
        }
        for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.fZ", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                return Ok(Self(naive.and_utc().timestamp_millis()));
            }
        }
        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            if let Some(naive) = date.and_hms_opt(0, 0, 0) {
                return Ok(Self(naive.and_utc().timestamp_millis()));
            }
        }
        Err(BsonError::format(format!("invalid ISO-8601 date {:?}", s)))
    }
}

impl From<chrono::DateTime<Utc>> for DateTime {
    fn from(value: chrono::DateTime<Utc>) -> Self {
        Self::from_chrono(value)
    }
}

impl fmt::Debug for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_iso_string() {
            Some(text) => write!(f, "DateTime({})", text),
            None => write!(f, "DateTime({}ms)", self.0),
        }
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_iso_string() {
            Some(text) => f.write_str(&text),
            None => write!(f, "{}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso_formatting() {
        assert_eq!(DateTime::UNIX_EPOCH.to_iso_string().unwrap(), "1970-01-01T00:00:00Z");
        assert_eq!(
            DateTime::from_millis(1).to_iso_string().unwrap(),
            "1970-01-01T00:00:00.001Z"
        );
        assert_eq!(
            DateTime::MAX_FOUR_DIGIT_YEAR.to_iso_string().unwrap(),
            "9999-12-31T23:59:59.999Z"
        );
        assert_eq!(DateTime::MAX.to_iso_string(), None);
    }

    #[test]
    fn test_iso_parsing() {
        assert_eq!(DateTime::parse_iso("1970-01-01T00:00:00Z").unwrap(), DateTime::UNIX_EPOCH);
        assert_eq!(
            DateTime::parse_iso("1970-01-01T00:00:01.500+00:00").unwrap(),
            DateTime::from_millis(1500)
        );
        assert_eq!(DateTime::parse_iso("1970-01-02").unwrap(), DateTime::from_millis(86_400_000));
        assert!(DateTime::parse_iso("yesterday").is_err());
    }

    #[test]
    fn test_relaxed_range() {
        assert!(DateTime::UNIX_EPOCH.is_in_relaxed_range());
        assert!(!DateTime::from_millis(-1).is_in_relaxed_range());
        assert!(!DateTime::from_millis(253_402_300_800_000).is_in_relaxed_range());
    }
}
