// Time newtypes and HTTP date handling.

use std::fmt::{Display, Formatter};
use std::ops::{Add, Deref, Sub};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

pub fn now_epoch_seconds() -> Seconds {
    let now_epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    Seconds(now_epoch)
}

pub fn now_epoch_milliseconds() -> Milliseconds {
    let now_epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;
    Milliseconds(now_epoch)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Seconds(u64);

impl Seconds {
    pub fn new(seconds: u64) -> Self {
        Seconds(seconds)
    }

    pub fn as_millis(&self) -> i64 {
        self.0.saturating_mul(1000).min(i64::MAX as u64) as i64
    }
}

impl Sub<Seconds> for Seconds {
    type Output = Seconds;

    fn sub(self, rhs: Seconds) -> Self::Output {
        Seconds(self.0 - rhs.0)
    }
}

impl Add<Seconds> for Seconds {
    type Output = Seconds;

    fn add(self, rhs: Seconds) -> Self::Output {
        Seconds(self.0 + rhs.0)
    }
}

impl Deref for Seconds {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for Seconds {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Epoch timestamp in milliseconds. Request/response timing is tracked at
/// this resolution; freshness arithmetic happens on the raw values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Milliseconds(u64);

impl Milliseconds {
    pub fn new(millis: u64) -> Self {
        Milliseconds(millis)
    }

    pub fn as_i64(&self) -> i64 {
        self.0.min(i64::MAX as u64) as i64
    }
}

impl Deref for Milliseconds {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for Milliseconds {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Seconds> for Milliseconds {
    fn from(seconds: Seconds) -> Self {
        Milliseconds(seconds.0.saturating_mul(1000))
    }
}

// The obsolete RFC 850 and asctime layouts still show up in the wild, so
// they stay accepted on the read side. Formatting always emits RFC 1123.
const RFC_850_FMT: &str = "%A, %d-%b-%y %H:%M:%S GMT";
const ASCTIME_FMT: &str = "%a %b %e %H:%M:%S %Y";

/// Parse an HTTP date header value into epoch milliseconds. Returns None for
/// anything unparseable; callers treat that the same as an absent header.
pub fn parse_http_date(value: &str) -> Option<i64> {
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.timestamp_millis());
    }
    for fmt in [RFC_850_FMT, ASCTIME_FMT] {
        if let Ok(date) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(date.and_utc().timestamp_millis());
        }
    }
    None
}

pub fn format_http_date(millis: i64) -> String {
    let date = Utc
        .timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap());
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_http_date_rfc_1123() {
        let millis = parse_http_date("Thu, 01 Jan 1970 00:00:10 GMT").unwrap();
        assert_eq!(10_000, millis);
    }

    #[test]
    fn test_parse_http_date_rfc_850() {
        let millis = parse_http_date("Thursday, 01-Jan-70 00:00:10 GMT").unwrap();
        assert_eq!(10_000, millis);
    }

    #[test]
    fn test_parse_http_date_asctime() {
        let millis = parse_http_date("Thu Jan  1 00:00:10 1970").unwrap();
        assert_eq!(10_000, millis);
    }

    #[test]
    fn test_parse_http_date_garbage_is_none() {
        let test_table = vec!["", "not a date", "2024-01-01T00:00:00Z"];
        for input in test_table {
            assert!(parse_http_date(input).is_none(), "parsed {input}");
        }
    }

    #[test]
    fn test_format_round_trips_through_parse() {
        let formatted = format_http_date(1_700_000_000_000);
        assert_eq!(Some(1_700_000_000_000), parse_http_date(&formatted));
    }

    #[test]
    fn test_seconds_to_millis() {
        assert_eq!(Milliseconds::new(2000), Milliseconds::from(Seconds::new(2)));
        assert_eq!(2000, Seconds::new(2).as_millis());
    }
}
