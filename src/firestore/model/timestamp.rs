use std::cmp::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Point in time with nanosecond precision, independent of any timezone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i32) -> Self {
        let mut timestamp = Self { seconds, nanos };
        timestamp.normalize();
        timestamp
    }

    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));
        Self {
            seconds: duration.as_secs() as i64,
            nanos: duration.subsec_nanos() as i32,
        }
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(duration) => Self {
                seconds: duration.as_secs() as i64,
                nanos: duration.subsec_nanos() as i32,
            },
            Err(err) => {
                let duration = err.duration();
                Self {
                    seconds: -(duration.as_secs() as i64),
                    nanos: -(duration.subsec_nanos() as i32),
                }
            }
        }
    }

    pub fn to_system_time(&self) -> SystemTime {
        if self.seconds >= 0 {
            UNIX_EPOCH + Duration::from_secs(self.seconds as u64) + Duration::from_nanos(self.nanos as u64)
        } else {
            UNIX_EPOCH
                - Duration::from_secs((-self.seconds) as u64)
                - Duration::from_nanos(self.nanos.unsigned_abs() as u64)
        }
    }

    pub fn from_millis(millis: i64) -> Self {
        Self::new(millis.div_euclid(1_000), (millis.rem_euclid(1_000) * 1_000_000) as i32)
    }

    pub fn to_millis(&self) -> i64 {
        self.seconds * 1_000 + i64::from(self.nanos) / 1_000_000
    }

    pub fn to_micros(&self) -> i64 {
        self.seconds * 1_000_000 + i64::from(self.nanos) / 1_000
    }

    /// Parses an RFC 3339 timestamp as produced by the REST API.
    pub fn from_rfc3339(value: &str) -> Option<Self> {
        let parsed = chrono::DateTime::parse_from_rfc3339(value).ok()?;
        Some(Self::new(parsed.timestamp(), parsed.timestamp_subsec_nanos() as i32))
    }

    /// Formats the timestamp as RFC 3339 with nanosecond precision (`Z` suffix).
    pub fn to_rfc3339(&self) -> String {
        chrono::DateTime::from_timestamp(self.seconds, self.nanos as u32)
            .map(|date| date.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true))
            .unwrap_or_else(|| "1970-01-01T00:00:00.000000000Z".to_string())
    }

    fn normalize(&mut self) {
        let extra_seconds = self.nanos.div_euclid(1_000_000_000);
        self.seconds += extra_seconds as i64;
        self.nanos = self.nanos.rem_euclid(1_000_000_000);
        if self.seconds > 0 && self.nanos < 0 {
            self.seconds -= 1;
            self.nanos += 1_000_000_000;
        }
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.seconds.cmp(&other.seconds) {
            Ordering::Equal => self.nanos.cmp(&other.nanos),
            ordering => ordering,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_nanoseconds() {
        let timestamp = Timestamp::new(1, 1_500_000_000);
        assert_eq!(timestamp.seconds, 2);
        assert_eq!(timestamp.nanos, 500_000_000);
    }

    #[test]
    fn rfc3339_roundtrip() {
        let timestamp = Timestamp::new(1_700_000_000, 123_456_789);
        let text = timestamp.to_rfc3339();
        assert_eq!(text, "2023-11-14T22:13:20.123456789Z");
        assert_eq!(Timestamp::from_rfc3339(&text), Some(timestamp));
    }

    #[test]
    fn millis_conversion_handles_negative_values() {
        let timestamp = Timestamp::from_millis(-1);
        assert_eq!(timestamp.seconds, -1);
        assert_eq!(timestamp.nanos, 999_000_000);
    }

    #[test]
    fn ordering() {
        let earlier = Timestamp::new(1, 0);
        let later = Timestamp::new(2, 0);
        assert!(earlier < later);
    }
}
