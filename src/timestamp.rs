//! Millisecond + nanosecond remainder instants.

use std::{
    cmp::Ordering,
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};

const NANOS_PER_MILLI: i64 = 1_000_000;

/// Layouts accepted by [`Timestamp::to_iso`]. All are rendered in UTC.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IsoFormat {
    /// `2025-03-11`
    Date,
    /// `2025-03-11T22:20`
    DateTime,
    /// `2025-03-11T22:20:09`
    DateTimeSeconds,
    /// `2025-03-11T22:20:09.000000042`
    Full,
}

/// An instant as milliseconds since the UNIX epoch plus a nanosecond remainder
///
/// The remainder is always within `0..1_000_000`. Both fields of [`Timestamp::now`]
/// come from one [`SystemTime`] reading; values built from provider data keep
/// whatever milli/nano split the source supplied, normalized.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Timestamp {
    milli: i64,
    nano: i64,
}

impl Timestamp {
    pub fn now() -> Self {
        SystemTime::now().into()
    }

    /// Build from milliseconds and a nanosecond remainder, carrying any remainder
    /// outside `0..1_000_000` into the millisecond field.
    pub fn new(milli: i64, nano: i64) -> Self {
        Timestamp {
            milli: milli.saturating_add(nano.div_euclid(NANOS_PER_MILLI)),
            nano: nano.rem_euclid(NANOS_PER_MILLI),
        }
    }

    pub fn from_millis(milli: i64) -> Self {
        Timestamp { milli, nano: 0 }
    }

    pub fn milliseconds(&self) -> i64 {
        self.milli
    }

    /// Nanoseconds past the millisecond, always in `0..1_000_000`
    pub fn nanoseconds(&self) -> i64 {
        self.nano
    }

    /// Positive millisecond value; zero or negative stamps are placeholders
    pub fn is_valid(&self) -> bool {
        self.milli > 0
    }

    /// The instant as fractional seconds since the epoch
    pub fn to_seconds(&self) -> f64 {
        self.milli as f64 / 1000.0 + self.nano as f64 / 1e9
    }

    /// The instant as a single nanosecond counter
    ///
    /// An i64 of nanoseconds spans roughly 292 years either side of the epoch;
    /// instants beyond that saturate.
    pub fn to_nanos(&self) -> i64 {
        self.milli
            .saturating_mul(NANOS_PER_MILLI)
            .saturating_add(self.nano)
    }

    pub fn from_nanos(nanos: i64) -> Self {
        Timestamp::new(0, nanos)
    }

    fn to_datetime(&self) -> Option<DateTime<Utc>> {
        let secs = self.milli.div_euclid(1000);
        let subsec = (self.milli.rem_euclid(1000) * NANOS_PER_MILLI + self.nano) as u32;
        DateTime::from_timestamp(secs, subsec)
    }

    pub fn to_iso(&self, format: IsoFormat) -> String {
        let Some(datetime) = self.to_datetime() else {
            return format!("{}ms+{}ns", self.milli, self.nano);
        };
        let pattern = match format {
            IsoFormat::Date => "%Y-%m-%d",
            IsoFormat::DateTime => "%Y-%m-%dT%H:%M",
            IsoFormat::DateTimeSeconds => "%Y-%m-%dT%H:%M:%S",
            IsoFormat::Full => "%Y-%m-%dT%H:%M:%S%.9f",
        };
        datetime.format(pattern).to_string()
    }

    pub fn to_system_time(&self) -> SystemTime {
        let offset = Duration::from_nanos(self.to_nanos().unsigned_abs());
        if self.to_nanos() >= 0 {
            UNIX_EPOCH + offset
        } else {
            UNIX_EPOCH - offset
        }
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Timestamp::now()
    }
}

impl From<SystemTime> for Timestamp {
    fn from(value: SystemTime) -> Self {
        match value.duration_since(UNIX_EPOCH) {
            Ok(since) => Timestamp::new(
                since.as_millis() as i64,
                (since.subsec_nanos() % 1_000_000) as i64,
            ),
            Err(before) => {
                let before = before.duration();
                Timestamp::new(
                    -(before.as_millis() as i64),
                    -((before.subsec_nanos() % 1_000_000) as i64),
                )
            }
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
        self.milli
            .cmp(&other.milli)
            .then(self.nano.cmp(&other.nano))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso(IsoFormat::Full))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}ms + {}ns)", self.milli, self.nano)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn carries_remainders() {
        let t = Timestamp::new(10, 2_500_000);
        assert_eq!((t.milliseconds(), t.nanoseconds()), (12, 500_000));
        let t = Timestamp::new(10, -1);
        assert_eq!((t.milliseconds(), t.nanoseconds()), (9, 999_999));
        let t = Timestamp::new(10, -3_000_000);
        assert_eq!((t.milliseconds(), t.nanoseconds()), (7, 0));
    }

    #[test]
    fn ordering() {
        let a = Timestamp::new(5, 10);
        let b = Timestamp::new(5, 11);
        let c = Timestamp::new(4, 2_000_000);
        assert!(a < b);
        assert!(c > b);
        assert_eq!(c, Timestamp::new(6, 0));
    }

    #[test]
    fn iso_formats() {
        // 2025-03-11T22:20:09 UTC
        let t = Timestamp::new(1_741_731_609_123, 456_789);
        assert_eq!(t.to_iso(IsoFormat::Date), "2025-03-11");
        assert_eq!(t.to_iso(IsoFormat::DateTime), "2025-03-11T22:20");
        assert_eq!(t.to_iso(IsoFormat::DateTimeSeconds), "2025-03-11T22:20:09");
        assert_eq!(t.to_iso(IsoFormat::Full), "2025-03-11T22:20:09.123456789");
    }

    #[test]
    fn seconds_and_system_time() {
        let t = Timestamp::new(1500, 250_000);
        assert!((t.to_seconds() - 1.50025).abs() < 1e-12);
        assert_eq!(Timestamp::from(t.to_system_time()), t);
        assert!(Timestamp::now().is_valid());
        assert!(!Timestamp::from_millis(0).is_valid());
    }

    proptest! {
        #[test]
        fn normalization_preserves_instant(
            milli in -1_000_000_000_000i64..1_000_000_000_000i64,
            nano in -5_000_000_000i64..5_000_000_000i64,
        ) {
            let t = Timestamp::new(milli, nano);
            prop_assert!((0..1_000_000).contains(&t.nanoseconds()));
            prop_assert_eq!(t.to_nanos(), milli * 1_000_000 + nano);
            prop_assert_eq!(Timestamp::from_nanos(t.to_nanos()), t);
        }
    }
}
