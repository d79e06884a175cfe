//! Canonical timestamps and clocks.
//!
//! Timestamps are stored as text in the canonical form
//! `yyyy-MM-ddTHH:mm:ss.SSS+00:00`. Every timestamp is normalized to UTC with
//! millisecond precision before it is formatted, so comparing two canonical
//! strings gives the same answer as comparing the instants. Both the change
//! log and the auto-delete sweep rely on that when they compare in SQL.

use crate::{error::Result, Error};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::atomic::{AtomicI64, Ordering};

/// A UTC instant with millisecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Build from any zoned date time, truncating to milliseconds.
    pub fn from_datetime<Tz: TimeZone>(dt: DateTime<Tz>) -> Self {
        let millis = dt.timestamp_millis();
        // Truncation keeps the instant inside chrono's range.
        Self(
            Utc.timestamp_millis_opt(millis)
                .single()
                .unwrap_or_else(|| dt.with_timezone(&Utc)),
        )
    }

    /// Build from milliseconds since the Unix epoch.
    pub fn from_millis(millis: i64) -> Result<Self> {
        Utc.timestamp_millis_opt(millis)
            .single()
            .map(Self)
            .ok_or_else(|| Error::InvalidTimestamp(millis.to_string()))
    }

    /// Parse an RFC 3339 timestamp with any offset.
    pub fn parse(text: &str) -> Result<Self> {
        DateTime::parse_from_rfc3339(text.trim())
            .map(Self::from_datetime)
            .map_err(|_| Error::InvalidTimestamp(text.to_string()))
    }

    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Canonical storage form, always with a `+00:00` offset.
    pub fn to_canonical(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Millis, false)
    }

    /// Offset this timestamp by a signed number of milliseconds.
    pub fn add_millis(&self, millis: i64) -> Result<Self> {
        Self::from_millis(self.millis().saturating_add(millis))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_canonical())
    }
}

impl std::str::FromStr for Timestamp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_canonical())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Timestamp::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// Source of "now" for writes, log entries and the expiry sweep.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Timestamp;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: AtomicI64::new(start.millis()),
        }
    }

    pub fn set(&self, to: Timestamp) {
        self.millis.store(to.millis(), Ordering::SeqCst);
    }

    pub fn advance_millis(&self, millis: i64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        let millis = self.millis.load(Ordering::SeqCst);
        Timestamp::from_millis(millis).unwrap_or_else(|_| Timestamp::now())
    }
}
