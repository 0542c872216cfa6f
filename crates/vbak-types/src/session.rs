use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TypeError;

const NAME_FORMAT: &str = "S_%Y%m%d-%H%M%S";

/// Suffix marking a session directory that has not been committed yet.
pub const TEMP_SUFFIX: &str = "-tmp";

/// Name of a backup session, derived from its local capture time.
///
/// The textual form is `S_YYYYMMDD-HHMMSS`. Names sort chronologically and
/// the engine never creates two sessions with the same name for a volume.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionName(NaiveDateTime);

impl SessionName {
    /// Session name for a local wall-clock time (sub-second part dropped).
    pub fn from_time(time: NaiveDateTime) -> Self {
        Self(time.with_nanosecond(0).unwrap_or(time))
    }

    /// Session name for the current local time.
    pub fn now() -> Self {
        Self::from_time(Local::now().naive_local())
    }

    /// Session name for the current time, bumped past `last` if the clock
    /// has not advanced beyond it.
    pub fn next_after(last: Option<&SessionName>) -> Self {
        let now = Self::now();
        match last {
            Some(last) if now <= *last => Self(last.0 + Duration::seconds(1)),
            _ => now,
        }
    }

    /// Capture time as a naive local timestamp.
    pub fn time(&self) -> NaiveDateTime {
        self.0
    }

    /// Capture time resolved in the local time zone, if unambiguous.
    pub fn local_time(&self) -> Option<DateTime<Local>> {
        self.0.and_local_timezone(Local).single()
    }

    /// Name of the uncommitted (temporary) directory for this session.
    pub fn temp_name(&self) -> String {
        format!("{self}{TEMP_SUFFIX}")
    }

    /// Parse a temporary directory name back into a session name.
    pub fn from_temp_name(name: &str) -> Option<Self> {
        name.strip_suffix(TEMP_SUFFIX)
            .and_then(|base| base.parse().ok())
    }
}

impl FromStr for SessionName {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.starts_with("S_") || s.len() != 17 {
            return Err(TypeError::InvalidSessionName(s.to_string()));
        }
        NaiveDateTime::parse_from_str(s, NAME_FORMAT)
            .map(Self)
            .map_err(|_| TypeError::InvalidSessionName(s.to_string()))
    }
}

impl fmt::Debug for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionName({self})")
    }
}

impl fmt::Display for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(NAME_FORMAT))
    }
}

impl Serialize for SessionName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SessionName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> SessionName {
        SessionName::from_time(
            NaiveDate::from_ymd_opt(2024, 3, 9)
                .unwrap()
                .and_hms_opt(h, m, s)
                .unwrap(),
        )
    }

    #[test]
    fn display_format() {
        assert_eq!(at(7, 5, 3).to_string(), "S_20240309-070503");
    }

    #[test]
    fn parse_roundtrip() {
        let name = at(23, 59, 58);
        let parsed: SessionName = name.to_string().parse().unwrap();
        assert_eq!(parsed, name);
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in ["", "S_2024", "X_20240309-070503", "S_20241309-070503", "S_20240309-070503x"] {
            assert!(bad.parse::<SessionName>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn names_sort_chronologically() {
        assert!(at(1, 0, 0) < at(1, 0, 1));
        assert!(at(0, 59, 59) < at(1, 0, 0));
    }

    #[test]
    fn next_after_is_strictly_later() {
        let future = SessionName::from_time(Local::now().naive_local() + Duration::hours(1));
        let next = SessionName::next_after(Some(&future));
        assert!(next > future);
        assert!(SessionName::next_after(None) <= SessionName::now());
    }

    #[test]
    fn temp_names() {
        let name = at(12, 0, 0);
        assert_eq!(name.temp_name(), "S_20240309-120000-tmp");
        assert_eq!(SessionName::from_temp_name(&name.temp_name()), Some(name));
        assert_eq!(SessionName::from_temp_name(&name.to_string()), None);
    }

    #[test]
    fn serde_as_string() {
        let name = at(8, 30, 0);
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"S_20240309-083000\"");
        let back: SessionName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, name);
    }
}
