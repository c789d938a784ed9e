//! Event timestamps: wall clock or parsed from the log line

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use super::shift::LocalZone;
use crate::error::SessionError;

/// Default layout of the leading timestamp field in controller logs
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Where event times come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimestampMode {
    /// Stamp events with the time they were read
    #[default]
    WallClock,
    /// Parse the text before the first `|` of each line
    LogLine,
}

/// Produces event times and tracks the latest one seen
#[derive(Debug, Clone)]
pub struct EventClock {
    mode: TimestampMode,
    format: String,
    zone: LocalZone,
    last_seen: Option<DateTime<Utc>>,
}

impl EventClock {
    pub fn new(mode: TimestampMode, format: impl Into<String>, zone: LocalZone) -> Self {
        Self {
            mode,
            format: format.into(),
            zone,
            last_seen: None,
        }
    }

    /// Time for an event found on `line`
    pub fn stamp(&mut self, line: &str) -> Result<DateTime<Utc>, SessionError> {
        let at = match self.mode {
            TimestampMode::WallClock => Utc::now(),
            TimestampMode::LogLine => self.parse_line(line)?,
        };
        self.last_seen = Some(self.last_seen.map_or(at, |prev| prev.max(at)));
        Ok(at)
    }

    /// Current time for shift checks and forced closes.
    /// In log-line mode this is the latest stamp seen, `None` before the first one.
    pub fn now(&self) -> Option<DateTime<Utc>> {
        match self.mode {
            TimestampMode::WallClock => Some(Utc::now()),
            TimestampMode::LogLine => self.last_seen,
        }
    }

    fn parse_line(&self, line: &str) -> Result<DateTime<Utc>, SessionError> {
        let raw = line.split('|').next().unwrap_or("").trim();
        NaiveDateTime::parse_from_str(raw, &self.format)
            .ok()
            .and_then(|naive| self.zone.to_utc(naive))
            .ok_or_else(|| SessionError::UnparseableTimestamp {
                raw: raw.to_string(),
            })
    }
}
