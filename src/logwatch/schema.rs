//! Schema definitions for runtime intervals, snapshots and session records

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Operating status inferred from the equipment log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Status {
    /// Part program / tech data being downloaded
    Setup,
    /// Cycle running
    Cutting,
    /// Processing finished, waiting for the next cycle
    Idle,
    /// Nothing observed yet
    #[default]
    Unknown,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Setup => "Setup",
            Status::Cutting => "Cutting",
            Status::Idle => "Idle",
            Status::Unknown => "Unknown",
        }
    }
}

/// Time-of-day shift an interval started in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ShiftType {
    #[serde(rename = "Day Shift")]
    Day,
    #[serde(rename = "Shift Change")]
    ShiftChange,
    #[serde(rename = "Night Shift")]
    Night,
    #[default]
    #[serde(rename = "Unknown Shift")]
    Unknown,
}

impl ShiftType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShiftType::Day => "Day Shift",
            ShiftType::ShiftChange => "Shift Change",
            ShiftType::Night => "Night Shift",
            ShiftType::Unknown => "Unknown Shift",
        }
    }
}

/// End of an interval; `Ongoing` while it is still open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndTime {
    Ongoing,
    At(DateTime<Utc>),
}

impl EndTime {
    pub fn is_ongoing(&self) -> bool {
        matches!(self, EndTime::Ongoing)
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            EndTime::Ongoing => None,
            EndTime::At(t) => Some(*t),
        }
    }
}

const ONGOING: &str = "Ongoing";

impl Serialize for EndTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            EndTime::Ongoing => serializer.serialize_str(ONGOING),
            EndTime::At(t) => t.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for EndTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw == ONGOING {
            return Ok(EndTime::Ongoing);
        }
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| EndTime::At(t.with_timezone(&Utc)))
            .map_err(serde::de::Error::custom)
    }
}

/// One contiguous span of a single status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    /// Equipment that produced this interval
    pub equipment_id: String,
    pub status: Status,
    pub start_time: DateTime<Utc>,
    pub end_time: EndTime,
    /// Set once the interval is closed
    #[serde(with = "timedelta_format::option")]
    pub total_time: Option<TimeDelta>,
    #[serde(default)]
    pub part_file: Option<String>,
    #[serde(default)]
    pub tech_data: Option<String>,
    /// Parts completed during this interval
    #[serde(default)]
    pub session_part_count: u32,
    /// Parts completed in the whole session, as of this interval
    #[serde(default)]
    pub total_part_count: u32,
    /// Alarm messages seen while the interval was open
    #[serde(default)]
    pub details: Vec<String>,
    pub shift_type: ShiftType,
}

impl Interval {
    pub fn is_open(&self) -> bool {
        self.end_time.is_ongoing()
    }

    /// Elapsed time, measured up to `now` while still open
    #[cfg(test)]
    pub fn elapsed(&self, now: DateTime<Utc>) -> TimeDelta {
        match self.total_time {
            Some(total) => total,
            None => now.signed_duration_since(self.start_time),
        }
    }
}

/// Full current state of one equipment's session, pushed to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub equipment_id: String,
    pub intervals: Vec<Interval>,
    #[serde(with = "timedelta_format")]
    pub avg_cutting_time: TimeDelta,
    #[serde(with = "timedelta_format")]
    pub avg_idle_time: TimeDelta,
}

/// Final record written when a session closes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub equipment_id: String,
    pub display_name: String,
    pub part_file: Option<String>,
    pub tech_data: Option<String>,
    #[serde(with = "timedelta_format")]
    pub total_cutting_duration: TimeDelta,
    #[serde(with = "timedelta_format")]
    pub total_idle_duration: TimeDelta,
    pub cutting_count: u32,
    pub idle_count: u32,
    #[serde(with = "timedelta_format")]
    pub avg_cutting_time: TimeDelta,
    #[serde(with = "timedelta_format")]
    pub avg_idle_time: TimeDelta,
    pub total_part_count: u32,
    pub intervals: Vec<Interval>,
}

impl SessionRecord {
    /// Start of the first interval, if any
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.intervals.first().map(|i| i.start_time)
    }
}

/// Durations rendered as `H:MM:SS[.ffffff]`, with a `N day(s), ` prefix past 24h.
/// This is the format the downstream uploader copies into its duration fields.
pub mod timedelta_format {
    use chrono::TimeDelta;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(delta: &TimeDelta) -> String {
        if *delta < TimeDelta::zero() {
            return format!("-{}", format(&-*delta));
        }
        let secs = delta.num_seconds();
        let micros = delta.subsec_nanos() / 1_000;
        let days = secs / 86_400;
        let rem = secs % 86_400;
        let mut out = String::new();
        if days > 0 {
            out.push_str(&format!("{} day{}, ", days, if days == 1 { "" } else { "s" }));
        }
        out.push_str(&format!("{}:{:02}:{:02}", rem / 3600, (rem % 3600) / 60, rem % 60));
        if micros > 0 {
            out.push_str(&format!(".{:06}", micros));
        }
        out
    }

    pub fn parse(raw: &str) -> Option<TimeDelta> {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix('-') {
            return parse(rest).map(|d| -d);
        }

        let (days, clock) = match raw.split_once(", ") {
            Some((day_part, clock)) => {
                let count = day_part.split_whitespace().next()?.parse::<i64>().ok()?;
                (count, clock)
            }
            None => (0, raw),
        };

        let (whole, fraction) = match clock.split_once('.') {
            Some((whole, fraction)) => (whole, Some(fraction)),
            None => (clock, None),
        };

        let mut parts = whole.split(':');
        let hours = parts.next()?.parse::<i64>().ok()?;
        let minutes = parts.next()?.parse::<i64>().ok()?;
        let seconds = parts.next()?.parse::<i64>().ok()?;
        if parts.next().is_some() || minutes >= 60 || seconds >= 60 {
            return None;
        }

        let micros = match fraction {
            Some(f) if f.len() <= 6 && f.chars().all(|c| c.is_ascii_digit()) => {
                format!("{:0<6}", f).parse::<i64>().ok()?
            }
            Some(_) => return None,
            None => 0,
        };

        let total_secs = days * 86_400 + hours * 3600 + minutes * 60 + seconds;
        Some(TimeDelta::seconds(total_secs) + TimeDelta::microseconds(micros))
    }

    pub fn serialize<S: Serializer>(delta: &TimeDelta, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(delta))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TimeDelta, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid duration {:?}", raw)))
    }

    /// Optional durations; `None` is written as `N/A`
    pub mod option {
        use chrono::TimeDelta;
        use serde::{Deserialize, Deserializer, Serializer};

        const NOT_AVAILABLE: &str = "N/A";

        pub fn serialize<S: Serializer>(
            delta: &Option<TimeDelta>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match delta {
                Some(d) => serializer.serialize_str(&super::format(d)),
                None => serializer.serialize_str(NOT_AVAILABLE),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<TimeDelta>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            match raw.as_deref() {
                None | Some(NOT_AVAILABLE) => Ok(None),
                Some(s) => super::parse(s)
                    .map(Some)
                    .ok_or_else(|| serde::de::Error::custom(format!("invalid duration {:?}", s))),
            }
        }
    }
}
