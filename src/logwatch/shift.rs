//! Shift classification by local time-of-day

use chrono::{
    DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc,
};

use super::schema::ShiftType;

/// Shift boundaries as seconds from local midnight
const DAY_START: u32 = 6 * 3600;
const SHIFT_CHANGE_START: u32 = 16 * 3600 + 30 * 60;
const NIGHT_START: u32 = 20 * 3600;
const BOUNDARIES: [u32; 3] = [DAY_START, SHIFT_CHANGE_START, NIGHT_START];

/// Zone used to turn instants into plant-local civil time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalZone {
    /// The host's configured time zone
    #[default]
    System,
    /// A fixed UTC offset
    Fixed(FixedOffset),
}

impl LocalZone {
    /// Parse an offset such as `+02:00` or `-0500`
    pub fn parse_offset(raw: &str) -> Option<Self> {
        raw.trim().parse::<FixedOffset>().ok().map(LocalZone::Fixed)
    }

    /// Local wall-clock time of day for an instant
    pub fn time_of_day(&self, instant: DateTime<Utc>) -> NaiveTime {
        match self {
            LocalZone::System => instant.with_timezone(&Local).time(),
            LocalZone::Fixed(offset) => instant.with_timezone(offset).time(),
        }
    }

    fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        match self {
            LocalZone::System => instant.with_timezone(&Local).date_naive(),
            LocalZone::Fixed(offset) => instant.with_timezone(offset).date_naive(),
        }
    }

    /// Like `to_utc`, but an ambiguous local time resolves to its earlier instant
    fn to_utc_earliest(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self {
            LocalZone::System => Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|t| t.with_timezone(&Utc)),
            LocalZone::Fixed(offset) => offset
                .from_local_datetime(&naive)
                .earliest()
                .map(|t| t.with_timezone(&Utc)),
        }
    }

    /// Interpret a naive local timestamp in this zone.
    /// Returns `None` for times skipped or repeated by a DST change.
    pub fn to_utc(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self {
            LocalZone::System => Local
                .from_local_datetime(&naive)
                .single()
                .map(|t| t.with_timezone(&Utc)),
            LocalZone::Fixed(offset) => offset
                .from_local_datetime(&naive)
                .single()
                .map(|t| t.with_timezone(&Utc)),
        }
    }
}

/// Shift an instant falls in, evaluated in `zone`
pub fn classify(instant: DateTime<Utc>, zone: &LocalZone) -> ShiftType {
    classify_time_of_day(zone.time_of_day(instant))
}

/// First shift boundary (06:00, 16:30 or 20:00 local) strictly after `instant`
pub fn next_boundary(instant: DateTime<Utc>, zone: &LocalZone) -> Option<DateTime<Utc>> {
    let today = zone.local_date(instant);
    [Some(today), today.succ_opt()]
        .into_iter()
        .flatten()
        .flat_map(|date| {
            BOUNDARIES.iter().filter_map(move |secs| {
                NaiveTime::from_num_seconds_from_midnight_opt(*secs, 0).map(|t| date.and_time(t))
            })
        })
        .filter_map(|naive| zone.to_utc_earliest(naive))
        .filter(|boundary| *boundary > instant)
        .min()
}

fn classify_time_of_day(t: NaiveTime) -> ShiftType {
    let t = t.num_seconds_from_midnight();
    if t >= DAY_START && t < SHIFT_CHANGE_START {
        ShiftType::Day
    } else if t >= SHIFT_CHANGE_START && t < NIGHT_START {
        ShiftType::ShiftChange
    } else if t >= NIGHT_START || t < DAY_START {
        ShiftType::Night
    } else {
        ShiftType::Unknown
    }
}
