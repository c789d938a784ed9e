//! Runtime session state machine and interval ledger
//!
//! A session spans from one `Setup` transition to the next. Within it, every status
//! change closes the open interval and opens a new one, so the ledger stays
//! contiguous. Only the last interval may be `Ongoing`.

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use tracing::debug;

use super::classifier::LineEvent;
use super::schema::{EndTime, Interval, SessionRecord, Snapshot, Status};
use super::shift::{self, LocalZone};
use super::stats::StatsAggregator;
use crate::error::SessionError;

/// Identity of a monitored equipment unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Equipment {
    pub id: String,
    pub display_name: String,
}

impl Equipment {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Part program and recipe captured during the latest setup phase
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct SetupContext {
    part_file: Option<String>,
    tech_data: Option<String>,
}

/// Result of applying one event
#[derive(Debug, Default)]
pub struct Applied {
    /// Session state changed and a new snapshot should be pushed
    pub changed: bool,
    /// The previous session closed and must be persisted
    pub closed: Option<SessionRecord>,
}

impl Applied {
    fn unchanged() -> Self {
        Self::default()
    }

    fn changed() -> Self {
        Self {
            changed: true,
            closed: None,
        }
    }
}

/// Session ledger for one equipment unit
#[derive(Debug, Clone)]
pub struct RuntimeSession {
    equipment: Equipment,
    zone: LocalZone,
    status: Status,
    intervals: Vec<Interval>,
    stats: StatsAggregator,
    /// Parts completed in closed intervals
    part_count: u32,
    /// Parts completed in the open interval
    session_part_count: u32,
    pending_alarms: Vec<String>,
    setup: SetupContext,
}

impl RuntimeSession {
    pub fn new(equipment: Equipment, zone: LocalZone) -> Self {
        Self {
            equipment,
            zone,
            status: Status::Unknown,
            intervals: Vec::new(),
            stats: StatsAggregator::new(),
            part_count: 0,
            session_part_count: 0,
            pending_alarms: Vec::new(),
            setup: SetupContext::default(),
        }
    }

    pub fn equipment(&self) -> &Equipment {
        &self.equipment
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    #[cfg(test)]
    pub fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    /// Parts completed in the session so far, including the open interval
    #[cfg(test)]
    pub fn part_count(&self) -> u32 {
        self.part_count + self.session_part_count
    }

    #[cfg(test)]
    pub fn pending_alarms(&self) -> &[String] {
        &self.pending_alarms
    }

    /// The interval still `Ongoing`, if any
    pub fn open_interval(&self) -> Option<&Interval> {
        self.intervals.last().filter(|i| i.is_open())
    }

    /// Apply one classified event stamped at `at`
    pub fn apply(&mut self, event: LineEvent, at: DateTime<Utc>) -> Result<Applied, SessionError> {
        let at = at.trunc_subsecs(0);
        self.validate_time(at)?;

        let split = self.split_at_shift_boundaries(at);
        let mut applied = match event {
            LineEvent::Status(status) => self.on_status(status, at),
            LineEvent::PartFile(name) => self.on_setup_detail(|ctx| ctx.part_file = Some(name)),
            LineEvent::TechData(name) => self.on_setup_detail(|ctx| ctx.tech_data = Some(name)),
            LineEvent::PartCompleted => self.on_part_completed(),
            LineEvent::Alarm(message) => self.on_alarm(message),
        };
        applied.changed |= split;
        Ok(applied)
    }

    /// Split the open interval at every shift boundary passed by `now`.
    /// Returns whether a split happened.
    pub fn check_shift(&mut self, now: DateTime<Utc>) -> bool {
        self.split_at_shift_boundaries(now.trunc_subsecs(0))
    }

    /// Close the open interval and hand back the session record, then return to the
    /// initial state. Used on shutdown and on permanent source loss. Times earlier than
    /// the open interval's start are clamped to it.
    pub fn finalize(&mut self, at: DateTime<Utc>) -> Option<SessionRecord> {
        let mut at = at.trunc_subsecs(0);
        if let Some(open) = self.open_interval() {
            at = at.max(open.start_time);
        }
        self.split_at_shift_boundaries(at);
        self.close_open_interval(at);
        let record = self.take_record();
        self.reset();
        self.status = Status::Unknown;
        record
    }

    /// Full current state for subscribers
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            equipment_id: self.equipment.id.clone(),
            intervals: self.intervals.clone(),
            avg_cutting_time: self.stats.avg_cutting(),
            avg_idle_time: self.stats.avg_idle(),
        }
    }

    /// Record of the session as it stands
    pub fn record(&self) -> SessionRecord {
        SessionRecord {
            equipment_id: self.equipment.id.clone(),
            display_name: self.equipment.display_name.clone(),
            part_file: self.setup.part_file.clone(),
            tech_data: self.setup.tech_data.clone(),
            total_cutting_duration: self.stats.total_cutting,
            total_idle_duration: self.stats.total_idle,
            cutting_count: self.stats.cutting_count,
            idle_count: self.stats.idle_count,
            avg_cutting_time: self.stats.avg_cutting(),
            avg_idle_time: self.stats.avg_idle(),
            total_part_count: self.part_count,
            intervals: self.intervals.clone(),
        }
    }

    fn on_status(&mut self, status: Status, at: DateTime<Utc>) -> Applied {
        if status == self.status {
            return Applied::unchanged();
        }

        self.close_open_interval(at);

        let closed = if status == Status::Setup {
            let record = self.take_record();
            self.reset();
            record
        } else {
            None
        };

        self.open_interval_at(status, at);
        Applied {
            changed: true,
            closed,
        }
    }

    fn on_setup_detail(&mut self, update: impl FnOnce(&mut SetupContext)) -> Applied {
        if self.status != Status::Setup {
            debug!(equipment = %self.equipment.id, "Ignoring setup detail outside setup");
            return Applied::unchanged();
        }

        update(&mut self.setup);
        if let Some(open) = self.intervals.last_mut().filter(|i| i.is_open()) {
            open.part_file = self.setup.part_file.clone();
            open.tech_data = self.setup.tech_data.clone();
        }
        Applied::changed()
    }

    fn on_part_completed(&mut self) -> Applied {
        if self.status != Status::Cutting {
            return Applied::unchanged();
        }
        let Some(open) = self.intervals.last_mut().filter(|i| i.is_open()) else {
            return Applied::unchanged();
        };

        self.session_part_count += 1;
        open.session_part_count = self.session_part_count;
        open.total_part_count = self.part_count + self.session_part_count;
        Applied::changed()
    }

    fn on_alarm(&mut self, message: String) -> Applied {
        let Some(open) = self.intervals.last_mut().filter(|i| i.is_open()) else {
            debug!(equipment = %self.equipment.id, "Dropping alarm with no open interval");
            return Applied::unchanged();
        };

        open.details.push(message.clone());
        self.pending_alarms.push(message);
        Applied::changed()
    }

    /// Close and reopen the open interval at each shift boundary up to `until`, so no
    /// interval spans two shifts.
    fn split_at_shift_boundaries(&mut self, until: DateTime<Utc>) -> bool {
        let mut split = false;
        while let Some(open) = self.open_interval() {
            let Some(boundary) = shift::next_boundary(open.start_time, &self.zone) else {
                break;
            };
            if boundary > until {
                break;
            }

            let from = open.shift_type;
            let status = self.status;
            self.close_open_interval(boundary);
            self.open_interval_at(status, boundary);
            debug!(
                equipment = %self.equipment.id,
                from = from.as_str(),
                at = %boundary,
                "Shift boundary crossed, splitting interval"
            );
            split = true;
        }
        split
    }

    fn validate_time(&self, at: DateTime<Utc>) -> Result<(), SessionError> {
        match self.open_interval() {
            Some(open) if at < open.start_time => Err(SessionError::InvalidTimestamp {
                at,
                start: open.start_time,
            }),
            _ => Ok(()),
        }
    }

    fn open_interval_at(&mut self, status: Status, at: DateTime<Utc>) {
        self.intervals.push(Interval {
            equipment_id: self.equipment.id.clone(),
            status,
            start_time: at,
            end_time: EndTime::Ongoing,
            total_time: None,
            part_file: self.setup.part_file.clone(),
            tech_data: self.setup.tech_data.clone(),
            session_part_count: 0,
            total_part_count: self.part_count,
            details: Vec::new(),
            shift_type: shift::classify(at, &self.zone),
        });
        self.status = status;
    }

    fn close_open_interval(&mut self, at: DateTime<Utc>) {
        let Some(open) = self.intervals.last_mut().filter(|i| i.is_open()) else {
            return;
        };

        let duration = at.signed_duration_since(open.start_time).max(TimeDelta::zero());
        self.stats.record(open.status, duration);
        self.part_count += self.session_part_count;

        open.end_time = EndTime::At(at);
        open.total_time = Some(duration);
        open.session_part_count = self.session_part_count;
        open.total_part_count = self.part_count;
        open.details = std::mem::take(&mut self.pending_alarms);

        self.session_part_count = 0;
    }

    fn take_record(&self) -> Option<SessionRecord> {
        if self.intervals.is_empty() {
            None
        } else {
            Some(self.record())
        }
    }

    fn reset(&mut self) {
        self.intervals.clear();
        self.stats.reset();
        self.part_count = 0;
        self.session_part_count = 0;
        self.pending_alarms.clear();
        self.setup = SetupContext::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn utc_zone() -> LocalZone {
        LocalZone::Fixed(FixedOffset::east_opt(0).unwrap())
    }

    fn session() -> RuntimeSession {
        RuntimeSession::new(Equipment::new("ipgD", "Laser D"), utc_zone())
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 1, h, m, s).unwrap()
    }

    fn status(s: Status) -> LineEvent {
        LineEvent::Status(s)
    }

    fn assert_contiguous(session: &RuntimeSession) {
        let intervals = session.intervals();
        for pair in intervals.windows(2) {
            assert_eq!(pair[0].end_time, EndTime::At(pair[1].start_time));
        }
        let open = intervals.iter().filter(|i| i.is_open()).count();
        assert!(open <= 1);
        if open == 1 {
            assert!(intervals.last().unwrap().is_open());
        }
    }

    #[test]
    fn test_first_status_opens_interval() {
        let mut s = session();
        let applied = s.apply(status(Status::Cutting), at(8, 0, 0)).unwrap();
        assert!(applied.changed);
        assert!(applied.closed.is_none());
        assert_eq!(s.status(), Status::Cutting);
        assert_eq!(s.intervals().len(), 1);
        assert_eq!(s.open_interval().unwrap().shift_type, crate::logwatch::ShiftType::Day);
    }

    #[test]
    fn test_repeated_status_is_noop() {
        let mut s = session();
        s.apply(status(Status::Cutting), at(8, 0, 0)).unwrap();
        let applied = s.apply(status(Status::Cutting), at(8, 1, 0)).unwrap();
        assert!(!applied.changed);
        assert_eq!(s.intervals().len(), 1);

        s.apply(status(Status::Setup), at(8, 2, 0)).unwrap();
        let applied = s.apply(status(Status::Setup), at(8, 3, 0)).unwrap();
        assert!(!applied.changed);
        assert!(applied.closed.is_none());
        assert_eq!(s.intervals().len(), 1);
    }

    #[test]
    fn test_status_change_closes_interval() {
        let mut s = session();
        s.apply(status(Status::Cutting), at(8, 0, 0)).unwrap();
        s.apply(status(Status::Idle), at(8, 10, 0)).unwrap();

        let closed = &s.intervals()[0];
        assert_eq!(closed.end_time, EndTime::At(at(8, 10, 0)));
        assert_eq!(closed.total_time, Some(TimeDelta::minutes(10)));
        assert_eq!(s.stats().cutting_count, 1);
        assert_eq!(s.stats().avg_cutting(), TimeDelta::minutes(10));
        assert_eq!(s.stats().idle_count, 0);
        assert_eq!(s.stats().avg_idle(), TimeDelta::zero());
        assert_contiguous(&s);
    }

    #[test]
    fn test_ledger_sums_to_session_span() {
        let mut s = session();
        let steps = [
            (Status::Setup, at(7, 0, 0)),
            (Status::Cutting, at(7, 3, 10)),
            (Status::Idle, at(7, 20, 0)),
            (Status::Cutting, at(7, 21, 5)),
            (Status::Idle, at(7, 45, 59)),
        ];
        for (st, t) in steps {
            s.apply(status(st), t).unwrap();
            assert_contiguous(&s);
        }

        let now = at(8, 0, 0);
        let total = s
            .intervals()
            .iter()
            .fold(TimeDelta::zero(), |acc, i| acc + i.elapsed(now));
        assert_eq!(total, now - at(7, 0, 0));
    }

    #[test]
    fn test_part_counts_accumulate() {
        let mut s = session();
        s.apply(status(Status::Cutting), at(8, 0, 0)).unwrap();
        s.apply(LineEvent::PartCompleted, at(8, 1, 0)).unwrap();
        s.apply(LineEvent::PartCompleted, at(8, 2, 0)).unwrap();
        assert_eq!(s.open_interval().unwrap().session_part_count, 2);

        s.apply(status(Status::Idle), at(8, 3, 0)).unwrap();
        s.apply(status(Status::Cutting), at(8, 4, 0)).unwrap();
        s.apply(LineEvent::PartCompleted, at(8, 5, 0)).unwrap();
        s.apply(status(Status::Idle), at(8, 6, 0)).unwrap();

        let mut running = 0;
        for interval in s.intervals().iter().filter(|i| !i.is_open()) {
            running += interval.session_part_count;
            assert_eq!(interval.total_part_count, running);
        }
        assert_eq!(s.part_count(), 3);
    }

    #[test]
    fn test_part_completed_ignored_outside_cutting() {
        let mut s = session();
        s.apply(status(Status::Idle), at(8, 0, 0)).unwrap();
        let applied = s.apply(LineEvent::PartCompleted, at(8, 1, 0)).unwrap();
        assert!(!applied.changed);
        assert_eq!(s.part_count(), 0);
    }

    #[test]
    fn test_setup_details_carry_forward() {
        let mut s = session();
        s.apply(status(Status::Setup), at(8, 0, 0)).unwrap();
        s.apply(LineEvent::PartFile("PART1.nc".into()), at(8, 0, 0)).unwrap();
        s.apply(LineEvent::TechData("MS 6mm".into()), at(8, 0, 5)).unwrap();
        s.apply(status(Status::Cutting), at(8, 1, 0)).unwrap();

        let setup = &s.intervals()[0];
        assert_eq!(setup.part_file.as_deref(), Some("PART1.nc"));
        assert_eq!(setup.tech_data.as_deref(), Some("MS 6mm"));
        let cutting = s.open_interval().unwrap();
        assert_eq!(cutting.part_file.as_deref(), Some("PART1.nc"));
        assert_eq!(cutting.tech_data.as_deref(), Some("MS 6mm"));

        // Outside setup the context is frozen
        let applied = s.apply(LineEvent::PartFile("OTHER.nc".into()), at(8, 2, 0)).unwrap();
        assert!(!applied.changed);
        assert_eq!(s.record().part_file.as_deref(), Some("PART1.nc"));
    }

    #[test]
    fn test_alarms_attach_to_closing_interval() {
        let mut s = session();
        s.apply(status(Status::Cutting), at(8, 0, 0)).unwrap();
        s.apply(LineEvent::Alarm("Gas pressure low".into()), at(8, 0, 30)).unwrap();
        assert_eq!(s.pending_alarms(), ["Gas pressure low".to_string()]);
        assert_eq!(s.open_interval().unwrap().details, vec!["Gas pressure low".to_string()]);

        s.apply(status(Status::Idle), at(8, 1, 0)).unwrap();
        assert_eq!(s.intervals()[0].details, vec!["Gas pressure low".to_string()]);
        assert!(s.pending_alarms().is_empty());
        assert!(s.open_interval().unwrap().details.is_empty());
    }

    #[test]
    fn test_alarm_without_interval_is_dropped() {
        let mut s = session();
        let applied = s.apply(LineEvent::Alarm("boot".into()), at(8, 0, 0)).unwrap();
        assert!(!applied.changed);
        assert!(s.pending_alarms().is_empty());
    }

    #[test]
    fn test_setup_while_cutting_closes_session() {
        let mut s = session();
        s.apply(status(Status::Setup), at(8, 0, 0)).unwrap();
        s.apply(LineEvent::PartFile("A.nc".into()), at(8, 0, 0)).unwrap();
        s.apply(status(Status::Cutting), at(8, 5, 0)).unwrap();
        s.apply(LineEvent::PartCompleted, at(8, 6, 0)).unwrap();
        s.apply(LineEvent::Alarm("Nozzle collision".into()), at(8, 7, 0)).unwrap();

        let applied = s.apply(status(Status::Setup), at(8, 10, 0)).unwrap();
        assert!(applied.changed);
        let record = applied.closed.expect("session record");

        let cutting = record.intervals.last().unwrap();
        assert_eq!(cutting.status, Status::Cutting);
        assert_eq!(cutting.details, vec!["Nozzle collision".to_string()]);
        assert_eq!(cutting.end_time, EndTime::At(at(8, 10, 0)));
        assert_eq!(record.cutting_count, 1);
        assert_eq!(record.total_part_count, 1);
        assert_eq!(record.part_file.as_deref(), Some("A.nc"));

        // Fresh session
        assert_eq!(s.intervals().len(), 1);
        assert_eq!(s.status(), Status::Setup);
        assert_eq!(s.stats(), &StatsAggregator::default());
        assert_eq!(s.part_count(), 0);
        assert!(s.pending_alarms().is_empty());
        assert_eq!(s.open_interval().unwrap().part_file, None);
    }

    #[test]
    fn test_first_setup_has_nothing_to_close() {
        let mut s = session();
        let applied = s.apply(status(Status::Setup), at(8, 0, 0)).unwrap();
        assert!(applied.closed.is_none());
    }

    #[test]
    fn test_shift_boundary_splits_interval() {
        let mut s = session();
        s.apply(status(Status::Cutting), at(16, 0, 0)).unwrap();
        s.apply(LineEvent::PartCompleted, at(16, 10, 0)).unwrap();

        assert!(!s.check_shift(at(16, 29, 59)));
        assert!(s.check_shift(at(16, 30, 0)));

        assert_eq!(s.intervals().len(), 2);
        let first = &s.intervals()[0];
        assert_eq!(first.status, Status::Cutting);
        assert_eq!(first.end_time, EndTime::At(at(16, 30, 0)));
        assert_eq!(first.total_part_count, 1);

        let second = s.open_interval().unwrap();
        assert_eq!(second.status, Status::Cutting);
        assert_eq!(second.shift_type, crate::logwatch::ShiftType::ShiftChange);
        assert_eq!(second.total_part_count, 1);
        assert_eq!(s.status(), Status::Cutting);
        assert_contiguous(&s);

        // Same shift again: nothing to do
        assert!(!s.check_shift(at(16, 45, 0)));
    }

    #[test]
    fn test_event_after_boundary_splits_first() {
        let mut s = session();
        s.apply(status(Status::Cutting), at(15, 0, 0)).unwrap();
        s.apply(status(Status::Idle), at(17, 0, 0)).unwrap();

        let shifts: Vec<(Status, crate::logwatch::ShiftType)> = s
            .intervals()
            .iter()
            .map(|i| (i.status, i.shift_type))
            .collect();
        assert_eq!(
            shifts,
            vec![
                (Status::Cutting, crate::logwatch::ShiftType::Day),
                (Status::Cutting, crate::logwatch::ShiftType::ShiftChange),
                (Status::Idle, crate::logwatch::ShiftType::ShiftChange),
            ]
        );
        assert_eq!(s.intervals()[0].end_time, EndTime::At(at(16, 30, 0)));
        assert_eq!(s.intervals()[1].total_time, Some(TimeDelta::minutes(30)));
        assert_contiguous(&s);
    }

    #[test]
    fn test_overnight_gap_splits_every_shift() {
        let mut s = session();
        s.apply(status(Status::Idle), at(19, 0, 0)).unwrap();
        let next_morning = Utc.with_ymd_and_hms(2024, 10, 2, 7, 0, 0).unwrap();
        let applied = s
            .apply(LineEvent::Alarm("Chiller fault".into()), next_morning)
            .unwrap();
        assert!(applied.changed);

        let intervals = s.intervals();
        assert_eq!(intervals.len(), 3);
        assert_eq!(intervals[0].shift_type, crate::logwatch::ShiftType::ShiftChange);
        assert_eq!(intervals[1].shift_type, crate::logwatch::ShiftType::Night);
        assert_eq!(
            intervals[1].end_time,
            EndTime::At(Utc.with_ymd_and_hms(2024, 10, 2, 6, 0, 0).unwrap())
        );
        assert_eq!(intervals[2].shift_type, crate::logwatch::ShiftType::Day);
        assert_eq!(intervals[2].details, vec!["Chiller fault".to_string()]);
        assert!(intervals.iter().all(|i| i.status == Status::Idle));
        assert_contiguous(&s);
    }

    #[test]
    fn test_finalize_splits_before_closing() {
        let mut s = session();
        s.apply(status(Status::Cutting), at(16, 0, 0)).unwrap();
        let record = s.finalize(at(16, 40, 0)).unwrap();
        assert_eq!(record.intervals.len(), 2);
        assert_eq!(record.intervals[1].shift_type, crate::logwatch::ShiftType::ShiftChange);
        assert_eq!(record.intervals[1].end_time, EndTime::At(at(16, 40, 0)));
    }

    #[test]
    fn test_shift_check_without_interval() {
        let mut s = session();
        assert!(!s.check_shift(at(20, 0, 0)));
        assert!(s.intervals().is_empty());
    }

    #[test]
    fn test_out_of_order_time_rejected() {
        let mut s = session();
        s.apply(status(Status::Cutting), at(9, 0, 0)).unwrap();
        let before = s.snapshot();

        let err = s.apply(status(Status::Idle), at(8, 59, 0)).unwrap_err();
        assert_eq!(
            err,
            SessionError::InvalidTimestamp {
                at: at(8, 59, 0),
                start: at(9, 0, 0)
            }
        );
        assert_eq!(s.snapshot(), before);
    }

    #[test]
    fn test_finalize_returns_record_and_resets() {
        let mut s = session();
        s.apply(status(Status::Cutting), at(9, 0, 0)).unwrap();
        s.apply(LineEvent::Alarm("Door open".into()), at(9, 1, 0)).unwrap();

        let record = s.finalize(at(9, 30, 0)).expect("record");
        assert_eq!(record.intervals.len(), 1);
        assert_eq!(record.intervals[0].total_time, Some(TimeDelta::minutes(30)));
        assert_eq!(record.intervals[0].details, vec!["Door open".to_string()]);
        assert_eq!(record.total_cutting_duration, TimeDelta::minutes(30));

        assert_eq!(s.status(), Status::Unknown);
        assert!(s.intervals().is_empty());
        assert!(s.finalize(at(9, 31, 0)).is_none());
    }

    #[test]
    fn test_finalize_clamps_to_interval_start() {
        let mut s = session();
        s.apply(status(Status::Idle), at(9, 0, 0)).unwrap();
        let record = s.finalize(at(8, 0, 0)).unwrap();
        assert_eq!(record.intervals[0].total_time, Some(TimeDelta::zero()));
        assert_eq!(record.intervals[0].end_time, EndTime::At(at(9, 0, 0)));
    }

    #[test]
    fn test_subsecond_times_are_truncated() {
        let mut s = session();
        let t = at(9, 0, 0) + TimeDelta::milliseconds(750);
        s.apply(status(Status::Idle), t).unwrap();
        assert_eq!(s.intervals()[0].start_time, at(9, 0, 0));
    }
}
