//! Running duration totals for cutting and idle intervals

use chrono::TimeDelta;

use super::schema::Status;

/// Totals and counts, updated once per closed interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsAggregator {
    pub total_cutting: TimeDelta,
    pub cutting_count: u32,
    pub total_idle: TimeDelta,
    pub idle_count: u32,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self {
            total_cutting: TimeDelta::zero(),
            cutting_count: 0,
            total_idle: TimeDelta::zero(),
            idle_count: 0,
        }
    }
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for a closed interval. Setup and Unknown spans are not tracked.
    pub fn record(&mut self, status: Status, duration: TimeDelta) {
        match status {
            Status::Cutting => {
                self.total_cutting += duration;
                self.cutting_count += 1;
            }
            Status::Idle => {
                self.total_idle += duration;
                self.idle_count += 1;
            }
            Status::Setup | Status::Unknown => {}
        }
    }

    pub fn avg_cutting(&self) -> TimeDelta {
        average(self.total_cutting, self.cutting_count)
    }

    pub fn avg_idle(&self) -> TimeDelta {
        average(self.total_idle, self.idle_count)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn average(total: TimeDelta, count: u32) -> TimeDelta {
    match i32::try_from(count) {
        Ok(n) if n > 0 => total / n,
        _ => TimeDelta::zero(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_averages_are_zero() {
        let stats = StatsAggregator::new();
        assert_eq!(stats.avg_cutting(), TimeDelta::zero());
        assert_eq!(stats.avg_idle(), TimeDelta::zero());
    }

    #[test]
    fn test_record_and_average() {
        let mut stats = StatsAggregator::new();
        stats.record(Status::Cutting, TimeDelta::seconds(60));
        stats.record(Status::Cutting, TimeDelta::seconds(120));
        stats.record(Status::Idle, TimeDelta::seconds(30));
        stats.record(Status::Setup, TimeDelta::seconds(999));

        assert_eq!(stats.cutting_count, 2);
        assert_eq!(stats.total_cutting, TimeDelta::seconds(180));
        assert_eq!(stats.avg_cutting(), TimeDelta::seconds(90));
        assert_eq!(stats.idle_count, 1);
        assert_eq!(stats.avg_idle(), TimeDelta::seconds(30));
    }

    #[test]
    fn test_reset() {
        let mut stats = StatsAggregator::new();
        stats.record(Status::Idle, TimeDelta::seconds(5));
        stats.reset();
        assert_eq!(stats, StatsAggregator::default());
    }
}
