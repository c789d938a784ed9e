//! Log-driven runtime tracking
//!
//! This module tails the laser controller log, classifies lines into events and
//! folds them into a per-equipment session of setup/cutting/idle intervals.

pub mod classifier;
pub mod clock;
pub mod reader;
pub mod schema;
pub mod session;
pub mod shift;
pub mod stats;

pub use classifier::{classify, LineEvent};
pub use clock::{EventClock, TimestampMode};
pub use reader::{LogReader, ReaderConfig};
pub use schema::{EndTime, Interval, SessionRecord, ShiftType, Snapshot, Status};
pub use session::{Applied, Equipment, RuntimeSession};
pub use shift::LocalZone;
pub use stats::StatsAggregator;
