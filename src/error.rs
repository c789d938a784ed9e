//! Error types for the monitoring pipeline

use chrono::{DateTime, Utc};
use std::path::PathBuf;

/// Failures reading the equipment log
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The log could not be opened after the configured number of attempts
    #[error("log source {} unavailable after {attempts} attempts", path.display())]
    Unavailable { path: PathBuf, attempts: u32 },

    #[error("failed to read log source: {0}")]
    Io(#[from] std::io::Error),
}

/// Rejected session mutations. State is left unchanged when one of these is returned.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("event time {at} precedes open interval start {start}")]
    InvalidTimestamp {
        at: DateTime<Utc>,
        start: DateTime<Utc>,
    },

    #[error("unparseable timestamp {raw:?}")]
    UnparseableTimestamp { raw: String },
}

/// Snapshot delivery failures
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("relay queue closed")]
    Closed,

    #[error("relay unreachable: {0}")]
    Unreachable(String),

    #[error("failed to encode relay message")]
    Encode(#[from] serde_json::Error),

    #[error("relay connection failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Session persistence failures
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("failed to write session record: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize session record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("session archive error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("persist task failed: {0}")]
    Task(String),

    #[error("gave up persisting session for {equipment_id} after {attempts} attempts")]
    Exhausted {
        equipment_id: String,
        attempts: u32,
        #[source]
        last: Box<PersistError>,
    },
}

/// Fatal errors that stop an equipment worker
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error(transparent)]
    Persist(#[from] PersistError),

    /// The blocking log read panicked and took the reader with it
    #[error("log reader task failed")]
    ReaderLost,
}
