//! Offline replay of an existing log through the session machine

use chrono::Utc;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::error::SourceError;
use crate::logwatch::{
    classify, Equipment, EventClock, LocalZone, LogReader, ReaderConfig, RuntimeSession,
    SessionRecord,
};

/// Feed every line of `path` through a fresh session.
///
/// Returns the records of all sessions closed along the way, followed by the final
/// session closed at the last observed time.
pub fn replay_file(
    path: &Path,
    equipment: Equipment,
    mut clock: EventClock,
    zone: LocalZone,
) -> Result<Vec<SessionRecord>, SourceError> {
    let mut reader = LogReader::new(
        path,
        ReaderConfig {
            max_open_attempts: 1,
            open_retry: Duration::ZERO,
            max_batch_lines: 1024,
            start_from_beginning: true,
        },
    );
    let mut session = RuntimeSession::new(equipment, zone);
    let mut records = Vec::new();

    loop {
        let lines = reader.poll()?;
        if lines.is_empty() {
            break;
        }
        for line in lines {
            let events = classify(&line);
            if events.is_empty() {
                continue;
            }
            let at = match clock.stamp(&line) {
                Ok(at) => at,
                Err(e) => {
                    warn!("Skipping line: {}", e);
                    continue;
                }
            };
            for event in events {
                match session.apply(event, at) {
                    Ok(applied) => records.extend(applied.closed),
                    Err(e) => warn!("Event rejected: {}", e),
                }
            }
        }
    }

    let end = clock.now().unwrap_or_else(Utc::now);
    records.extend(session.finalize(end));
    Ok(records)
}
