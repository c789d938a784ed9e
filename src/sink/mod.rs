//! Outbound interfaces: live snapshots and finalized session records

pub mod json;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{PersistError, SinkError};
use crate::logwatch::{SessionRecord, Snapshot};

pub use json::JsonFilePersister;
pub use sqlite::SqlitePersister;

/// Receives the full session state after every mutation
pub trait SnapshotEmitter: Send {
    /// Hand over the latest snapshot. Must not block on network I/O.
    fn push(&mut self, snapshot: &Snapshot) -> Result<(), SinkError>;

    /// Retry anything left undelivered by an earlier push
    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Emitter used when no relay is configured
#[derive(Debug, Default)]
pub struct NullEmitter;

impl SnapshotEmitter for NullEmitter {
    fn push(&mut self, snapshot: &Snapshot) -> Result<(), SinkError> {
        tracing::trace!(
            equipment = %snapshot.equipment_id,
            intervals = snapshot.intervals.len(),
            "Snapshot discarded (relay disabled)"
        );
        Ok(())
    }
}

/// Durably stores a closed session. Called from a blocking thread.
pub trait SessionPersister: Send + Sync {
    /// Write the record and return a description of where it went
    fn save(&self, record: &SessionRecord) -> Result<String, PersistError>;
}

/// Retry policy for persisting
#[derive(Debug, Clone, Copy)]
pub struct PersistPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for PersistPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Persist a record off the async runtime, retrying per `policy`.
///
/// When every attempt fails the record is logged in full before the error is
/// returned, so the session can still be recovered by hand.
pub async fn persist_with_retry(
    persister: Arc<dyn SessionPersister>,
    record: SessionRecord,
    policy: PersistPolicy,
) -> Result<String, PersistError> {
    let record = Arc::new(record);
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let task_persister = Arc::clone(&persister);
        let task_record = Arc::clone(&record);
        let result = tokio::task::spawn_blocking(move || task_persister.save(&task_record))
            .await
            .unwrap_or_else(|e| Err(PersistError::Task(e.to_string())));

        match result {
            Ok(location) => {
                info!(
                    equipment = %record.equipment_id,
                    intervals = record.intervals.len(),
                    "Session persisted to {}",
                    location
                );
                return Ok(location);
            }
            Err(e) if attempt < max_attempts => {
                warn!(
                    equipment = %record.equipment_id,
                    "Persist attempt {}/{} failed: {}",
                    attempt,
                    max_attempts,
                    e
                );
                tokio::time::sleep(policy.retry_delay).await;
            }
            Err(e) => {
                let dump = serde_json::to_string(&*record).unwrap_or_default();
                error!(
                    equipment = %record.equipment_id,
                    record = %dump,
                    "Session could not be persisted: {}",
                    e
                );
                return Err(PersistError::Exhausted {
                    equipment_id: record.equipment_id.clone(),
                    attempts: attempt,
                    last: Box::new(e),
                });
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryPersister;
    use super::*;
    use crate::logwatch::{Equipment, LineEvent, LocalZone, RuntimeSession, Status};

    fn record() -> SessionRecord {
        let mut session = RuntimeSession::new(Equipment::new("ipgD", "Laser D"), LocalZone::System);
        session
            .apply(LineEvent::Status(Status::Idle), chrono::Utc::now())
            .unwrap();
        session.finalize(chrono::Utc::now()).unwrap()
    }

    fn quick_policy(max_attempts: u32) -> PersistPolicy {
        PersistPolicy {
            max_attempts,
            retry_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let persister = Arc::new(MemoryPersister::failing(2));
        let location = persist_with_retry(persister.clone(), record(), quick_policy(3))
            .await
            .unwrap();
        assert_eq!(location, "memory");
        assert_eq!(persister.records().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_is_reported() {
        let persister = Arc::new(MemoryPersister::failing(5));
        let err = persist_with_retry(persister.clone(), record(), quick_policy(2))
            .await
            .unwrap_err();
        match err {
            PersistError::Exhausted {
                equipment_id,
                attempts,
                ..
            } => {
                assert_eq!(equipment_id, "ipgD");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(persister.records().is_empty());
    }
}
