//! Per-equipment monitoring loop
//!
//! Each worker exclusively owns its reader, clock and session. It talks to the
//! outside only through its snapshot emitter and the shared persister.

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{MonitorError, SinkError, SourceError};
use crate::logwatch::{classify, EventClock, LogReader, RuntimeSession};
use crate::sink::{persist_with_retry, NullEmitter, PersistPolicy, SessionPersister, SnapshotEmitter};

/// Outcome of one blocking read, handed back together with the reader
type ReadTask = JoinHandle<(LogReader, Result<Vec<String>, SourceError>)>;

/// Tails one equipment log and keeps its session current
pub struct EquipmentMonitor {
    source: PathBuf,
    /// Present while no read is in flight
    reader: Option<LogReader>,
    pending_read: Option<ReadTask>,
    read_timeout: Duration,
    session: RuntimeSession,
    clock: EventClock,
    emitter: Box<dyn SnapshotEmitter>,
    persister: Arc<dyn SessionPersister>,
    policy: PersistPolicy,
    tick: Duration,
}

impl EquipmentMonitor {
    pub fn new(
        reader: LogReader,
        session: RuntimeSession,
        clock: EventClock,
        emitter: Box<dyn SnapshotEmitter>,
        persister: Arc<dyn SessionPersister>,
    ) -> Self {
        Self {
            source: reader.path().to_path_buf(),
            reader: Some(reader),
            pending_read: None,
            read_timeout: Duration::from_secs(10),
            session,
            clock,
            emitter,
            persister,
            policy: PersistPolicy::default(),
            tick: Duration::from_secs(1),
        }
    }

    pub fn with_policy(mut self, policy: PersistPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Longest a tick waits on the log source before moving on
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn equipment_id(&self) -> &str {
        &self.session.equipment().id
    }

    pub fn session(&self) -> &RuntimeSession {
        &self.session
    }

    /// Run until cancelled, then force-close the session.
    ///
    /// Returns an error only when a session record could not be persisted.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), MonitorError> {
        info!(
            equipment = %self.equipment_id(),
            "Monitoring {}",
            self.source.display()
        );

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.step().await {
                        error!(equipment = %self.equipment_id(), "Worker stopping: {}", e);
                        return Err(e);
                    }
                }
                _ = cancel.cancelled() => {
                    info!(equipment = %self.equipment_id(), "Worker shutting down");
                    break;
                }
            }
        }

        self.finalize().await
    }

    /// One poll cycle: read, apply, push, shift check
    pub async fn step(&mut self) -> Result<(), MonitorError> {
        match self.read_source().await? {
            None => {}
            Some(Ok(lines)) => {
                for line in lines {
                    self.process_line(&line).await?;
                }
            }
            Some(Err(SourceError::Unavailable { path, attempts })) => {
                warn!(
                    equipment = %self.equipment_id(),
                    "Log {} unavailable after {} attempts, closing session",
                    path.display(),
                    attempts
                );
                self.finalize().await?;
            }
            Some(Err(e)) => {
                warn!(equipment = %self.equipment_id(), "Log read failed: {}", e);
            }
        }

        if let Some(now) = self.clock.now() {
            if self.session.check_shift(now) {
                self.push();
            }
        }

        if let Err(e) = self.emitter.flush() {
            self.on_emit_error(e);
        }
        Ok(())
    }

    /// Close the session now and persist it
    pub async fn finalize(&mut self) -> Result<(), MonitorError> {
        let at = self.clock.now().unwrap_or_else(Utc::now);
        if let Some(record) = self.session.finalize(at) {
            let persister = Arc::clone(&self.persister);
            persist_with_retry(persister, record, self.policy).await?;
        }
        self.push();
        Ok(())
    }

    /// Poll the log on the blocking pool. File access may hang on a network share,
    /// so a read still running after `read_timeout` is left in flight and picked up
    /// again on the next tick. `None` means no result this tick.
    async fn read_source(
        &mut self,
    ) -> Result<Option<Result<Vec<String>, SourceError>>, MonitorError> {
        let mut task = match (self.pending_read.take(), self.reader.take()) {
            (Some(task), _) => task,
            (None, Some(mut reader)) => tokio::task::spawn_blocking(move || {
                let result = reader.poll();
                (reader, result)
            }),
            (None, None) => return Err(MonitorError::ReaderLost),
        };

        match tokio::time::timeout(self.read_timeout, &mut task).await {
            Ok(Ok((reader, result))) => {
                self.reader = Some(reader);
                Ok(Some(result))
            }
            Ok(Err(e)) => {
                error!(equipment = %self.equipment_id(), "Log reader task failed: {}", e);
                Err(MonitorError::ReaderLost)
            }
            Err(_) => {
                warn!(
                    equipment = %self.equipment_id(),
                    "Read of {} still blocked after {:?}",
                    self.source.display(),
                    self.read_timeout
                );
                self.pending_read = Some(task);
                Ok(None)
            }
        }
    }

    async fn process_line(&mut self, line: &str) -> Result<(), MonitorError> {
        let events = classify(line);
        if events.is_empty() {
            return Ok(());
        }

        let at = match self.clock.stamp(line) {
            Ok(at) => at,
            Err(e) => {
                warn!(equipment = %self.equipment_id(), "Dropping line: {}", e);
                return Ok(());
            }
        };

        for event in events {
            let kind = event.kind();
            match self.session.apply(event, at) {
                Ok(applied) => {
                    if let Some(record) = applied.closed {
                        let persister = Arc::clone(&self.persister);
                        persist_with_retry(persister, record, self.policy).await?;
                    }
                    if applied.changed {
                        self.push();
                    }
                }
                Err(e) => {
                    warn!(equipment = %self.equipment_id(), event = kind, "Event rejected: {}", e);
                }
            }
        }
        Ok(())
    }

    fn push(&mut self) {
        let snapshot = self.session.snapshot();
        if let Err(e) = self.emitter.push(&snapshot) {
            self.on_emit_error(e);
        }
    }

    fn on_emit_error(&mut self, e: SinkError) {
        match e {
            SinkError::Closed => {
                warn!(
                    equipment = %self.equipment_id(),
                    "Relay stopped, further snapshots are discarded"
                );
                self.emitter = Box::new(NullEmitter);
            }
            other => warn!(equipment = %self.equipment_id(), "Snapshot push failed: {}", other),
        }
    }
}
