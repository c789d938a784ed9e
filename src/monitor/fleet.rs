//! Starts and joins one worker per configured equipment unit

use anyhow::Result;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::worker::EquipmentMonitor;
use crate::app::Config;
use crate::error::MonitorError;
use crate::logwatch::{LogReader, RuntimeSession};
use crate::relay::RelayHandle;
use crate::sink::{NullEmitter, SessionPersister, SnapshotEmitter};

/// Running equipment workers
pub struct Fleet {
    workers: JoinSet<(String, Result<(), MonitorError>)>,
    cancel: CancellationToken,
}

impl Fleet {
    /// Spawn a worker for every `[[equipment]]` entry
    pub fn start(
        config: &Config,
        persister: Arc<dyn SessionPersister>,
        relay: Option<&RelayHandle>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let zone = config.shift.zone()?;
        let mut workers = JoinSet::new();

        for equipment in &config.equipment {
            let reader = LogReader::new(&equipment.log_path, config.reader_config(equipment));
            let session = RuntimeSession::new(equipment.equipment(), zone);
            let emitter: Box<dyn SnapshotEmitter> = match relay {
                Some(handle) => Box::new(handle.emitter()),
                None => Box::new(NullEmitter),
            };
            let monitor = EquipmentMonitor::new(
                reader,
                session,
                equipment.clock(zone),
                emitter,
                Arc::clone(&persister),
            )
            .with_policy(config.persist.policy())
            .with_tick(config.poll_interval())
            .with_read_timeout(config.read_timeout());

            let id = equipment.id.clone();
            let token = cancel.child_token();
            workers.spawn(async move { (id, monitor.run(token).await) });
        }

        info!("Started {} equipment worker(s)", workers.len());
        Ok(Self { workers, cancel })
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker to stop.
    ///
    /// A worker failure cancels the others; the first failure is returned once all
    /// of them have finalized.
    pub async fn join(mut self) -> Result<(), MonitorError> {
        let mut first_error = None;

        while let Some(joined) = self.workers.join_next().await {
            match joined {
                Ok((id, Ok(()))) => info!(equipment = %id, "Worker stopped"),
                Ok((id, Err(e))) => {
                    error!(equipment = %id, "Worker failed: {}", e);
                    self.cancel.cancel();
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!("Worker task panicked: {}", e);
                    self.cancel.cancel();
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
