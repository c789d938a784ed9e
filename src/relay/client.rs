//! Relay connection with reconnect and snapshot replay
//!
//! The client runs as its own task. Workers hand snapshots over a bounded queue and
//! never wait on the network. The task keeps the newest snapshot per equipment and
//! replays all of them whenever a connection is (re)established.

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{RelayMessage, MAX_FRAME_LEN};
use crate::error::SinkError;
use crate::logwatch::Snapshot;
use crate::sink::SnapshotEmitter;

/// Configuration for the relay connection
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// `host:port` of the relay
    pub address: String,
    /// Capacity of the snapshot queue shared by all workers
    pub queue_capacity: usize,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    /// First reconnect delay; doubles per failure up to `max_backoff`
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:1916".to_string(),
            queue_capacity: 64,
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

/// Connection state as seen from outside the task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Exponential backoff between reconnect attempts
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the following one is doubled
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Handle used to feed the relay task
#[derive(Debug, Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<Snapshot>,
    state: watch::Receiver<ConnectionState>,
}

impl RelayHandle {
    /// Emitter for one worker
    pub fn emitter(&self) -> RelayEmitter {
        RelayEmitter {
            tx: self.tx.clone(),
            pending: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    #[cfg(test)]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

/// Per-worker snapshot emitter.
///
/// If the queue is full the newest snapshot is held back and retried on the next
/// push or flush, so the relay always ends up with the latest state.
#[derive(Debug)]
pub struct RelayEmitter {
    tx: mpsc::Sender<Snapshot>,
    pending: Option<Snapshot>,
}

impl RelayEmitter {
    #[cfg(test)]
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

impl SnapshotEmitter for RelayEmitter {
    fn push(&mut self, snapshot: &Snapshot) -> Result<(), SinkError> {
        self.pending = Some(snapshot.clone());
        self.flush()
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        let Some(snapshot) = self.pending.take() else {
            return Ok(());
        };
        match self.tx.try_send(snapshot) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(snapshot)) => {
                debug!(equipment = %snapshot.equipment_id, "Relay queue full, holding snapshot");
                self.pending = Some(snapshot);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SinkError::Closed),
        }
    }
}

/// Relay connection task
pub struct RelayClient {
    config: RelayClientConfig,
    rx: mpsc::Receiver<Snapshot>,
    state_tx: watch::Sender<ConnectionState>,
    stream: Option<TcpStream>,
    /// Latest snapshot per equipment, replayed on reconnect
    latest: BTreeMap<String, Snapshot>,
    backoff: Backoff,
    retry_at: Option<Instant>,
}

impl RelayClient {
    /// Create the client and the handle workers push through
    pub fn new(config: RelayClientConfig) -> (Self, RelayHandle) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let backoff = Backoff::new(config.initial_backoff, config.max_backoff);
        let client = Self {
            config,
            rx,
            state_tx,
            stream: None,
            latest: BTreeMap::new(),
            backoff,
            retry_at: Some(Instant::now()),
        };
        let handle = RelayHandle {
            tx,
            state: state_rx,
        };
        (client, handle)
    }

    /// Start the client as a background task
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(mut self, cancel: CancellationToken) {
        info!("Relay client started for {}", self.config.address);
        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let retry_at = self.retry_at;
            let reconnect = async move {
                match retry_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    // Deliver whatever the workers pushed during shutdown
                    while let Ok(snapshot) = self.rx.try_recv() {
                        self.on_snapshot(snapshot).await;
                    }
                    break;
                }
                received = self.rx.recv() => match received {
                    Some(snapshot) => self.on_snapshot(snapshot).await,
                    None => break,
                },
                _ = reconnect => self.connect().await,
                _ = heartbeat.tick(), if self.stream.is_some() => {
                    if let Err(e) = self.send(&RelayMessage::Heartbeat).await {
                        self.disconnect(&e);
                    }
                }
            }
        }

        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        info!("Relay client stopped");
    }

    async fn on_snapshot(&mut self, snapshot: Snapshot) {
        let message = RelayMessage::RuntimeUpdate(snapshot.clone());
        self.latest.insert(snapshot.equipment_id.clone(), snapshot);

        if self.stream.is_none() {
            return;
        }
        if let Err(e) = self.send(&message).await {
            self.disconnect(&e);
        }
    }

    async fn connect(&mut self) {
        self.retry_at = None;
        self.set_state(ConnectionState::Connecting);

        let attempt = timeout(
            self.config.connect_timeout,
            TcpStream::connect(&self.config.address),
        )
        .await;

        match attempt {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                info!("Connected to relay at {}", self.config.address);
                self.stream = Some(stream);
                self.backoff.reset();
                self.set_state(ConnectionState::Connected);
                if let Err(e) = self.replay().await {
                    self.disconnect(&e);
                }
            }
            Ok(Err(e)) => self.disconnect(&SinkError::Io(e)),
            Err(_) => self.disconnect(&SinkError::Unreachable("connect timed out".to_string())),
        }
    }

    /// Push the latest snapshot of every known equipment
    async fn replay(&mut self) -> Result<(), SinkError> {
        let messages: Vec<RelayMessage> = self
            .latest
            .values()
            .cloned()
            .map(RelayMessage::RuntimeUpdate)
            .collect();
        if !messages.is_empty() {
            debug!("Replaying {} snapshot(s) to relay", messages.len());
        }
        for message in &messages {
            self.send(message).await?;
        }
        Ok(())
    }

    async fn send(&mut self, message: &RelayMessage) -> Result<(), SinkError> {
        let frame = message.to_frame()?;
        if frame.len() - 4 > MAX_FRAME_LEN {
            warn!(
                equipment = message.equipment_id().unwrap_or("-"),
                "Dropping oversized relay frame ({} bytes)",
                frame.len()
            );
            return Ok(());
        }

        let Some(stream) = self.stream.as_mut() else {
            return Err(SinkError::Unreachable("not connected".to_string()));
        };
        let write = async {
            stream.write_all(&frame).await?;
            stream.flush().await
        };
        match timeout(self.config.write_timeout, write).await {
            Ok(result) => result.map_err(SinkError::Io),
            Err(_) => Err(SinkError::Unreachable("write timed out".to_string())),
        }
    }

    fn disconnect(&mut self, reason: &SinkError) {
        let delay = self.backoff.next_delay();
        warn!(
            "Relay {} unavailable ({}), reconnecting in {:?}",
            self.config.address, reason, delay
        );
        self.stream = None;
        self.retry_at = Some(Instant::now() + delay);
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }
}
