use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::logwatch::clock::DEFAULT_TIMESTAMP_FORMAT;
use crate::logwatch::{Equipment, EventClock, LocalZone, ReaderConfig, TimestampMode};
use crate::relay::RelayClientConfig;
use crate::sink::{JsonFilePersister, PersistPolicy, SessionPersister, SqlitePersister};

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Delay between log polls per equipment
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub shift: ShiftConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub persist: PersistConfig,
    /// Monitored equipment units
    #[serde(default)]
    pub equipment: Vec<EquipmentConfig>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            poll_interval_ms: default_poll_interval_ms(),
            source: SourceConfig::default(),
            shift: ShiftConfig::default(),
            relay: RelayConfig::default(),
            persist: PersistConfig::default(),
            equipment: Vec::new(),
        }
    }
}

/// Log source settings shared by all equipment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_max_open_attempts")]
    pub max_open_attempts: u32,
    #[serde(default = "default_open_retry_secs")]
    pub open_retry_secs: u64,
    #[serde(default = "default_max_batch_lines")]
    pub max_batch_lines: usize,
    /// How long one tick waits on a slow share before moving on
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

fn default_max_open_attempts() -> u32 {
    5
}

fn default_open_retry_secs() -> u64 {
    60
}

fn default_max_batch_lines() -> usize {
    50
}

fn default_read_timeout_secs() -> u64 {
    10
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            max_open_attempts: default_max_open_attempts(),
            open_retry_secs: default_open_retry_secs(),
            max_batch_lines: default_max_batch_lines(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

/// Shift calendar settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShiftConfig {
    /// Fixed UTC offset such as "-05:00"; the system zone is used when unset
    pub utc_offset: Option<String>,
}

impl ShiftConfig {
    pub fn zone(&self) -> Result<LocalZone> {
        match &self.utc_offset {
            None => Ok(LocalZone::System),
            Some(raw) => LocalZone::parse_offset(raw)
                .with_context(|| format!("Invalid shift.utc_offset '{}'", raw)),
        }
    }
}

/// Dashboard relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_relay_enabled")]
    pub enabled: bool,
    #[serde(default = "default_relay_address")]
    pub address: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

fn default_relay_enabled() -> bool {
    true
}

fn default_relay_address() -> String {
    "127.0.0.1:1916".to_string()
}

fn default_queue_capacity() -> usize {
    64
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_secs() -> u64 {
    30
}

fn default_heartbeat_secs() -> u64 {
    15
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: default_relay_enabled(),
            address: default_relay_address(),
            queue_capacity: default_queue_capacity(),
            connect_timeout_secs: default_timeout_secs(),
            write_timeout_secs: default_timeout_secs(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

impl RelayConfig {
    pub fn client_config(&self) -> RelayClientConfig {
        RelayClientConfig {
            address: self.address.clone(),
            queue_capacity: self.queue_capacity,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
        }
    }
}

/// Where finalized sessions go
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistKind {
    #[default]
    Json,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistConfig {
    #[serde(default)]
    pub kind: PersistKind,
    /// Directory for JSON records
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Database file for the SQLite archive
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
    #[serde(default = "default_persist_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "laser-runtime")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("laser-runtime"))
}

fn default_output_dir() -> PathBuf {
    data_dir().join("finalized")
}

fn default_sqlite_path() -> PathBuf {
    data_dir().join("sessions.db")
}

fn default_persist_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            kind: PersistKind::default(),
            output_dir: default_output_dir(),
            sqlite_path: default_sqlite_path(),
            max_attempts: default_persist_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl PersistConfig {
    pub fn policy(&self) -> PersistPolicy {
        PersistPolicy {
            max_attempts: self.max_attempts.max(1),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    /// Build the configured persister
    pub fn build(&self) -> Result<Arc<dyn SessionPersister>> {
        let persister: Arc<dyn SessionPersister> = match self.kind {
            PersistKind::Json => Arc::new(JsonFilePersister::new(&self.output_dir)),
            PersistKind::Sqlite => Arc::new(
                SqlitePersister::open(&self.sqlite_path).with_context(|| {
                    format!("Failed to open archive {}", self.sqlite_path.display())
                })?,
            ),
        };
        Ok(persister)
    }
}

/// One monitored laser
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquipmentConfig {
    /// Stable identifier used in snapshots and file names
    pub id: String,
    /// Name shown downstream; defaults to the id
    #[serde(default)]
    pub display_name: Option<String>,
    /// Controller log to tail
    pub log_path: PathBuf,
    #[serde(default)]
    pub start_from_beginning: bool,
    #[serde(default)]
    pub timestamps: TimestampMode,
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,
}

fn default_timestamp_format() -> String {
    DEFAULT_TIMESTAMP_FORMAT.to_string()
}

impl EquipmentConfig {
    pub fn equipment(&self) -> Equipment {
        let display = self.display_name.clone().unwrap_or_else(|| self.id.clone());
        Equipment::new(self.id.clone(), display)
    }

    pub fn clock(&self, zone: LocalZone) -> EventClock {
        EventClock::new(self.timestamps, self.timestamp_format.clone(), zone)
    }
}

impl Config {
    /// 設定ファイルから読み込み（存在しない場合はデフォルトを作成して保存）
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // 初回起動時はデフォルト設定をファイルに保存
            let config = Self::default();
            if let Err(e) = config.save_to(&config_path) {
                tracing::warn!("Failed to save default config: {}", e);
            }
            Ok(config)
        }
    }

    /// Load from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;
        Ok(config)
    }

    /// 設定ファイルパスを取得
    pub fn config_path() -> Result<PathBuf> {
        // ~/.config/laser-runtime/config.toml を使用
        let base_dirs = directories::BaseDirs::new()
            .ok_or_else(|| anyhow::anyhow!("Failed to determine home directory"))?;
        Ok(base_dirs.home_dir().join(".config/laser-runtime/config.toml"))
    }

    /// 現在の設定をファイルに保存
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.source.read_timeout_secs.max(1))
    }

    pub fn reader_config(&self, equipment: &EquipmentConfig) -> ReaderConfig {
        ReaderConfig {
            max_open_attempts: self.source.max_open_attempts.max(1),
            open_retry: Duration::from_secs(self.source.open_retry_secs),
            max_batch_lines: self.source.max_batch_lines.max(1),
            start_from_beginning: equipment.start_from_beginning,
        }
    }

    /// Check the settings needed to start monitoring
    pub fn validate(&self) -> Result<()> {
        if self.equipment.is_empty() {
            bail!("No equipment configured; add an [[equipment]] section");
        }

        let mut seen = HashSet::new();
        for equipment in &self.equipment {
            if equipment.id.trim().is_empty() {
                bail!("Equipment id must not be empty ({})", equipment.log_path.display());
            }
            if !seen.insert(equipment.id.as_str()) {
                bail!("Duplicate equipment id '{}'", equipment.id);
            }
        }

        self.shift.zone()?;
        Ok(())
    }
}
