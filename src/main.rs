use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use laser_runtime::app::Config;
use laser_runtime::logwatch::clock::DEFAULT_TIMESTAMP_FORMAT;
use laser_runtime::logwatch::{Equipment, EventClock, TimestampMode};
use laser_runtime::monitor::{replay_file, Fleet};
use laser_runtime::relay::{ConnectionState, RelayClient};

/// Laser Runtime - equipment runtime tracking from controller logs
#[derive(Parser)]
#[command(name = "laser-runtime")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Config file (defaults to ~/.config/laser-runtime/config.toml)
    #[arg(short, long, env = "LASER_RUNTIME_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor every configured equipment unit (default)
    Run,
    /// Feed an existing log through the session machine and print the records
    Replay {
        /// Log file to replay
        #[arg(long)]
        log: PathBuf,
        /// Equipment id
        #[arg(long)]
        id: String,
        /// Display name (defaults to the id)
        #[arg(long)]
        name: Option<String>,
        /// Where event times come from
        #[arg(long, value_enum, default_value = "log-line")]
        timestamps: TimestampArg,
    },
    /// Show the config path and the resolved configuration
    Config,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum TimestampArg {
    WallClock,
    LogLine,
}

impl From<TimestampArg> for TimestampMode {
    fn from(arg: TimestampArg) -> Self {
        match arg {
            TimestampArg::WallClock => TimestampMode::WallClock,
            TimestampArg::LogLine => TimestampMode::LogLine,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    // ログ初期化
    let level = cli.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    init_logging(&level)?;

    match cli.command {
        Some(Commands::Replay {
            log,
            id,
            name,
            timestamps,
        }) => run_replay(&config, log, id, name, timestamps.into()),
        Some(Commands::Config) => show_config(&cli.config, &config),
        Some(Commands::Run) | None => run_monitor(config).await,
    }
}

fn init_logging(level: &str) -> Result<()> {
    let log_dir = directories::ProjectDirs::from("", "", "laser-runtime")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("laser-runtime"));

    std::fs::create_dir_all(&log_dir)?;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("laser-runtime.log"))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(log_file),
        )
        .init();

    info!("Laser Runtime starting");
    Ok(())
}

async fn run_monitor(config: Config) -> Result<()> {
    config.validate()?;
    let persister = config.persist.build()?;

    // Relay outlives the workers so their final snapshots still go out
    let relay_cancel = CancellationToken::new();
    let (relay, relay_task) = if config.relay.enabled {
        let (client, handle) = RelayClient::new(config.relay.client_config());
        (Some(handle), Some(client.spawn(relay_cancel.clone())))
    } else {
        info!("Relay disabled, snapshots are not forwarded");
        (None, None)
    };

    let cancel = CancellationToken::new();
    let fleet = Fleet::start(&config, persister, relay.as_ref(), cancel.clone())?;

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, finalizing sessions");
                signal_cancel.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    let result = fleet.join().await;

    if let Some(handle) = &relay {
        let state = handle.state();
        if state != ConnectionState::Connected {
            warn!("Relay is {:?} at shutdown, final snapshots may not be delivered", state);
        }
    }
    relay_cancel.cancel();
    if let Some(task) = relay_task {
        if let Err(e) = task.await {
            error!("Relay task failed: {}", e);
        }
    }

    result.context("Monitoring stopped because a session could not be persisted")?;
    info!("Laser Runtime stopped");
    Ok(())
}

fn run_replay(
    config: &Config,
    log: PathBuf,
    id: String,
    name: Option<String>,
    timestamps: TimestampMode,
) -> Result<()> {
    let zone = config.shift.zone()?;
    let display_name = name.unwrap_or_else(|| id.clone());
    let clock = EventClock::new(timestamps, DEFAULT_TIMESTAMP_FORMAT, zone);

    let records = replay_file(&log, Equipment::new(id, display_name), clock, zone)
        .with_context(|| format!("Failed to replay {}", log.display()))?;
    info!("Replayed {} session(s) from {}", records.len(), log.display());

    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

fn show_config(explicit: &Option<PathBuf>, config: &Config) -> Result<()> {
    let path = match explicit {
        Some(path) => path.clone(),
        None => Config::config_path()?,
    };
    println!("# {}", path.display());
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
