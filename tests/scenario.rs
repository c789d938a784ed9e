use chrono::{TimeZone, Utc};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use laser_runtime::error::SinkError;
use laser_runtime::logwatch::clock::DEFAULT_TIMESTAMP_FORMAT;
use laser_runtime::logwatch::{
    classify, Equipment, EventClock, LocalZone, LogReader, ReaderConfig, RuntimeSession,
    SessionRecord, Snapshot, Status, TimestampMode,
};
use laser_runtime::monitor::EquipmentMonitor;
use laser_runtime::relay::{RelayClient, RelayClientConfig, RelayMessage};
use laser_runtime::sink::{JsonFilePersister, SnapshotEmitter};

const PART1_LOG: &[&str] = &[
    "2024-10-01 07:00:00.120|Info|Downloading Part Program C:\\Jobs\\Customer\\PART1.nc",
    "2024-10-01 07:00:04.500|Info|Downloading TechData Recipe 'MS_10mm_N2' from server",
    "2024-10-01 07:03:10.000|Info|Button Pressed|Cycle Start",
    "2024-10-01 07:09:45.000|Info|Nesting|Validating full cutting area",
    "2024-10-01 07:09:50.000|Error|System Alarm|Gas pressure low ",
    "2024-10-01 07:12:00.000|Info|Process State|Total processing time 00:08:50",
];

#[derive(Clone, Default)]
struct CollectingEmitter {
    snapshots: Arc<Mutex<Vec<Snapshot>>>,
}

impl SnapshotEmitter for CollectingEmitter {
    fn push(&mut self, snapshot: &Snapshot) -> Result<(), SinkError> {
        self.snapshots.lock().unwrap().push(snapshot.clone());
        Ok(())
    }
}

fn utc_zone() -> LocalZone {
    LocalZone::parse_offset("+00:00").unwrap()
}

fn write_log(path: &std::path::Path, lines: &[&str]) {
    let mut file = std::fs::File::create(path).unwrap();
    for line in lines {
        writeln!(file, "{}", line).unwrap();
    }
}

#[test]
fn part1_scenario_builds_expected_ledger() {
    let zone = utc_zone();
    let mut clock = EventClock::new(TimestampMode::LogLine, DEFAULT_TIMESTAMP_FORMAT, zone);
    let mut session = RuntimeSession::new(Equipment::new("ipgD", "a3a1R000002CC6JQAW"), zone);

    for line in PART1_LOG {
        let at = clock.stamp(line).unwrap();
        for event in classify(line) {
            session.apply(event, at).unwrap();
        }
    }

    let intervals = session.intervals();
    assert_eq!(intervals.len(), 3);

    let setup = &intervals[0];
    assert_eq!(setup.status, Status::Setup);
    assert_eq!(setup.part_file.as_deref(), Some("PART1.nc"));
    assert_eq!(setup.tech_data.as_deref(), Some("MS_10mm_N2"));
    assert_eq!(setup.total_time, Some(chrono::TimeDelta::seconds(190)));

    let cutting = &intervals[1];
    assert_eq!(cutting.status, Status::Cutting);
    assert_eq!(cutting.session_part_count, 1);
    assert_eq!(cutting.total_part_count, 1);
    assert_eq!(cutting.details, vec!["Gas pressure low".to_string()]);
    assert_eq!(
        cutting.end_time.as_time(),
        Some(Utc.with_ymd_and_hms(2024, 10, 1, 7, 12, 0).unwrap())
    );

    let idle = &intervals[2];
    assert_eq!(idle.status, Status::Idle);
    assert!(idle.is_open());
    assert_eq!(idle.part_file.as_deref(), Some("PART1.nc"));

    let snapshot = session.snapshot();
    assert_eq!(snapshot.avg_cutting_time, chrono::TimeDelta::seconds(530));
    assert_eq!(snapshot.avg_idle_time, chrono::TimeDelta::zero());
}

#[tokio::test]
async fn worker_persists_json_record_on_shutdown() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("ipgD.log");
    write_log(&log, PART1_LOG);
    let out = dir.path().join("finalized");

    let zone = utc_zone();
    let emitter = CollectingEmitter::default();
    let monitor = EquipmentMonitor::new(
        LogReader::new(
            &log,
            ReaderConfig {
                start_from_beginning: true,
                ..ReaderConfig::default()
            },
        ),
        RuntimeSession::new(Equipment::new("ipgD", "a3a1R000002CC6JQAW"), zone),
        EventClock::new(TimestampMode::LogLine, DEFAULT_TIMESTAMP_FORMAT, zone),
        Box::new(emitter.clone()),
        Arc::new(JsonFilePersister::new(&out)),
    )
    .with_tick(Duration::from_millis(10));

    let cancel = CancellationToken::new();
    let task = tokio::spawn(monitor.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    let path = out.join("finalized_runtime_ipgD_20241001T070000Z.json");
    let record: SessionRecord =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(record.display_name, "a3a1R000002CC6JQAW");
    assert_eq!(record.part_file.as_deref(), Some("PART1.nc"));
    assert_eq!(record.total_part_count, 1);
    assert_eq!(record.cutting_count, 1);
    assert_eq!(record.idle_count, 1);
    assert_eq!(record.intervals.len(), 3);
    assert!(record.intervals.iter().all(|i| !i.is_open()));

    let snapshots = emitter.snapshots.lock().unwrap();
    assert!(snapshots.iter().any(|s| s.intervals.len() == 3));
}

#[tokio::test]
async fn worker_snapshots_reach_relay() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    let relay_cancel = CancellationToken::new();
    let (client, handle) = RelayClient::new(RelayClientConfig {
        address,
        initial_backoff: Duration::from_millis(20),
        ..RelayClientConfig::default()
    });
    let relay_task = client.spawn(relay_cancel.clone());

    let dir = tempdir().unwrap();
    let log = dir.path().join("ipgD.log");
    write_log(&log, &PART1_LOG[..3]);

    let zone = utc_zone();
    let monitor = EquipmentMonitor::new(
        LogReader::new(
            &log,
            ReaderConfig {
                start_from_beginning: true,
                ..ReaderConfig::default()
            },
        ),
        RuntimeSession::new(Equipment::new("ipgD", "Laser D"), zone),
        EventClock::new(TimestampMode::LogLine, DEFAULT_TIMESTAMP_FORMAT, zone),
        Box::new(handle.emitter()),
        Arc::new(JsonFilePersister::new(dir.path().join("out"))),
    )
    .with_tick(Duration::from_millis(10));

    let (mut stream, _) = listener.accept().await.unwrap();
    let cancel = CancellationToken::new();
    let worker = tokio::spawn(monitor.run(cancel.clone()));

    // Read updates until the cutting interval shows up
    let snapshot = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let mut len = [0u8; 4];
            stream.read_exact(&mut len).await.unwrap();
            let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
            stream.read_exact(&mut body).await.unwrap();
            if let RelayMessage::RuntimeUpdate(snapshot) = serde_json::from_slice(&body).unwrap() {
                if snapshot.intervals.len() == 2 {
                    return snapshot;
                }
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(snapshot.equipment_id, "ipgD");
    assert_eq!(snapshot.intervals[1].status, Status::Cutting);
    assert!(snapshot.intervals[1].is_open());

    cancel.cancel();
    worker.await.unwrap().unwrap();
    relay_cancel.cancel();
    relay_task.await.unwrap();
}
