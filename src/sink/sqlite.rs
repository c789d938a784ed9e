//! SQLite archive of finalized sessions
//!
//! One `sessions` row per record and one `intervals` row per interval, keyed by the
//! parent session row.

use rusqlite::{params, Connection};
use std::path::PathBuf;
use std::sync::Mutex;

use super::SessionPersister;
use crate::error::PersistError;
use crate::logwatch::schema::timedelta_format;
use crate::logwatch::SessionRecord;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    equipment_id TEXT NOT NULL,
    display_name TEXT NOT NULL,
    started_at TEXT,
    part_file TEXT,
    tech_data TEXT,
    total_cutting_duration TEXT NOT NULL,
    total_idle_duration TEXT NOT NULL,
    cutting_count INTEGER NOT NULL,
    idle_count INTEGER NOT NULL,
    avg_cutting_time TEXT NOT NULL,
    avg_idle_time TEXT NOT NULL,
    total_part_count INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS intervals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES sessions(id),
    position INTEGER NOT NULL,
    status TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT,
    total_time TEXT,
    part_file TEXT,
    tech_data TEXT,
    session_part_count INTEGER NOT NULL,
    total_part_count INTEGER NOT NULL,
    details TEXT NOT NULL,
    shift_type TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_equipment ON sessions(equipment_id);
";

/// Appends session records to a SQLite database
pub struct SqlitePersister {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqlitePersister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlitePersister").field("path", &self.path).finish()
    }
}

impl SqlitePersister {
    /// Open (or create) the archive at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn session_count(&self, equipment_id: &str) -> Result<u32, PersistError> {
        let conn = self.lock()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE equipment_id = ?",
            params![equipment_id],
            |row| row.get::<_, u32>(0),
        )?;
        Ok(count)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, PersistError> {
        self.conn
            .lock()
            .map_err(|_| PersistError::Task("archive connection poisoned".to_string()))
    }
}

impl SessionPersister for SqlitePersister {
    fn save(&self, record: &SessionRecord) -> Result<String, PersistError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO sessions (equipment_id, display_name, started_at, part_file, tech_data,
                total_cutting_duration, total_idle_duration, cutting_count, idle_count,
                avg_cutting_time, avg_idle_time, total_part_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.equipment_id,
                record.display_name,
                record.started_at().map(|t| t.to_rfc3339()),
                record.part_file,
                record.tech_data,
                timedelta_format::format(&record.total_cutting_duration),
                timedelta_format::format(&record.total_idle_duration),
                record.cutting_count,
                record.idle_count,
                timedelta_format::format(&record.avg_cutting_time),
                timedelta_format::format(&record.avg_idle_time),
                record.total_part_count,
            ],
        )?;
        let session_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO intervals (session_id, position, status, start_time, end_time,
                    total_time, part_file, tech_data, session_part_count, total_part_count,
                    details, shift_type)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for (position, interval) in record.intervals.iter().enumerate() {
                stmt.execute(params![
                    session_id,
                    position as i64,
                    interval.status.as_str(),
                    interval.start_time.to_rfc3339(),
                    interval.end_time.as_time().map(|t| t.to_rfc3339()),
                    interval.total_time.as_ref().map(timedelta_format::format),
                    interval.part_file,
                    interval.tech_data,
                    interval.session_part_count,
                    interval.total_part_count,
                    serde_json::to_string(&interval.details)?,
                    interval.shift_type.as_str(),
                ])?;
            }
        }

        tx.commit()?;
        Ok(format!("{} (session {})", self.path.display(), session_id))
    }
}
