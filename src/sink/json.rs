//! Finalized session records as JSON files for the downstream uploader

use std::io::Write;
use std::path::PathBuf;

use super::SessionPersister;
use crate::error::PersistError;
use crate::logwatch::SessionRecord;

/// Writes each record to `finalized_runtime_<id>_<start>.json` in a directory.
///
/// Files are written under a `.tmp` name and renamed into place, so a directory
/// watcher never picks up a half-written record.
#[derive(Debug, Clone)]
pub struct JsonFilePersister {
    dir: PathBuf,
}

impl JsonFilePersister {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Target path for a record
    pub fn file_path(&self, record: &SessionRecord) -> PathBuf {
        let started = record
            .started_at()
            .map(|t| t.format("%Y%m%dT%H%M%SZ").to_string())
            .unwrap_or_else(|| "empty".to_string());
        self.dir.join(format!(
            "finalized_runtime_{}_{}.json",
            sanitize(&record.equipment_id),
            started
        ))
    }
}

impl SessionPersister for JsonFilePersister {
    fn save(&self, record: &SessionRecord) -> Result<String, PersistError> {
        std::fs::create_dir_all(&self.dir)?;

        let path = self.file_path(record);
        let tmp_path = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(record)?;

        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &path)?;

        Ok(path.display().to_string())
    }
}

/// Keep equipment ids safe for use in file names
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
