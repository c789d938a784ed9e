//! Log file tailing
//!
//! Follows a single append-only log, handing back complete lines in order. Open
//! failures are retried on a schedule instead of sleeping, so a poll never blocks
//! longer than one read.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::SourceError;

/// Configuration for tailing one log
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Open attempts before the source is reported unavailable
    pub max_open_attempts: u32,
    /// Delay between open attempts
    pub open_retry: Duration,
    /// Maximum lines handed back per poll
    pub max_batch_lines: usize,
    /// Replay existing content instead of starting at the current end
    pub start_from_beginning: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_open_attempts: 5,
            open_retry: Duration::from_secs(60),
            max_batch_lines: 50,
            start_from_beginning: false,
        }
    }
}

/// Tails one log file
#[derive(Debug)]
pub struct LogReader {
    path: PathBuf,
    config: ReaderConfig,
    file: Option<File>,
    /// Byte offset of the next unread line; `None` until the first successful open
    cursor: Option<u64>,
    failed_attempts: u32,
    next_attempt: Option<Instant>,
}

impl LogReader {
    pub fn new(path: impl Into<PathBuf>, config: ReaderConfig) -> Self {
        Self {
            path: path.into(),
            config,
            file: None,
            cursor: None,
            failed_attempts: 0,
            next_attempt: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    #[cfg(test)]
    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    /// Return complete lines appended since the last poll.
    ///
    /// An empty batch means no new data or an open retry still pending.
    /// `SourceError::Unavailable` is returned once the retry budget is spent; the
    /// budget then starts over so the caller may keep polling.
    pub fn poll(&mut self) -> Result<Vec<String>, SourceError> {
        if self.file.is_some() && std::fs::metadata(&self.path).is_err() {
            warn!("Log source disappeared: {}", self.path.display());
            self.file = None;
        }

        if self.file.is_none() && !self.try_open()? {
            return Ok(Vec::new());
        }

        match self.read_batch() {
            Ok(lines) => Ok(lines),
            Err(e) => {
                warn!("Read error on {}: {}", self.path.display(), e);
                self.file = None;
                Err(SourceError::Io(e))
            }
        }
    }

    /// Attempt to open the source if a retry is due. Returns whether it is open.
    fn try_open(&mut self) -> Result<bool, SourceError> {
        if let Some(next) = self.next_attempt {
            if Instant::now() < next {
                return Ok(false);
            }
        }

        match File::open(&self.path).and_then(|f| f.metadata().map(|m| (f, m.len()))) {
            Ok((file, len)) => {
                let cursor = match self.cursor {
                    None if self.config.start_from_beginning => 0,
                    None => len,
                    // Same file resumed after an outage, unless it was replaced by a shorter one
                    Some(previous) if previous <= len => previous,
                    Some(_) => 0,
                };
                info!(
                    "Tailing {} from offset {} (size {})",
                    self.path.display(),
                    cursor,
                    len
                );
                self.file = Some(file);
                self.cursor = Some(cursor);
                self.failed_attempts = 0;
                self.next_attempt = None;
                Ok(true)
            }
            Err(e) => {
                self.failed_attempts += 1;
                let attempts = self.failed_attempts;
                if attempts >= self.config.max_open_attempts {
                    self.failed_attempts = 0;
                    self.next_attempt = Some(Instant::now() + self.config.open_retry);
                    return Err(SourceError::Unavailable {
                        path: self.path.clone(),
                        attempts,
                    });
                }
                warn!(
                    "Log file not available ({}), retrying in {}s ({}/{}): {}",
                    e,
                    self.config.open_retry.as_secs(),
                    attempts,
                    self.config.max_open_attempts,
                    self.path.display()
                );
                self.next_attempt = Some(Instant::now() + self.config.open_retry);
                Ok(false)
            }
        }
    }

    fn read_batch(&mut self) -> std::io::Result<Vec<String>> {
        let Some(file) = self.file.as_mut() else {
            return Ok(Vec::new());
        };
        let mut cursor = self.cursor.unwrap_or(0);

        let len = file.metadata()?.len();
        if len < cursor {
            info!(
                "Log truncated ({} < {}), restarting from the beginning: {}",
                len,
                cursor,
                self.path.display()
            );
            cursor = 0;
        }
        if len == cursor {
            self.cursor = Some(cursor);
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(cursor))?;
        let mut reader = BufReader::new(&*file);
        let mut lines = Vec::new();
        let mut buf = Vec::new();

        while lines.len() < self.config.max_batch_lines {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf)?;
            if read == 0 {
                break;
            }
            if buf.last() != Some(&b'\n') {
                // Partial line: leave it for the next poll
                debug!("Partial line ({} bytes) deferred", read);
                break;
            }
            cursor += read as u64;
            lines.push(decode_line(&buf));
        }

        self.cursor = Some(cursor);
        Ok(lines)
    }
}

fn decode_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.trim_end_matches(['\n', '\r']).to_string()
}
