//! Maps raw log lines to runtime events
//!
//! Triggers are literal substrings emitted by the laser controller software and must
//! stay byte-exact. The first matching trigger wins; a matching line may still yield
//! several events, always status first.

use once_cell::sync::Lazy;
use regex::Regex;

use super::schema::Status;

const PART_PROGRAM: &str = "Downloading Part Program";
const TECH_DATA: &str = "Downloading TechData Recipe";
const CYCLE_START: &str = "Button Pressed|Cycle Start";
const VALIDATING_AREA: &str = "Validating full cutting area";
const PROCESSING_DONE: &str = "Process State|Total processing time";
const SYSTEM_ALARM: &str = "Error|System Alarm|";

static PART_FILE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\\/]([^\\/]+\.nc)").expect("valid part file pattern"));
static TECH_DATA_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Downloading TechData Recipe '([^']+)'").expect("valid tech data pattern")
});

/// Semantic event extracted from one log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    Status(Status),
    PartFile(String),
    TechData(String),
    Alarm(String),
    PartCompleted,
}

impl LineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LineEvent::Status(_) => "status",
            LineEvent::PartFile(_) => "part_file",
            LineEvent::TechData(_) => "tech_data",
            LineEvent::Alarm(_) => "alarm",
            LineEvent::PartCompleted => "part_completed",
        }
    }
}

/// Classify a line. Unrecognized lines yield no events.
pub fn classify(line: &str) -> Vec<LineEvent> {
    if line.contains(PART_PROGRAM) {
        let mut events = vec![LineEvent::Status(Status::Setup)];
        if let Some(name) = extract_part_file(line) {
            events.push(LineEvent::PartFile(name));
        }
        return events;
    }

    if line.contains(TECH_DATA) {
        return extract_tech_data(line)
            .map(LineEvent::TechData)
            .into_iter()
            .collect();
    }

    if line.contains(CYCLE_START) {
        return vec![LineEvent::Status(Status::Cutting)];
    }

    if line.contains(VALIDATING_AREA) {
        return vec![LineEvent::Status(Status::Cutting), LineEvent::PartCompleted];
    }

    if line.contains(PROCESSING_DONE) {
        return vec![LineEvent::Status(Status::Idle)];
    }

    if let Some(message) = extract_alarm(line) {
        return vec![LineEvent::Alarm(message)];
    }

    Vec::new()
}

/// Part program name, from the last path separator up to and including `.nc`
fn extract_part_file(line: &str) -> Option<String> {
    let program = &line[line.find(PART_PROGRAM)?..];
    PART_FILE_PATTERN
        .captures_iter(program)
        .last()
        .map(|c| c[1].trim().to_string())
}

fn extract_tech_data(line: &str) -> Option<String> {
    TECH_DATA_PATTERN
        .captures(line)
        .map(|c| c[1].to_string())
}

fn extract_alarm(line: &str) -> Option<String> {
    let start = line.find(SYSTEM_ALARM)? + SYSTEM_ALARM.len();
    let message = line[start..].trim();
    if message.is_empty() {
        None
    } else {
        Some(message.to_string())
    }
}
