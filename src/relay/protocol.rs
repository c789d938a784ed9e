//! Wire messages sent to the dashboard relay
//!
//! Each frame is a 4-byte big-endian length followed by a JSON body.

use serde::{Deserialize, Serialize};

use crate::logwatch::Snapshot;

/// Largest frame either side will accept
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Messages for the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// Full runtime state of one equipment unit
    RuntimeUpdate(Snapshot),
    /// Keeps the connection verified while equipment is quiet
    Heartbeat,
}

impl RelayMessage {
    /// Equipment the message concerns, if any
    pub fn equipment_id(&self) -> Option<&str> {
        match self {
            RelayMessage::RuntimeUpdate(snapshot) => Some(&snapshot.equipment_id),
            RelayMessage::Heartbeat => None,
        }
    }

    /// Encode as a length-prefixed frame
    pub fn to_frame(&self) -> serde_json::Result<Vec<u8>> {
        let body = serde_json::to_vec(self)?;
        let mut frame = Vec::with_capacity(body.len() + 4);
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }
}
