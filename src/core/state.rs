//! Shared state snapshots
//!
//! Each snapshot is single-writer (the owning component's loop) and
//! multi-reader; collaborators such as a web UI or tray read and serialize
//! them but never mutate.

use crate::meeting::messages::ServerMessage;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    #[default]
    Disconnected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Identity and connection status of the physical device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareState {
    pub variant: String,
    pub version: String,
    pub connection: ConnectionState,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
    pub last_button_pressed: Option<u8>,
}

impl Default for HardwareState {
    fn default() -> Self {
        Self {
            variant: "Unknown".to_string(),
            version: "0.0.0".to_string(),
            connection: ConnectionState::Disconnected,
            manufacturer: String::new(),
            product: String::new(),
            serial_number: String::new(),
            last_button_pressed: None,
        }
    }
}

/// Connection status plus the merged control-plane state.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MeetingSnapshot {
    pub connection: ConnectionState,
    /// Field-wise merge of every message received so far.
    pub state: ServerMessage,
    /// Seconds since the epoch of the last received message.
    pub last_received_secs: f64,
}

impl MeetingSnapshot {
    pub fn mark_received(&mut self) {
        self.last_received_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
    }
}

pub type SharedHardwareState = Arc<RwLock<HardwareState>>;
pub type SharedMeetingState = Arc<RwLock<MeetingSnapshot>>;
