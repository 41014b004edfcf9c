//! Crate error type
//!
//! Transient I/O failures (device unplugged, socket dropped) are recovered
//! internally by the reconnect paths and normally never surface through
//! these variants; protocol violations and serialization failures do.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HID error: {0}")]
    Hid(#[from] hidapi::HidError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A frame or request that violates the wire protocol. Aborts the
    /// operation that observed it; continuing would risk corrupt data.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("device not connected")]
    NotConnected,

    /// The component was stopped while the operation was still queued.
    #[error("component stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, Error>;
