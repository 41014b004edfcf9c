//! Meetpad host driver
//!
//! Bridges a USB-HID macropad to a video-conferencing application's local
//! control API and reflects application state back onto the device LEDs.
//!
//! # Structure
//! - A resilient HID transport that survives unplug/replug without losing
//!   queued work ([`hid::device`])
//! - A chunked file-transfer engine for pushing firmware updates with
//!   device-driven retransmission ([`hid::update`])
//! - A reconnecting, request-correlated client for the control-plane
//!   WebSocket whose partial state updates are merged ([`meeting::client`])
//! - The concurrency primitives these are built on ([`util`])
//!
//! Button-to-action mapping, LED policy, configuration persistence and any
//! UI surfaces are collaborators plugging into [`Macropad`]'s hooks.

pub mod core;
pub mod error;
pub mod hid;
pub mod macropad;
pub mod meeting;
pub mod util;

pub use crate::core::state::{ConnectionState, HardwareState, MeetingSnapshot};
pub use error::{Error, Result};
pub use hid::device::{DeviceSpec, HidTransport};
pub use hid::report::{HidCommand, HidInput, LedColor, Status, VersionInfo};
pub use hid::transfer::TransferFile;
pub use macropad::Macropad;
pub use meeting::client::{Identifier, MeetingClient};
pub use meeting::messages::{ClientMessage, MeetingAction, ReactionType, ServerMessage};
