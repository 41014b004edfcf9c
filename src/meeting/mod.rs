//! Control-plane socket client and message types

pub mod client;
pub mod messages;

pub use client::{Identifier, MeetingClient};
pub use messages::{ClientMessage, ServerMessage};
