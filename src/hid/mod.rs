//! HID transport, report codecs and the firmware update engine

pub mod device;
pub mod report;
pub mod transfer;
pub mod update;

pub use device::{DeviceSpec, HidTransport};
pub use report::{HidCommand, HidInput};
