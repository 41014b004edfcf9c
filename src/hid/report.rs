//! Wire codec for the 8-byte HID reports
//!
//! Reports carry a command tag at offset 0 and a command-specific payload in
//! offsets 1-6. Writes are prefixed with a channel byte: channel 1 is the
//! control channel for the commands below, channel 2 carries the update
//! transfer protocol (see [`crate::hid::transfer`]).

use crate::error::{Error, Result};

/// Size of a report payload, excluding the channel byte.
pub const REPORT_SIZE: usize = 8;

/// Channel byte for normal commands (prepare-update and reset included).
pub const CONTROL_CHANNEL: u8 = 1;

/// Channel byte for update-transfer packets.
pub const UPDATE_CHANNEL: u8 = 2;

mod tag {
    // Inbound
    pub const STATUS: u8 = 0x01;
    pub const VERSION_INFO: u8 = 0x99;
    // Outbound
    pub const SET_LED: u8 = 0x01;
    pub const PING: u8 = 0xF0;
    pub const PREPARE_UPDATE: u8 = 0xE0;
    pub const RESET: u8 = 0xE1;
    pub const UPDATE_CONFIG: u8 = 0xE2;
}

/// Hardware variants reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HardwareType {
    Unknown = 0x00,
    SingleButton = 0x01,
    FiveButtonUsb = 0x02,
    FiveButtonBt = 0x03,
    TenButtonUsb = 0x04,
    TenButtonBt = 0x05,
}

impl HardwareType {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => HardwareType::SingleButton,
            0x02 => HardwareType::FiveButtonUsb,
            0x03 => HardwareType::FiveButtonBt,
            0x04 => HardwareType::TenButtonUsb,
            0x05 => HardwareType::TenButtonBt,
            _ => HardwareType::Unknown,
        }
    }

    /// Number of physical buttons on this variant.
    pub fn button_count(&self) -> u8 {
        match self {
            HardwareType::SingleButton => 1,
            HardwareType::FiveButtonUsb | HardwareType::FiveButtonBt => 5,
            HardwareType::TenButtonUsb | HardwareType::TenButtonBt => 10,
            HardwareType::Unknown => 0,
        }
    }
}

impl std::fmt::Display for HardwareType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Button state change reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub button: u8,
    pub triggered: bool,
    pub doubletap: bool,
    pub pressed: bool,
    pub released: bool,
}

impl Status {
    /// Decode from the command-specific payload bytes.
    pub fn from_payload(payload: &[u8]) -> Self {
        Self {
            button: payload.first().copied().unwrap_or(0),
            triggered: payload.get(1).is_some_and(|&b| b != 0),
            doubletap: payload.get(2).is_some_and(|&b| b != 0),
            pressed: payload.get(3).is_some_and(|&b| b != 0),
            released: payload.get(4).is_some_and(|&b| b != 0),
        }
    }
}

/// Firmware version and hardware variant reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub hardware: HardwareType,
}

impl VersionInfo {
    pub fn from_payload(payload: &[u8]) -> Self {
        Self {
            major: payload.first().copied().unwrap_or(0),
            minor: payload.get(1).copied().unwrap_or(0),
            patch: payload.get(2).copied().unwrap_or(0),
            hardware: HardwareType::from_byte(payload.get(3).copied().unwrap_or(0)),
        }
    }

    pub fn version(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Decoded inbound report, keyed by the command tag at offset 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HidInput {
    Status(Status),
    VersionInfo(VersionInfo),
}

impl HidInput {
    /// Decode a raw report. Unknown tags are protocol violations.
    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.is_empty() {
            return Err(Error::Protocol("empty HID report".into()));
        }
        match buffer[0] {
            tag::STATUS => Ok(HidInput::Status(Status::from_payload(&buffer[1..]))),
            tag::VERSION_INFO => Ok(HidInput::VersionInfo(VersionInfo::from_payload(&buffer[1..]))),
            other => Err(Error::Protocol(format!("unknown report tag 0x{:02X}", other))),
        }
    }
}

/// LED color as intensity levels in channel order green, red, blue, white.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedColor {
    pub green: u8,
    pub red: u8,
    pub blue: u8,
    pub white: u8,
}

impl LedColor {
    pub const RED: LedColor = LedColor::new(0x00, 0x0A, 0x00, 0x00);
    pub const GREEN: LedColor = LedColor::new(0x0A, 0x00, 0x00, 0x00);
    pub const BLUE: LedColor = LedColor::new(0x00, 0x00, 0x0A, 0x00);
    pub const WHITE: LedColor = LedColor::new(0x00, 0x00, 0x00, 0x0A);
    pub const BLACK: LedColor = LedColor::new(0x00, 0x00, 0x00, 0x00);
    pub const YELLOW: LedColor = LedColor::new(0x0A, 0x0A, 0x00, 0x00);
    pub const CYAN: LedColor = LedColor::new(0x0A, 0x00, 0x0A, 0x00);
    pub const MAGENTA: LedColor = LedColor::new(0x00, 0x0A, 0x0A, 0x00);
    pub const ORANGE: LedColor = LedColor::new(0x08, 0x0A, 0x00, 0x00);
    pub const PURPLE: LedColor = LedColor::new(0x00, 0x09, 0x09, 0x00);

    pub const fn new(green: u8, red: u8, blue: u8, white: u8) -> Self {
        Self { green, red, blue, white }
    }

    /// Look up a named color, case-insensitive. Unknown names fall back to
    /// black so a bad collaborator value turns the LED off rather than on.
    pub fn by_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "red" => Self::RED,
            "green" => Self::GREEN,
            "blue" => Self::BLUE,
            "white" => Self::WHITE,
            "yellow" => Self::YELLOW,
            "cyan" => Self::CYAN,
            "magenta" => Self::MAGENTA,
            "orange" => Self::ORANGE,
            "purple" => Self::PURPLE,
            _ => Self::BLACK,
        }
    }
}

/// Device configuration bit flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateConfig {
    pub activate_debug: bool,
    pub activate_filesystem: bool,
}

/// Outbound command, encoded into one 8-byte report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HidCommand {
    SetLed { button: u8, color: LedColor },
    Ping,
    PrepareUpdate,
    Reset,
    UpdateConfig(UpdateConfig),
}

impl HidCommand {
    /// Encode the 8-byte report payload.
    pub fn encode(&self) -> [u8; REPORT_SIZE] {
        match *self {
            HidCommand::SetLed { button, color } => [
                tag::SET_LED,
                button,
                color.green,
                color.red,
                color.blue,
                color.white,
                0,
                0,
            ],
            HidCommand::Ping => [tag::PING, 0, 0, 0, 0, 0, 0, 0],
            HidCommand::PrepareUpdate => [tag::PREPARE_UPDATE, 0, 0, 0, 0, 0, 0, 0],
            HidCommand::Reset => [tag::RESET, 0, 0, 0, 0, 0, 0, 0],
            HidCommand::UpdateConfig(cfg) => {
                let mut flags = 0u8;
                if cfg.activate_debug {
                    flags |= 0x01;
                }
                if cfg.activate_filesystem {
                    flags |= 0x02;
                }
                [tag::UPDATE_CONFIG, flags, 0, 0, 0, 0, 0, 0]
            }
        }
    }

    /// Encode the on-wire bytes: channel byte followed by the payload.
    pub fn wire_bytes(&self) -> [u8; REPORT_SIZE + 1] {
        let payload = self.encode();
        let mut bytes = [0u8; REPORT_SIZE + 1];
        bytes[0] = CONTROL_CHANNEL;
        bytes[1..].copy_from_slice(&payload);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_decodes_trigger_and_release() {
        let status = Status::from_payload(&[1, 1, 0, 0, 1, 0]);
        assert_eq!(status.button, 1);
        assert!(status.triggered);
        assert!(!status.doubletap);
        assert!(!status.pressed);
        assert!(status.released);
    }

    #[test]
    fn status_roundtrip_through_report() {
        let input = HidInput::parse(&[0x01, 3, 0, 1, 1, 0, 0, 0]).unwrap();
        match input {
            HidInput::Status(s) => {
                assert_eq!(s.button, 3);
                assert!(s.doubletap);
                assert!(s.pressed);
                assert!(!s.triggered);
            }
            other => panic!("expected status, got {:?}", other),
        }
    }

    #[test]
    fn version_info_decodes() {
        let input = HidInput::parse(&[0x99, 1, 2, 3, 0x02, 0, 0, 0]).unwrap();
        match input {
            HidInput::VersionInfo(v) => {
                assert_eq!(v.version(), "1.2.3");
                assert_eq!(v.hardware, HardwareType::FiveButtonUsb);
                assert_eq!(v.hardware.button_count(), 5);
            }
            other => panic!("expected version info, got {:?}", other),
        }
    }

    #[test]
    fn unknown_tag_is_protocol_error() {
        assert!(HidInput::parse(&[0x42, 0, 0, 0, 0, 0, 0, 0]).is_err());
        assert!(HidInput::parse(&[]).is_err());
    }

    #[test]
    fn set_led_encodes_grbw_order() {
        let cmd = HidCommand::SetLed { button: 3, color: LedColor::GREEN };
        assert_eq!(cmd.encode(), [1, 3, 0x0A, 0, 0, 0, 0, 0]);
        // Channel byte prepended on the wire
        assert_eq!(cmd.wire_bytes(), [1, 1, 3, 0x0A, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn red_led_lights_the_second_channel() {
        let cmd = HidCommand::SetLed { button: 1, color: LedColor::RED };
        assert_eq!(cmd.encode(), [1, 1, 0x00, 0x0A, 0x00, 0x00, 0, 0]);
    }

    #[test]
    fn simple_commands_encode_tag_only() {
        assert_eq!(HidCommand::Ping.encode(), [0xF0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(HidCommand::PrepareUpdate.encode(), [0xE0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(HidCommand::Reset.encode(), [0xE1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn update_config_sets_flag_bits() {
        let cmd = HidCommand::UpdateConfig(UpdateConfig {
            activate_debug: true,
            activate_filesystem: true,
        });
        assert_eq!(cmd.encode(), [0xE2, 0x03, 0, 0, 0, 0, 0, 0]);

        let debug_only = HidCommand::UpdateConfig(UpdateConfig {
            activate_debug: true,
            activate_filesystem: false,
        });
        assert_eq!(debug_only.encode()[1], 0x01);
    }

    #[test]
    fn color_lookup_falls_back_to_black() {
        assert_eq!(LedColor::by_name("GREEN"), LedColor::GREEN);
        assert_eq!(LedColor::by_name("chartreuse"), LedColor::BLACK);
    }
}
