//! Fan network frames
//!
//! # Wire format
//!
//! Every frame is a fixed 16 bytes:
//!
//! ```text
//! [rx_type][rx_id][tx_type][tx_id][ttl][command][parameter_count][payload: 9 bytes]
//! ```
//!
//! The payload is interpreted per command; multi-byte integers are
//! little-endian (the network id of the join commands sits at offset 7 of
//! the frame). Unused payload bytes are zero.

use crate::config::protocol::{FAN_FRAMESIZE, FAN_TTL};

/// Device-type tags on the fan network
pub mod device_type {
    /// Broadcast to all devices
    pub const BROADCAST: u8 = 0x00;
    /// Main ventilation units
    pub const MAIN_UNIT: u8 = 0x01;
    /// Remote controls (the role this crate takes)
    pub const REMOTE_CONTROL: u8 = 0x03;
    /// CO2 sensors
    pub const CO2_SENSOR: u8 = 0x18;
}

/// Fan speed presets
pub mod speed {
    /// Off: 0% or 0.0 V
    pub const AUTO: u8 = 0x00;
    /// Low: 30% or 3.0 V
    pub const LOW: u8 = 0x01;
    /// Medium: 50% or 5.0 V
    pub const MEDIUM: u8 = 0x02;
    /// High: 90% or 9.0 V
    pub const HIGH: u8 = 0x03;
    /// Max: 100% or 10.0 V
    pub const MAX: u8 = 0x04;
}

/// Fixed payload of the set-speed acknowledgement frame
const SETSPEED_REPLY_PAYLOAD: [u8; 3] = [0x54, 0x03, 0x20];

/// Command byte of a frame
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanCommand {
    /// Set speed preset (0x02)
    SetSpeed = 0x02,
    /// Set speed preset with a timer (0x03)
    SetTimer = 0x03,
    /// Request to join a network (0x04)
    JoinRequest = 0x04,
    /// Acknowledge a received fan-settings reply after a speed change (0x05)
    SetSpeedReply = 0x05,
    /// Main unit opens its network for joining (0x06)
    JoinOpen = 0x06,
    /// Current settings, sent by the fan in reply to speed and query commands (0x07)
    FanSettings = 0x07,
    /// Link acknowledge, exchanged in both directions at the end of joining (0x0B)
    Frame0B = 0x0B,
    /// Announce availability for joining (0x0C)
    JoinAck = 0x0C,
    /// Network query, observed from the main unit when a join is committed (0x0D)
    QueryNetwork = 0x0D,
    /// Request the current fan settings (0x10)
    QueryDevice = 0x10,
}

impl FanCommand {
    /// Try to convert a byte to a FanCommand
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x02 => Some(Self::SetSpeed),
            0x03 => Some(Self::SetTimer),
            0x04 => Some(Self::JoinRequest),
            0x05 => Some(Self::SetSpeedReply),
            0x06 => Some(Self::JoinOpen),
            0x07 => Some(Self::FanSettings),
            0x0B => Some(Self::Frame0B),
            0x0C => Some(Self::JoinAck),
            0x0D => Some(Self::QueryNetwork),
            0x10 => Some(Self::QueryDevice),
            _ => None,
        }
    }
}

/// Command-specific frame payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePayload {
    SetSpeed { speed: u8 },
    SetTimer { speed: u8, timer: u8 },
    JoinRequest { network_id: u32 },
    SetSpeedReply,
    JoinOpen { network_id: u32 },
    FanSettings { speed: u8, voltage: u8, timer: u8 },
    Frame0B,
    JoinAck { network_id: u32 },
    QueryNetwork,
    QueryDevice,
}

impl FramePayload {
    /// The command byte this payload travels under
    pub fn command(&self) -> FanCommand {
        match self {
            Self::SetSpeed { .. } => FanCommand::SetSpeed,
            Self::SetTimer { .. } => FanCommand::SetTimer,
            Self::JoinRequest { .. } => FanCommand::JoinRequest,
            Self::SetSpeedReply => FanCommand::SetSpeedReply,
            Self::JoinOpen { .. } => FanCommand::JoinOpen,
            Self::FanSettings { .. } => FanCommand::FanSettings,
            Self::Frame0B => FanCommand::Frame0B,
            Self::JoinAck { .. } => FanCommand::JoinAck,
            Self::QueryNetwork => FanCommand::QueryNetwork,
            Self::QueryDevice => FanCommand::QueryDevice,
        }
    }

    /// Conventional parameter count for this command
    pub fn parameter_count(&self) -> u8 {
        match self {
            Self::SetSpeed { .. } => 1,
            Self::SetTimer { .. } => 2,
            Self::JoinRequest { .. } => 4,
            Self::SetSpeedReply => 3,
            Self::JoinOpen { .. } => 4,
            Self::FanSettings { .. } => 3,
            Self::Frame0B => 0,
            Self::JoinAck { .. } => 4,
            Self::QueryNetwork => 0,
            Self::QueryDevice => 0,
        }
    }
}

/// Errors decoding a received frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than a full frame
    Truncated,
    /// Command byte not part of the protocol
    UnknownCommand(u8),
}

/// A single 16-byte frame on the fan network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Destination device type
    pub rx_type: u8,
    /// Destination device id
    pub rx_id: u8,
    /// Source device type
    pub tx_type: u8,
    /// Source device id
    pub tx_id: u8,
    /// Time-to-live; always generated as [`FAN_TTL`], never decremented here
    pub ttl: u8,
    pub parameter_count: u8,
    pub payload: FramePayload,
}

impl Frame {
    /// Build a frame with the default TTL and the payload's conventional
    /// parameter count.
    pub fn new(rx_type: u8, rx_id: u8, tx_type: u8, tx_id: u8, payload: FramePayload) -> Self {
        Self {
            rx_type,
            rx_id,
            tx_type,
            tx_id,
            ttl: FAN_TTL,
            parameter_count: payload.parameter_count(),
            payload,
        }
    }

    /// Command byte of this frame
    pub fn command(&self) -> FanCommand {
        self.payload.command()
    }

    /// Encode into the 16-byte wire form
    pub fn encode(&self) -> [u8; FAN_FRAMESIZE] {
        let mut data = [0u8; FAN_FRAMESIZE];

        data[0] = self.rx_type;
        data[1] = self.rx_id;
        data[2] = self.tx_type;
        data[3] = self.tx_id;
        data[4] = self.ttl;
        data[5] = self.command() as u8;
        data[6] = self.parameter_count;

        let payload = &mut data[7..];
        match self.payload {
            FramePayload::SetSpeed { speed } => payload[0] = speed,
            FramePayload::SetTimer { speed, timer } => {
                payload[0] = speed;
                payload[1] = timer;
            }
            FramePayload::JoinRequest { network_id }
            | FramePayload::JoinOpen { network_id }
            | FramePayload::JoinAck { network_id } => {
                payload[..4].copy_from_slice(&network_id.to_le_bytes());
            }
            FramePayload::SetSpeedReply => {
                payload[..3].copy_from_slice(&SETSPEED_REPLY_PAYLOAD);
            }
            FramePayload::FanSettings { speed, voltage, timer } => {
                payload[0] = speed;
                payload[1] = voltage;
                payload[2] = timer;
            }
            FramePayload::Frame0B | FramePayload::QueryNetwork | FramePayload::QueryDevice => {}
        }

        data
    }

    /// Decode a received frame.
    ///
    /// Extra bytes past the frame size are ignored (the radio hands over its
    /// full RX register).
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < FAN_FRAMESIZE {
            return Err(FrameError::Truncated);
        }

        let command =
            FanCommand::from_byte(data[5]).ok_or(FrameError::UnknownCommand(data[5]))?;
        let p = &data[7..FAN_FRAMESIZE];

        let payload = match command {
            FanCommand::SetSpeed => FramePayload::SetSpeed { speed: p[0] },
            FanCommand::SetTimer => FramePayload::SetTimer { speed: p[0], timer: p[1] },
            FanCommand::JoinRequest => FramePayload::JoinRequest {
                network_id: u32::from_le_bytes([p[0], p[1], p[2], p[3]]),
            },
            FanCommand::SetSpeedReply => FramePayload::SetSpeedReply,
            FanCommand::JoinOpen => FramePayload::JoinOpen {
                network_id: u32::from_le_bytes([p[0], p[1], p[2], p[3]]),
            },
            FanCommand::FanSettings => FramePayload::FanSettings {
                speed: p[0],
                voltage: p[1],
                timer: p[2],
            },
            FanCommand::Frame0B => FramePayload::Frame0B,
            FanCommand::JoinAck => FramePayload::JoinAck {
                network_id: u32::from_le_bytes([p[0], p[1], p[2], p[3]]),
            },
            FanCommand::QueryNetwork => FramePayload::QueryNetwork,
            FanCommand::QueryDevice => FramePayload::QueryDevice,
        };

        Ok(Self {
            rx_type: data[0],
            rx_id: data[1],
            tx_type: data[2],
            tx_id: data[3],
            ttl: data[4],
            parameter_count: data[6],
            payload,
        })
    }
}
