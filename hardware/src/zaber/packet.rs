//! Zaber binary protocol packet framing
//!
//! Every request and reply on the bus is exactly six bytes:
//!
//! ```text
//! +--------+---------+---------------------------+
//! | device | command | data (i32, little-endian) |
//! |  1 B   |   1 B   |            4 B            |
//! +--------+---------+---------------------------+
//! ```
//!
//! Requests and replies use the same layout. There is no checksum and no
//! message identifier; a reply is matched to its request only by the device
//! and command fields.

use bytemuck::{bytes_of, pod_read_unaligned, Pod, Zeroable};
use strum::{Display, EnumIter, EnumString, FromRepr};

/// Size of a packet on the wire in bytes.
pub const PACKET_LEN: usize = 6;

/// One of the two motorized stages on the bus.
///
/// The discriminant is the device number the stage answers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[repr(u8)]
pub enum Axis {
    /// Fold mirror that directs the beam into the MOT or out of the way.
    Mirror = 1,
    /// Objective lens; its position is the imaging focus.
    Lens = 2,
}

impl Axis {
    /// Device number used on the wire.
    pub const fn device(self) -> u8 {
        self as u8
    }
}

/// Command numbers used by the stage controller.
///
/// Any other command can still be sent by number through
/// [`SerialLink::send`](super::SerialLink::send).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum Command {
    /// Drive to the home sensor and zero the position counter.
    Home = 1,
    /// Move to an absolute position in microsteps.
    MoveAbsolute = 20,
    /// Read back a setting; the data field selects which one.
    ReturnSetting = 53,
    /// Read back the current position.
    ReturnCurrentPosition = 60,
    /// Error reply from a device; the data field carries the error code.
    Error = 255,
}

impl Command {
    /// Command number used on the wire.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// True if `code` is one of the commands above.
    pub fn is_known(code: u8) -> bool {
        Self::from_repr(code).is_some()
    }
}

/// Setting number for the device mode register, used with
/// [`Command::ReturnSetting`].
pub const DEVICE_MODE: i32 = 40;

/// Decoded packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    /// Device number (1-254, 0 addresses all devices)
    pub device: u8,
    /// Command number
    pub command: u8,
    /// Command operand or reply value
    pub data: i32,
}

impl Packet {
    pub fn new(device: u8, command: u8, data: i32) -> Self {
        Self {
            device,
            command,
            data,
        }
    }

    /// Serialize to the six-byte wire representation.
    pub fn to_bytes(&self) -> [u8; PACKET_LEN] {
        let raw = RawPacket {
            device: self.device,
            command: self.command,
            data: self.data.to_le_bytes(),
        };
        let mut bytes = [0u8; PACKET_LEN];
        bytes.copy_from_slice(bytes_of(&raw));
        bytes
    }

    /// Deserialize from the six-byte wire representation.
    pub fn from_bytes(bytes: &[u8; PACKET_LEN]) -> Self {
        let raw: RawPacket = pod_read_unaligned(bytes);
        Self {
            device: raw.device,
            command: raw.command,
            data: i32::from_le_bytes(raw.data),
        }
    }

    /// True if this packet came from `axis` and carries `command`.
    pub fn is_reply(&self, axis: Axis, command: Command) -> bool {
        self.device == axis.device() && self.command == command.code()
    }
}

/// Wire layout of a packet.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct RawPacket {
    device: u8,
    command: u8,
    /// Little-endian regardless of host byte order
    data: [u8; 4],
}

// SAFETY: RawPacket is repr(C, packed) and all fields are Pod
unsafe impl Pod for RawPacket {}
// SAFETY: RawPacket is repr(C, packed) and all fields are Zeroable
unsafe impl Zeroable for RawPacket {}
