//! Zaber T-series stage binary protocol
//!
//! This module provides packet framing and a serial link for Zaber linear
//! stages driven over the legacy binary protocol (9600-8-N-1, fixed six-byte
//! packets, no acknowledgment beyond the device's own replies).
//!
//! # Example
//!
//! ```no_run
//! use hardware::zaber::{Axis, Command, SerialLink};
//!
//! let mut link = SerialLink::open("/dev/ttyUSB0")?;
//! link.send(Axis::Lens.device(), Command::ReturnCurrentPosition.code(), 0)?;
//! while let Some(reply) = link.receive()? {
//!     if reply.is_reply(Axis::Lens, Command::ReturnCurrentPosition) {
//!         println!("Lens at {}", reply.data);
//!         break;
//!     }
//! }
//! # Ok::<(), hardware::zaber::LinkError>(())
//! ```

mod link;
mod packet;

pub use link::{LinkError, LinkResult, SerialLink, Transport, BAUD_RATE, READ_TIMEOUT};
pub use packet::{Axis, Command, Packet, DEVICE_MODE, PACKET_LEN};
