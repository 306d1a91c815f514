//! Serial transport for the Zaber binary protocol
//!
//! The link is half-duplex request-then-reply with no request identifiers,
//! so callers that share it between threads must hold a lock across each
//! send/receive pair.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace};

use super::packet::{Packet, PACKET_LEN};

/// Baud rate of the stage bus.
pub const BAUD_RATE: u32 = 9600;

/// Read timeout on the serial port. A `receive` that sees no complete
/// packet within this window yields nothing.
pub const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Errors from the serial link.
#[derive(Error, Debug)]
pub enum LinkError {
    /// Low-level I/O error on the transport.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The serial port could not be opened or configured.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

pub type LinkResult<T> = Result<T, LinkError>;

/// Byte transport carrying packets. Implemented for any `Read + Write + Send`,
/// which covers `Box<dyn SerialPort>` as well as the simulated bus.
pub trait Transport: Read + Write + Send {}

impl<T: Read + Write + Send> Transport for T {}

/// Packet-level access to the stage bus.
pub struct SerialLink {
    port: Box<dyn Transport>,
}

impl SerialLink {
    /// Open a serial port at 9600-8-N-1 with a 500 ms read timeout.
    pub fn open(path: &str) -> LinkResult<Self> {
        let port = serialport::new(path, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()?;

        debug!("Opened stage bus on {} at {} baud", path, BAUD_RATE);
        Ok(Self::new(port))
    }

    /// Wrap an already-open transport.
    pub fn new<T: Transport + 'static>(port: T) -> Self {
        Self {
            port: Box::new(port),
        }
    }

    /// Write one packet. No reply is read.
    pub fn send(&mut self, device: u8, command: u8, data: i32) -> LinkResult<()> {
        let packet = Packet::new(device, command, data);
        debug!("Zaber send: {:?}", packet);
        self.port.write_all(&packet.to_bytes())?;
        self.port.flush()?;
        Ok(())
    }

    /// Read exactly one packet.
    ///
    /// Returns `Ok(None)` when fewer than six bytes arrive before the read
    /// timeout. Any partial bytes are dropped.
    pub fn receive(&mut self) -> LinkResult<Option<Packet>> {
        let mut buf = [0u8; PACKET_LEN];
        match self.port.read_exact(&mut buf) {
            Ok(()) => {
                let packet = Packet::from_bytes(&buf);
                trace!("Zaber recv: {:?}", packet);
                Ok(Some(packet))
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::UnexpectedEof
                ) =>
            {
                trace!("Zaber recv: no packet ({})", e.kind());
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
