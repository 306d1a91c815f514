//! Blocking client for the stage control channel.
//!
//! This is the caller side of the protocol as used by the experiment control
//! system: one request per connection, a 10 second reply timeout, and any
//! response other than `ok` treated as a failure.
//!
//! # Example
//!
//! ```no_run
//! use stage_server::client::StageClient;
//!
//! let client = StageClient::new("raspberrypi.local:42522");
//! client.initialise()?;
//! client.transition_to_buffered(40000)?;
//! // ... shot runs, driven by the trigger line ...
//! client.transition_to_manual()?;
//! # Ok::<(), stage_server::client::ClientError>(())
//! ```

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::config::MAX_FOCUS;
use crate::server::OK;

/// Reply timeout used by the experiment control system.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not resolve {0}")]
    Resolve(String),

    #[error("Timeout waiting for response")]
    Timeout,

    /// The server answered with something other than `ok`.
    #[error("Failed to {command}. Message from server was: {response}")]
    Rejected { command: String, response: String },

    #[error("Focus {value} out of bounds. Allowed range: 0 to {max}", max = MAX_FOCUS)]
    FocusOutOfRange { value: i64 },
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Client for a stage server at `host:port`.
#[derive(Debug, Clone)]
pub struct StageClient {
    addr: String,
    timeout: Duration,
}

impl StageClient {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one request on a fresh connection and return the response line.
    pub fn request(&self, message: &str) -> ClientResult<String> {
        let addr = self
            .addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ClientError::Resolve(self.addr.clone()))?;

        let connected = TcpStream::connect_timeout(&addr, self.timeout);
        let mut stream = connected.map_err(timeout_or_io)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        debug!("Stage request: {:?}", message);
        stream.write_all(message.as_bytes())?;
        stream.write_all(b"\n")?;
        stream.flush()?;
        stream.shutdown(Shutdown::Write)?;

        let mut response = String::new();
        BufReader::new(stream)
            .read_line(&mut response)
            .map_err(timeout_or_io)?;
        let response = response.trim_end().to_string();
        debug!("Stage response: {:?}", response);
        Ok(response)
    }

    fn expect_ok(&self, command: &str, message: &str) -> ClientResult<()> {
        let response = self.request(message)?;
        if response == OK {
            Ok(())
        } else {
            Err(ClientError::Rejected {
                command: command.to_string(),
                response,
            })
        }
    }

    pub fn initialise(&self) -> ClientResult<()> {
        self.expect_ok("initialise", "initialise")
    }

    /// Arm the stage for one triggered shot with the lens at `focus`.
    pub fn transition_to_buffered(&self, focus: i64) -> ClientResult<()> {
        if !(0..=i64::from(MAX_FOCUS)).contains(&focus) {
            return Err(ClientError::FocusOutOfRange { value: focus });
        }
        self.expect_ok(
            "transition to buffered",
            &format!("transition_to_buffered {focus}"),
        )
    }

    pub fn transition_to_manual(&self) -> ClientResult<()> {
        self.expect_ok("transition to manual", "transition_to_manual")
    }

    pub fn abort(&self) -> ClientResult<()> {
        self.expect_ok("abort", "abort")
    }

    /// Raw status query; the response is returned as-is.
    pub fn status(&self, region: &str) -> ClientResult<String> {
        self.request(&format!("status {region}"))
    }
}

fn timeout_or_io(e: std::io::Error) -> ClientError {
    match e.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => ClientError::Timeout,
        _ => ClientError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    /// One-shot server that records the request and replies with `reply`.
    fn one_shot(reply: &'static str) -> (String, std::thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut request = String::new();
            socket.read_to_string(&mut request).unwrap();
            socket.write_all(reply.as_bytes()).unwrap();
            request
        });
        (addr, handle)
    }

    #[test]
    fn test_request_line_framing() {
        let (addr, server) = one_shot("ok\n");
        let client = StageClient::new(&addr);
        client.transition_to_buffered(40000).unwrap();
        assert_eq!(server.join().unwrap(), "transition_to_buffered 40000\n");
    }

    #[test]
    fn test_rejected_response() {
        let (addr, server) = one_shot("Cannot transition_to_manual while idle\n");
        let client = StageClient::new(&addr);
        let err = client.transition_to_manual().unwrap_err();
        server.join().unwrap();
        assert_eq!(
            err.to_string(),
            "Failed to transition to manual. Message from server was: \
             Cannot transition_to_manual while idle"
        );
    }

    #[test]
    fn test_focus_bounds_checked_before_sending() {
        let client = StageClient::new("127.0.0.1:1");
        assert!(matches!(
            client.transition_to_buffered(-1),
            Err(ClientError::FocusOutOfRange { value: -1 })
        ));
        assert!(matches!(
            client.transition_to_buffered(76347),
            Err(ClientError::FocusOutOfRange { value: 76347 })
        ));
    }

    #[test]
    fn test_status_passthrough() {
        let (addr, server) = one_shot("128\n");
        let client = StageClient::new(&addr);
        assert_eq!(client.status("mirror").unwrap(), "128");
        assert_eq!(server.join().unwrap(), "status mirror\n");
    }

    #[test]
    fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = std::thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_millis(500));
            drop(socket);
        });

        let timeout = Duration::from_millis(100);
        let client = StageClient::new(&addr).with_timeout(timeout);
        assert!(matches!(
            client.request("initialise"),
            Err(ClientError::Timeout)
        ));
        server.join().unwrap();
    }
}
