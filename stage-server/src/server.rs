//! Control channel: state machine and TCP listener
//!
//! Requests are single lines of space-separated tokens; every request gets
//! exactly one line back. `ok` means success and anything else is an error
//! message for the caller to surface.
//!
//! | Request                          | Allowed in    | Effect                                   |
//! |----------------------------------|---------------|------------------------------------------|
//! | `initialise`                     | any state     | home if needed, park at rest             |
//! | `transition_to_buffered <focus>` | idle          | park at rest, arm the experiment runner  |
//! | `transition_to_manual`, `abort`  | buffered      | cancel and join the runner, park at rest |
//! | `status <region> [setting]`      | initialised   | read a device setting                    |
//!
//! A request line longer than [`MAX_REQUEST_LEN`] gets [`REQUEST_TOO_LONG`]
//! and the connection is closed.
//!
//! Requests are handled one at a time. Hardware I/O is blocking, so each
//! request runs on the blocking thread pool while holding the controller lock.

use std::sync::{Arc, Mutex};

use hardware::trigger::TriggerInput;
use hardware::zaber::{Axis, LinkResult, SerialLink, DEVICE_MODE};
use strum::Display;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::StageConfig;
use crate::runner::{AbortFlag, ExperimentRunner, SharedTrigger};
use crate::stage::{Stage, StageError, StageResult};

/// Success response.
pub const OK: &str = "ok";

/// Response to anything but `initialise` before the first `initialise`.
pub const NOT_INITIALISED: &str = "Server not yet initialised. Please send the initialise command";

/// Longest accepted request line, newline included.
pub const MAX_REQUEST_LEN: usize = 1024;

/// Response sent before closing a connection whose request is too long.
pub const REQUEST_TOO_LONG: &str = "Request too long";

/// Opens the serial link on first `initialise`.
pub type Connector = Box<dyn FnMut() -> LinkResult<SerialLink> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ServerState {
    Uninitialised,
    Idle,
    Buffered,
}

/// Stage controller state machine.
///
/// Owns the stage link (once opened), the trigger input, the abort flag and
/// at most one experiment runner.
pub struct Controller {
    config: StageConfig,
    connector: Connector,
    stage: Option<Stage>,
    trigger: SharedTrigger,
    abort: AbortFlag,
    runner: Option<ExperimentRunner>,
    state: ServerState,
}

impl Controller {
    pub fn new(config: StageConfig, connector: Connector, trigger: Box<dyn TriggerInput>) -> Self {
        Self {
            config,
            connector,
            stage: None,
            trigger: Arc::new(Mutex::new(trigger)),
            abort: AbortFlag::new(),
            runner: None,
            state: ServerState::Uninitialised,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Handle one request line and produce its response.
    pub fn handle(&mut self, message: &str) -> String {
        debug!("Request: {:?}", message);
        let mut parts = message.split_whitespace();
        let cmd = parts.next().unwrap_or_default();

        if self.state == ServerState::Uninitialised && cmd != "initialise" {
            return NOT_INITIALISED.to_string();
        }

        let response = match cmd {
            "initialise" => {
                let result = self.initialise();
                respond(cmd, result.map(|()| OK.to_string()))
            }
            "transition_to_buffered" => {
                if self.state != ServerState::Idle {
                    return self.out_of_order(cmd);
                }
                let Some(token) = parts.next() else {
                    return format!("Missing focus value for {cmd}");
                };
                let Ok(focus) = token.parse::<i32>() else {
                    return format!("Invalid focus value '{token}'");
                };
                let result = self.transition_to_buffered(focus);
                respond(cmd, result.map(|()| OK.to_string()))
            }
            "transition_to_manual" | "abort" => {
                if self.state != ServerState::Buffered {
                    return self.out_of_order(cmd);
                }
                let result = self.transition_to_manual();
                respond(cmd, result.map(|()| OK.to_string()))
            }
            "status" => {
                let Some(region) = parts.next() else {
                    return "Missing region for status".to_string();
                };
                let setting = match parts.next().map(str::parse::<i32>) {
                    None => DEVICE_MODE,
                    Some(Ok(setting)) => setting,
                    Some(Err(_)) => return format!("Invalid setting for status {region}"),
                };
                let Some(device) = parse_region(region) else {
                    return format!("Unknown status region {region}");
                };
                let result = self.status(device, setting);
                respond(cmd, result)
            }
            _ => format!("Unknown command {cmd}"),
        };
        debug!("Response: {:?}", response);
        response
    }

    fn out_of_order(&self, cmd: &str) -> String {
        format!("Cannot {cmd} while {}", self.state)
    }

    fn stage(&self) -> StageResult<Stage> {
        self.stage.clone().ok_or(StageError::NotConnected)
    }

    /// Set the abort flag and wait for the runner, if any, to exit.
    fn stop_runner(&mut self) {
        self.abort.set();
        if let Some(runner) = self.runner.take() {
            match runner.join() {
                Ok(outcome) => debug!("Runner stopped: {:?}", outcome),
                // The runner's motion failed part way; the caller re-parks below
                Err(e) => warn!("Experiment runner failed: {}", e),
            }
        }
    }

    fn initialise(&mut self) -> StageResult<()> {
        if self.state == ServerState::Buffered {
            self.stop_runner();
            self.state = ServerState::Idle;
        }

        let stage = match &self.stage {
            Some(stage) => stage.clone(),
            None => {
                let link = (self.connector)()?;
                let stage = Stage::new(link, &self.config);
                self.stage = Some(stage.clone());
                stage
            }
        };

        stage.initialise()?;
        self.state = ServerState::Idle;
        info!("Server initialised");
        Ok(())
    }

    fn transition_to_buffered(&mut self, focus: i32) -> StageResult<()> {
        let stage = self.stage()?;
        self.abort.clear();
        stage.ensure_rest()?;

        let runner = ExperimentRunner::spawn(
            stage,
            self.trigger.clone(),
            self.abort.clone(),
            focus,
            self.config.timing.edge_poll(),
        )?;
        self.runner = Some(runner);
        self.state = ServerState::Buffered;
        info!("Buffered with focus {}", focus);
        Ok(())
    }

    fn transition_to_manual(&mut self) -> StageResult<()> {
        let stage = self.stage()?;
        self.stop_runner();
        stage.ensure_rest()?;
        self.state = ServerState::Idle;
        info!("Returned to manual");
        Ok(())
    }

    fn status(&mut self, device: u8, setting: i32) -> StageResult<String> {
        let value = self.stage()?.query_setting(device, setting)?;
        Ok(value.to_string())
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop_runner();
    }
}

/// `mirror`, `lens`, or a raw device number.
fn parse_region(region: &str) -> Option<u8> {
    region
        .parse::<Axis>()
        .map(Axis::device)
        .ok()
        .or_else(|| region.parse::<u8>().ok())
}

fn respond(cmd: &str, result: StageResult<String>) -> String {
    result.unwrap_or_else(|e| {
        error!("{} failed: {}", cmd, e);
        format!("Failed to {cmd}: {e}")
    })
}

/// Accept control connections until the listener fails.
pub async fn serve(listener: TcpListener, controller: Controller) -> std::io::Result<()> {
    let controller = Arc::new(tokio::sync::Mutex::new(controller));
    loop {
        let (socket, peer) = listener.accept().await?;
        debug!("Control connection from {}", peer);
        let controller = controller.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, controller).await {
                warn!("Control connection from {} failed: {}", peer, e);
            }
        });
    }
}

async fn handle_connection(
    socket: TcpStream,
    controller: Arc<tokio::sync::Mutex<Controller>>,
) -> std::io::Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let mut line = String::new();
        let limit = MAX_REQUEST_LEN as u64 + 1;
        if (&mut reader).take(limit).read_line(&mut line).await? == 0 {
            return Ok(());
        }
        if line.len() > MAX_REQUEST_LEN {
            warn!("Dropping control connection: request exceeds {MAX_REQUEST_LEN} bytes");
            writer.write_all(REQUEST_TOO_LONG.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            return writer.flush().await;
        }

        let request = line.trim().to_string();
        if request.is_empty() {
            continue;
        }

        let mut guard = controller.clone().lock_owned().await;
        let response = tokio::task::spawn_blocking(move || guard.handle(&request))
            .await
            .unwrap_or_else(|e| format!("Failed to handle request: {e}"));

        writer.write_all(response.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
}
