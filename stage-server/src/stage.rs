//! Stage handle and position monitoring
//!
//! [`Stage`] bundles the shared serial link with the positions and timing the
//! controller runs under. Motion sequencing lives in [`motion`](crate::motion)
//! and homing in [`homing`](crate::homing); this module provides the
//! request/reply plumbing both depend on.
//!
//! # Position monitoring
//!
//! Devices give no acknowledgment that a move finished other than their
//! position readback, so every move is confirmed by polling
//! [`Stage::check_position`] until it returns the target. Replies for other
//! devices or other commands (move completions, stale answers from an earlier
//! request) are read and discarded.
//!
//! With `timing.max_position_polls` unset both loops poll forever, and an
//! unresponsive axis blocks the caller indefinitely.

use std::sync::{Arc, Mutex, MutexGuard};

use hardware::trigger::TriggerError;
use hardware::zaber::{Axis, Command, LinkError, SerialLink};
use thiserror::Error;
use tracing::debug;

use crate::config::{Positions, StageConfig, Timing};

/// Serial link shared between the command handler and the experiment runner.
pub type SharedLink = Arc<Mutex<SerialLink>>;

/// Errors from stage operations.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("Serial link error: {0}")]
    Link(#[from] LinkError),

    #[error("Trigger error: {0}")]
    Trigger(#[from] TriggerError),

    /// No matching reply arrived within the configured number of reads.
    #[error("No reply from device {device} after {attempts} reads")]
    NoReply { device: u8, attempts: u32 },

    /// The axis did not report the target position within the configured
    /// number of polls.
    #[error("{axis} stage did not reach {target} after {polls} polls (last at {last})")]
    PositionTimeout {
        axis: Axis,
        target: i32,
        last: i32,
        polls: u32,
    },

    /// A device answered with an error reply.
    #[error("Device {device} returned error code {code}")]
    DeviceError { device: u8, code: i32 },

    /// The serial link has not been opened yet.
    #[error("Stage link is not connected")]
    NotConnected,

    #[error("Failed to start experiment runner: {0}")]
    Spawn(std::io::Error),

    #[error("Experiment runner panicked")]
    RunnerPanicked,
}

pub type StageResult<T> = Result<T, StageError>;

/// Handle to the mirror and lens stages.
///
/// Cloning is cheap; clones share the same serial link.
#[derive(Clone)]
pub struct Stage {
    link: SharedLink,
    pub(crate) positions: Positions,
    pub(crate) timing: Timing,
    pub(crate) homed_bit: u32,
}

impl Stage {
    pub fn new(link: SerialLink, config: &StageConfig) -> Self {
        Self {
            link: Arc::new(Mutex::new(link)),
            positions: config.positions,
            timing: config.timing,
            homed_bit: config.homing.homed_bit,
        }
    }

    /// Lock the link for one request/reply exchange.
    fn link(&self) -> MutexGuard<'_, SerialLink> {
        // A panic mid-exchange leaves at worst a stray reply on the bus,
        // which the reply matching below already tolerates.
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn poll_limit_reached(&self, count: u32) -> bool {
        self.timing
            .max_position_polls
            .is_some_and(|limit| count >= limit)
    }

    /// Send a command to one axis without waiting for a reply.
    pub fn send(&self, axis: Axis, command: Command, data: i32) -> StageResult<()> {
        self.link().send(axis.device(), command.code(), data)?;
        Ok(())
    }

    /// Read the current position of `axis`.
    ///
    /// Sends a position request, then reads until a position reply from the
    /// same device arrives.
    pub fn check_position(&self, axis: Axis) -> StageResult<i32> {
        let mut link = self.link();
        link.send(axis.device(), Command::ReturnCurrentPosition.code(), 0)?;

        let mut attempts = 0;
        loop {
            if let Some(reply) = link.receive()? {
                if reply.is_reply(axis, Command::ReturnCurrentPosition) {
                    return Ok(reply.data);
                }
                debug!("Ignoring {:?} while waiting for {} position", reply, axis);
            }
            attempts += 1;
            if self.poll_limit_reached(attempts) {
                return Err(StageError::NoReply {
                    device: axis.device(),
                    attempts,
                });
            }
        }
    }

    /// Poll `axis` until it reports `target`.
    pub fn wait_until_in_position(&self, axis: Axis, target: i32) -> StageResult<()> {
        let mut polls = 0;
        loop {
            let position = self.check_position(axis)?;
            if position == target {
                return Ok(());
            }
            polls += 1;
            if self.poll_limit_reached(polls) {
                return Err(StageError::PositionTimeout {
                    axis,
                    target,
                    last: position,
                    polls,
                });
            }
        }
    }

    /// Read a device setting.
    ///
    /// `device` is a raw device number so settings can be read from any
    /// device on the chain. Devices answer with either the setting number or
    /// the return-setting command as the reply command, so both are accepted.
    /// A setting number that is also a known command code only matches a
    /// return-setting reply, so a stray move or home reply is not taken for
    /// the answer.
    pub fn query_setting(&self, device: u8, setting: i32) -> StageResult<i32> {
        let mut link = self.link();
        link.send(device, Command::ReturnSetting.code(), setting)?;

        let mut attempts = 0;
        loop {
            if let Some(reply) = link.receive()? {
                if reply.device == device {
                    if reply.command == Command::Error.code() {
                        return Err(StageError::DeviceError {
                            device,
                            code: reply.data,
                        });
                    }
                    let by_setting = i32::from(reply.command) == setting
                        && !Command::is_known(reply.command);
                    if by_setting || reply.command == Command::ReturnSetting.code() {
                        return Ok(reply.data);
                    }
                }
                debug!("Ignoring {:?} while waiting for setting {}", reply, setting);
            }
            attempts += 1;
            if self.poll_limit_reached(attempts) {
                return Err(StageError::NoReply { device, attempts });
            }
        }
    }

    /// True if both axes currently report their rest positions.
    pub fn at_rest(&self) -> StageResult<bool> {
        let lens = self.check_position(Axis::Lens)?;
        let mirror = self.check_position(Axis::Mirror)?;
        Ok(lens == self.positions.lens_rest && mirror == self.positions.mirror_rest)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hardware::mock::SimulatedBus;
    use hardware::zaber::{Packet, DEVICE_MODE};

    /// Config with no settle delays and a poll bound so failures don't hang.
    pub(crate) fn fast_config() -> StageConfig {
        let mut config = StageConfig::default();
        config.timing.lens_settle_ms = 0;
        config.timing.mirror_settle_ms = 0;
        config.timing.edge_poll_ms = 20;
        config.timing.max_position_polls = Some(200);
        config
    }

    pub(crate) fn simulated_stage() -> (Stage, SimulatedBus) {
        let bus = SimulatedBus::new();
        let stage = Stage::new(SerialLink::new(bus.clone()), &fast_config());
        (stage, bus)
    }

    #[test]
    fn test_check_position() {
        let (stage, bus) = simulated_stage();
        bus.set_position(Axis::Mirror, 30000);
        assert_eq!(stage.check_position(Axis::Mirror).unwrap(), 30000);
        assert_eq!(stage.check_position(Axis::Lens).unwrap(), 0);
    }

    #[test]
    fn test_check_position_skips_unrelated_replies() {
        let (stage, bus) = simulated_stage();
        bus.set_position(Axis::Lens, 40000);
        // Stale move completion and a mirror position left on the bus
        bus.inject(Packet::new(2, Command::MoveAbsolute.code(), 12));
        bus.inject(Packet::new(1, Command::ReturnCurrentPosition.code(), 99));

        assert_eq!(stage.check_position(Axis::Lens).unwrap(), 40000);
    }

    #[test]
    fn test_wait_until_in_position_polls_until_target() {
        let (stage, bus) = simulated_stage();
        bus.set_polls_per_move(4);
        stage.send(Axis::Lens, Command::MoveAbsolute, 5000).unwrap();

        bus.clear_sent();
        stage.wait_until_in_position(Axis::Lens, 5000).unwrap();
        assert_eq!(
            bus.sent_commands(Command::ReturnCurrentPosition).len(),
            4,
            "one poll per simulated step"
        );
    }

    #[test]
    fn test_wait_until_in_position_bounded() {
        let (stage, _bus) = simulated_stage();
        // Nothing was commanded, so the lens never reaches 100
        let err = stage.wait_until_in_position(Axis::Lens, 100).unwrap_err();
        match err {
            StageError::PositionTimeout {
                axis,
                target,
                last,
                polls,
            } => {
                assert_eq!(axis, Axis::Lens);
                assert_eq!(target, 100);
                assert_eq!(last, 0);
                assert_eq!(polls, 200);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_check_position_no_reply_bounded() {
        let bus = SimulatedBus::new();
        let mut config = fast_config();
        config.timing.max_position_polls = Some(3);
        let stage = Stage::new(SerialLink::new(bus), &config);

        // Device 7 is not on the bus; query it through the settings path
        let err = stage.query_setting(7, DEVICE_MODE).unwrap_err();
        assert!(matches!(
            err,
            StageError::NoReply {
                device: 7,
                attempts: 3
            }
        ));
    }

    #[test]
    fn test_query_setting_device_mode() {
        let (stage, bus) = simulated_stage();
        assert_eq!(stage.query_setting(1, DEVICE_MODE).unwrap(), 1 << 7);
        bus.set_homed(Axis::Mirror, false);
        assert_eq!(stage.query_setting(1, DEVICE_MODE).unwrap(), 0);
    }

    #[test]
    fn test_query_setting_accepts_command_code_reply() {
        let (stage, bus) = simulated_stage();
        // Leave an old-style reply ahead of the simulated one
        bus.inject(Packet::new(2, Command::ReturnSetting.code(), 1234));
        assert_eq!(stage.query_setting(2, DEVICE_MODE).unwrap(), 1234);
    }

    #[test]
    fn test_query_setting_ignores_reply_matching_a_command_code() {
        let (stage, bus) = simulated_stage();
        // A move completion still buffered when setting 20 is requested
        bus.inject(Packet::new(2, Command::MoveAbsolute.code(), 40000));
        let err = stage.query_setting(2, 20).unwrap_err();
        assert!(matches!(err, StageError::NoReply { device: 2, .. }));
    }

    #[test]
    fn test_query_setting_colliding_number_answered_on_53() {
        let (stage, bus) = simulated_stage();
        bus.inject(Packet::new(1, Command::Home.code(), 0));
        bus.inject(Packet::new(1, Command::ReturnSetting.code(), 7));
        assert_eq!(stage.query_setting(1, 1).unwrap(), 7);
    }

    #[test]
    fn test_query_setting_device_error() {
        let (stage, bus) = simulated_stage();
        bus.inject(Packet::new(2, Command::Error.code(), 36));
        let err = stage.query_setting(2, 99).unwrap_err();
        assert!(matches!(
            err,
            StageError::DeviceError {
                device: 2,
                code: 36
            }
        ));
    }

    #[test]
    fn test_at_rest() {
        let (stage, bus) = simulated_stage();
        assert!(!stage.at_rest().unwrap());
        bus.set_position(Axis::Mirror, 76346);
        assert!(stage.at_rest().unwrap());
    }
}
