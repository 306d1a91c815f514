//! Homing and initialization
//!
//! After power-on a stage has no absolute position reference. Its device mode
//! register carries a flag that is set once the stage has been homed, so a
//! controller restart does not need to re-home stages that kept power.

use hardware::zaber::{Axis, Command, DEVICE_MODE};
use tracing::info;

use crate::stage::{Stage, StageResult};

/// Test the homed flag in a device mode value.
pub fn is_homed(mode: i32, homed_bit: u32) -> bool {
    (mode >> homed_bit) & 1 == 1
}

impl Stage {
    /// Home `axis` unless its device mode reports it already homed.
    ///
    /// Returns true if a home command was sent. Homing runs on the device;
    /// this does not wait for it to finish.
    pub fn home_if_needed(&self, axis: Axis) -> StageResult<bool> {
        let mode = self.query_setting(axis.device(), DEVICE_MODE)?;
        if is_homed(mode, self.homed_bit) {
            return Ok(false);
        }
        info!("Homing {} stage", axis);
        self.send(axis, Command::Home, 0)?;
        Ok(true)
    }

    /// Bring both stages to a known rest configuration.
    ///
    /// The lens is checked first: an un-homed lens may have dropped onto the
    /// mirror.
    pub fn initialise(&self) -> StageResult<()> {
        info!("Initialising stages");
        for axis in [Axis::Lens, Axis::Mirror] {
            self.home_if_needed(axis)?;
        }
        self.move_to_rest()
    }
}
