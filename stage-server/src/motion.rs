//! Two-axis move sequencing
//!
//! The mirror's rest position lies across the lens's travel path, so the two
//! axes must never be in transit towards each other. Moving to rest withdraws
//! the lens before the mirror swings in; moving to imaging swings the mirror
//! out before the lens advances. Each leg is confirmed by position readback
//! before the next one starts. The settle sleeps only delay the first poll.

use std::time::Duration;

use hardware::zaber::{Axis, Command};
use tracing::{debug, info};

use crate::stage::{Stage, StageResult};

impl Stage {
    /// Command one axis to `target`, wait roughly its travel time, then poll
    /// until it reports the target.
    pub fn move_axis(&self, axis: Axis, target: i32, settle: Duration) -> StageResult<()> {
        debug!("Moving {} to {}", axis, target);
        self.send(axis, Command::MoveAbsolute, target)?;
        std::thread::sleep(settle);
        self.wait_until_in_position(axis, target)
    }

    /// Lens out, then mirror in.
    pub fn move_to_rest(&self) -> StageResult<()> {
        info!("Moving to rest position");
        self.move_axis(
            Axis::Lens,
            self.positions.lens_rest,
            self.timing.lens_settle(),
        )?;
        self.move_axis(
            Axis::Mirror,
            self.positions.mirror_rest,
            self.timing.mirror_settle(),
        )
    }

    /// Mirror out, then lens in to `focus`.
    pub fn move_to_imaging(&self, focus: i32) -> StageResult<()> {
        info!("Moving to imaging position (focus {})", focus);
        self.move_axis(
            Axis::Mirror,
            self.positions.mirror_imaging,
            self.timing.mirror_settle(),
        )?;
        self.move_axis(Axis::Lens, focus, self.timing.lens_settle())
    }

    /// Move to rest unless both axes already report it.
    pub fn ensure_rest(&self) -> StageResult<()> {
        if self.at_rest()? {
            debug!("Already at rest position");
            return Ok(());
        }
        self.move_to_rest()
    }
}
