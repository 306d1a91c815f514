//! Digital trigger input
//!
//! The experiment sequencer raises a single TTL line for the duration of a
//! shot. The stage controller only needs the line level and the ability to
//! block, for a bounded time, until the next edge.

#[cfg(all(target_os = "linux", feature = "gpio"))]
mod gpio;

#[cfg(all(target_os = "linux", feature = "gpio"))]
pub use gpio::GpioTrigger;

use std::time::{Duration, Instant};

use thiserror::Error;

/// Direction of a level change on the trigger line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
}

/// Errors from a trigger input.
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// GPIO character device request or read failed.
    #[error("GPIO error: {0}")]
    Gpio(String),
}

pub type TriggerResult<T> = Result<T, TriggerError>;

/// A single digital input line.
pub trait TriggerInput: Send {
    /// Current level of the line.
    fn is_high(&mut self) -> TriggerResult<bool>;

    /// Block until `edge` occurs or `timeout` elapses.
    ///
    /// Returns `true` if the edge was seen. Implementations must return
    /// within roughly `timeout` so callers can check for cancellation
    /// between waits.
    fn wait_for_edge(&mut self, edge: Edge, timeout: Duration) -> TriggerResult<bool>;
}

impl<T: TriggerInput + ?Sized> TriggerInput for Box<T> {
    fn is_high(&mut self) -> TriggerResult<bool> {
        (**self).is_high()
    }

    fn wait_for_edge(&mut self, edge: Edge, timeout: Duration) -> TriggerResult<bool> {
        (**self).wait_for_edge(edge, timeout)
    }
}

/// Edge between two successive level samples, if the level changed.
pub fn transition(previous: bool, current: bool) -> Option<Edge> {
    match (previous, current) {
        (false, true) => Some(Edge::Rising),
        (true, false) => Some(Edge::Falling),
        _ => None,
    }
}

/// Wait for `edge` on a line that can only be read by level.
///
/// `read` is sampled every `interval` until the level changes in the
/// requested direction or `timeout` elapses. Pulses shorter than `interval`
/// can be missed, but the level itself is never misreported.
pub fn sample_for_edge<F>(
    mut read: F,
    edge: Edge,
    timeout: Duration,
    interval: Duration,
) -> TriggerResult<bool>
where
    F: FnMut() -> TriggerResult<bool>,
{
    let deadline = Instant::now() + timeout;
    let mut previous = read()?;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        std::thread::sleep(interval.min(remaining));

        let current = read()?;
        if transition(previous, current) == Some(edge) {
            return Ok(true);
        }
        previous = current;
    }
}
