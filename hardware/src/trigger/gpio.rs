//! Trigger input on a Linux GPIO character device.
//!
//! The line is requested as a plain input and sampled by level; edges are
//! found by comparing successive samples.

use std::time::Duration;

use gpiod::{Bias, Chip, Input, Lines, Options};
use tracing::debug;

use super::{sample_for_edge, Edge, TriggerError, TriggerInput, TriggerResult};

const CONSUMER: &str = "remote-stage-trigger";

/// Interval between level samples while waiting for an edge.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(2);

/// Trigger line read through `/dev/gpiochipN` with pull-down bias.
pub struct GpioTrigger {
    lines: Lines<Input>,
}

impl GpioTrigger {
    /// Request `line` on `chip` (e.g. `/dev/gpiochip0`, line 23).
    pub fn open(path: &str, line: u32) -> TriggerResult<Self> {
        let chip = Chip::new(path).map_err(|e| gpio_error(path, e))?;
        let options = Options::input([line]).bias(Bias::PullDown).consumer(CONSUMER);
        let lines = chip
            .request_lines(options)
            .map_err(|e| gpio_error(&format!("line {line}"), e))?;

        debug!("Requested trigger line {} on {}", line, path);
        Ok(Self { lines })
    }

    fn level(&self) -> TriggerResult<bool> {
        let [level] = self
            .lines
            .get_values([false; 1])
            .map_err(|e| TriggerError::Gpio(e.to_string()))?;
        Ok(level)
    }
}

fn gpio_error(what: &str, e: std::io::Error) -> TriggerError {
    TriggerError::Gpio(format!("{what}: {e}"))
}

impl TriggerInput for GpioTrigger {
    fn is_high(&mut self) -> TriggerResult<bool> {
        self.level()
    }

    fn wait_for_edge(&mut self, edge: Edge, timeout: Duration) -> TriggerResult<bool> {
        sample_for_edge(|| self.level(), edge, timeout, SAMPLE_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_chip_is_gpio_error() {
        let result = GpioTrigger::open("/dev/gpiochip-does-not-exist", 23);
        match result {
            Err(TriggerError::Gpio(message)) => {
                assert!(message.starts_with("/dev/gpiochip-does-not-exist"));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("opened a chip that does not exist"),
        }
    }
}
