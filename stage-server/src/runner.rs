//! Trigger-synchronized experiment runner
//!
//! One runner is started per buffered cycle. It waits for the trigger line to
//! go high, moves to the imaging configuration, waits for the line to drop,
//! and moves back to rest. Waits are sliced into bounded edge waits so the
//! abort flag is seen within one slice; a move already under way is never
//! interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use hardware::trigger::{Edge, TriggerInput};
use tracing::{debug, info};

use crate::stage::{Stage, StageError, StageResult};

/// Trigger input shared with whichever runner is alive.
pub type SharedTrigger = Arc<Mutex<Box<dyn TriggerInput>>>;

/// Level-triggered cancellation flag: once set it stays set until cleared.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a runner finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Full cycle: imaging on the rising edge, rest on the falling edge.
    Completed,
    /// Aborted before the rising edge; nothing moved.
    AbortedBeforeImaging,
    /// Aborted while holding the imaging position.
    AbortedAtImaging,
}

/// Wait until the line reaches the level `edge` leads to, or abort is set.
///
/// Returns false if aborted. Abort wins over a simultaneous edge.
fn wait_for_level(
    trigger: &mut dyn TriggerInput,
    edge: Edge,
    abort: &AbortFlag,
    slice: Duration,
) -> StageResult<bool> {
    let want_high = edge == Edge::Rising;
    while !abort.is_set() && trigger.is_high()? != want_high {
        trigger.wait_for_edge(edge, slice)?;
    }
    Ok(!abort.is_set())
}

/// Run one trigger cycle on the calling thread.
pub fn run_experiment(
    stage: &Stage,
    trigger: &mut dyn TriggerInput,
    abort: &AbortFlag,
    focus: i32,
    slice: Duration,
) -> StageResult<RunOutcome> {
    debug!("Waiting for rising edge");
    if !wait_for_level(trigger, Edge::Rising, abort, slice)? {
        return Ok(RunOutcome::AbortedBeforeImaging);
    }
    stage.move_to_imaging(focus)?;

    debug!("Waiting for falling edge");
    if !wait_for_level(trigger, Edge::Falling, abort, slice)? {
        return Ok(RunOutcome::AbortedAtImaging);
    }
    stage.move_to_rest()?;
    Ok(RunOutcome::Completed)
}

/// Background thread running one experiment cycle.
pub struct ExperimentRunner {
    handle: JoinHandle<StageResult<RunOutcome>>,
}

impl ExperimentRunner {
    pub fn spawn(
        stage: Stage,
        trigger: SharedTrigger,
        abort: AbortFlag,
        focus: i32,
        slice: Duration,
    ) -> StageResult<Self> {
        let handle = std::thread::Builder::new()
            .name("experiment-runner".to_string())
            .spawn(move || {
                let mut trigger = trigger.lock().unwrap_or_else(|e| e.into_inner());
                let outcome = run_experiment(&stage, &mut **trigger, &abort, focus, slice);
                info!("Experiment runner finished: {:?}", outcome);
                outcome
            })
            .map_err(StageError::Spawn)?;
        Ok(Self { handle })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the runner exits.
    pub fn join(self) -> StageResult<RunOutcome> {
        self.handle.join().map_err(|_| StageError::RunnerPanicked)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hardware::mock::SimulatedTrigger;
    use hardware::zaber::{Axis, Command};
    use std::time::Instant;

    use crate::stage::tests::simulated_stage;

    const SLICE: Duration = Duration::from_millis(20);

    fn shared(trigger: &SimulatedTrigger) -> SharedTrigger {
        let input: Box<dyn TriggerInput> = Box::new(trigger.clone());
        Arc::new(Mutex::new(input))
    }

    fn start(
        stage: Stage,
        trigger: &SimulatedTrigger,
        abort: &AbortFlag,
        focus: i32,
    ) -> ExperimentRunner {
        let runner = ExperimentRunner::spawn(stage, shared(trigger), abort.clone(), focus, SLICE);
        runner.unwrap()
    }

    fn wait_for(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for condition");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_abort_before_rising_edge_never_moves() {
        let (stage, bus) = simulated_stage();
        let trigger = SimulatedTrigger::new();
        let abort = AbortFlag::new();

        let runner = start(stage, &trigger, &abort, 40000);
        std::thread::sleep(SLICE * 3);
        assert!(!runner.is_finished());

        abort.set();
        assert_eq!(runner.join().unwrap(), RunOutcome::AbortedBeforeImaging);
        assert!(bus.sent_commands(Command::MoveAbsolute).is_empty());
    }

    #[test]
    fn test_full_cycle() {
        let (stage, bus) = simulated_stage();
        bus.set_position(Axis::Mirror, 76346);
        let trigger = SimulatedTrigger::new();
        let abort = AbortFlag::new();

        let runner = start(stage, &trigger, &abort, 40000);

        trigger.set_high();
        wait_for(|| bus.position(Axis::Lens) == 40000);
        assert_eq!(bus.position(Axis::Mirror), 30000);

        trigger.set_low();
        assert_eq!(runner.join().unwrap(), RunOutcome::Completed);
        assert_eq!(bus.position(Axis::Lens), 0);
        assert_eq!(bus.position(Axis::Mirror), 76346);

        let moves: Vec<(u8, i32)> = bus
            .sent_commands(Command::MoveAbsolute)
            .iter()
            .map(|p| (p.device, p.data))
            .collect();
        assert_eq!(moves, vec![(1, 30000), (2, 40000), (2, 0), (1, 76346)]);
    }

    #[test]
    fn test_abort_at_imaging_skips_rest_move() {
        let (stage, bus) = simulated_stage();
        let trigger = SimulatedTrigger::new();
        let abort = AbortFlag::new();

        let runner = start(stage, &trigger, &abort, 1234);
        trigger.set_high();
        wait_for(|| bus.position(Axis::Lens) == 1234);

        abort.set();
        assert_eq!(runner.join().unwrap(), RunOutcome::AbortedAtImaging);
        assert_eq!(bus.sent_commands(Command::MoveAbsolute).len(), 2);
    }

    #[test]
    fn test_line_already_high_starts_immediately() {
        let (stage, bus) = simulated_stage();
        let mut trigger = SimulatedTrigger::new();
        trigger.set_high();
        let abort = AbortFlag::new();

        let driver = trigger.clone();
        let lowering = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            driver.set_low();
        });
        let outcome = run_experiment(&stage, &mut trigger, &abort, 500, SLICE).unwrap();
        lowering.join().unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(bus.sent_commands(Command::MoveAbsolute).len(), 4);
    }

    #[test]
    fn test_abort_wins_over_edge() {
        let (stage, bus) = simulated_stage();
        let mut trigger = SimulatedTrigger::new();
        trigger.set_high();
        let abort = AbortFlag::new();
        abort.set();

        let outcome = run_experiment(&stage, &mut trigger, &abort, 500, SLICE).unwrap();
        assert_eq!(outcome, RunOutcome::AbortedBeforeImaging);
        assert!(bus.sent().is_empty());
    }

    #[test]
    fn test_abort_flag_is_level_triggered() {
        let abort = AbortFlag::new();
        assert!(!abort.is_set());
        abort.set();
        abort.set();
        assert!(abort.is_set());
        assert!(abort.clone().is_set());
        abort.clear();
        assert!(!abort.is_set());
    }
}
