//! Simulated stage bus and trigger line
//!
//! [`SimulatedBus`] speaks the Zaber binary protocol for a mirror stage and a
//! lens stage so the controller can run without hardware, and records every
//! request packet for inspection. [`SimulatedTrigger`] is a trigger line whose
//! edges are raised from another thread.
//!
//! Both are cheap cloneable handles onto shared state: hand one clone to the
//! code under test and keep another to drive and observe it.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::trigger::{Edge, TriggerInput, TriggerResult};
use crate::zaber::{Axis, Command, Packet, DEVICE_MODE, PACKET_LEN};

/// Device mode bit reported once a stage has been homed.
pub const HOMED_MODE_BIT: u32 = 7;

/// Error code a device returns for a command it does not implement.
const ERROR_COMMAND_INVALID: i32 = 64;

#[derive(Debug, Clone)]
struct SimulatedStage {
    position: i32,
    target: i32,
    polls_remaining: u32,
    mode: i32,
}

impl SimulatedStage {
    fn new(homed: bool) -> Self {
        Self {
            position: 0,
            target: 0,
            polls_remaining: 0,
            mode: if homed { 1 << HOMED_MODE_BIT } else { 0 },
        }
    }
}

#[derive(Debug)]
struct BusState {
    stages: HashMap<u8, SimulatedStage>,
    /// Reply bytes waiting for the host to read
    rx: VecDeque<u8>,
    /// Host bytes not yet forming a whole packet
    pending: Vec<u8>,
    /// Every request packet, in order
    sent: Vec<Packet>,
    polls_per_move: u32,
    read_delay: Duration,
}

impl BusState {
    fn reply(&mut self, packet: Packet) {
        self.rx.extend(packet.to_bytes());
    }

    fn handle(&mut self, request: Packet) {
        self.sent.push(request);
        let polls_per_move = self.polls_per_move;
        let Some(stage) = self.stages.get_mut(&request.device) else {
            return;
        };

        let reply = match request.command {
            c if c == Command::Home.code() => {
                stage.position = 0;
                stage.target = 0;
                stage.polls_remaining = 0;
                stage.mode |= 1 << HOMED_MODE_BIT;
                Packet::new(request.device, c, 0)
            }
            c if c == Command::MoveAbsolute.code() => {
                stage.target = request.data;
                stage.polls_remaining = polls_per_move;
                if polls_per_move == 0 {
                    stage.position = request.data;
                }
                Packet::new(request.device, c, request.data)
            }
            c if c == Command::ReturnCurrentPosition.code() => {
                if stage.polls_remaining > 0 {
                    stage.polls_remaining -= 1;
                }
                if stage.polls_remaining == 0 {
                    stage.position = stage.target;
                }
                Packet::new(request.device, c, stage.position)
            }
            c if c == Command::ReturnSetting.code() => {
                // Devices answer with the setting number as the reply command
                let value = if request.data == DEVICE_MODE {
                    stage.mode
                } else {
                    0
                };
                Packet::new(request.device, request.data as u8, value)
            }
            _ => Packet::new(request.device, Command::Error.code(), ERROR_COMMAND_INVALID),
        };
        self.reply(reply);
    }
}

/// Two simulated Zaber stages on one bus.
#[derive(Debug, Clone)]
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBus {
    /// Both stages homed and sitting at position 0; moves complete instantly.
    pub fn new() -> Self {
        Self::with_homed(true)
    }

    /// Both stages at position 0, homed or not.
    pub fn with_homed(homed: bool) -> Self {
        let stages = [Axis::Mirror, Axis::Lens]
            .into_iter()
            .map(|axis| (axis.device(), SimulatedStage::new(homed)))
            .collect();
        Self {
            state: Arc::new(Mutex::new(BusState {
                stages,
                rx: VecDeque::new(),
                pending: Vec::new(),
                sent: Vec::new(),
                polls_per_move: 0,
                read_delay: Duration::from_millis(1),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of position polls a move takes to complete.
    pub fn set_polls_per_move(&self, polls: u32) {
        self.lock().polls_per_move = polls;
    }

    /// How long a read on an empty bus blocks before timing out.
    pub fn set_read_delay(&self, delay: Duration) {
        self.lock().read_delay = delay;
    }

    /// Place a stage at `position` with no move in progress.
    pub fn set_position(&self, axis: Axis, position: i32) {
        if let Some(stage) = self.lock().stages.get_mut(&axis.device()) {
            stage.position = position;
            stage.target = position;
            stage.polls_remaining = 0;
        }
    }

    pub fn set_homed(&self, axis: Axis, homed: bool) {
        if let Some(stage) = self.lock().stages.get_mut(&axis.device()) {
            if homed {
                stage.mode |= 1 << HOMED_MODE_BIT;
            } else {
                stage.mode &= !(1 << HOMED_MODE_BIT);
            }
        }
    }

    /// Current physical position of a stage.
    pub fn position(&self, axis: Axis) -> i32 {
        self.lock()
            .stages
            .get(&axis.device())
            .map(|s| s.position)
            .unwrap_or_default()
    }

    pub fn is_homed(&self, axis: Axis) -> bool {
        self.lock()
            .stages
            .get(&axis.device())
            .map(|s| (s.mode >> HOMED_MODE_BIT) & 1 == 1)
            .unwrap_or(false)
    }

    /// Queue an unsolicited packet for the host to read.
    pub fn inject(&self, packet: Packet) {
        self.lock().reply(packet);
    }

    /// Every request packet written so far.
    pub fn sent(&self) -> Vec<Packet> {
        self.lock().sent.clone()
    }

    /// Requests carrying `command`, in order.
    pub fn sent_commands(&self, command: Command) -> Vec<Packet> {
        self.lock()
            .sent
            .iter()
            .filter(|p| p.command == command.code())
            .copied()
            .collect()
    }

    pub fn clear_sent(&self) {
        self.lock().sent.clear();
    }
}

impl Write for SimulatedBus {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        state.pending.extend_from_slice(buf);
        while state.pending.len() >= PACKET_LEN {
            let mut bytes = [0u8; PACKET_LEN];
            bytes.copy_from_slice(&state.pending[..PACKET_LEN]);
            state.pending.drain(..PACKET_LEN);
            state.handle(Packet::from_bytes(&bytes));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for SimulatedBus {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let delay = {
            let mut state = self.lock();
            if !state.rx.is_empty() {
                let n = buf.len().min(state.rx.len());
                for (dst, src) in buf.iter_mut().zip(state.rx.drain(..n)) {
                    *dst = src;
                }
                return Ok(n);
            }
            state.read_delay
        };
        std::thread::sleep(delay);
        Err(io::Error::new(io::ErrorKind::TimedOut, "simulated read timeout"))
    }
}

#[derive(Debug, Default)]
struct TriggerState {
    level: bool,
    rising: u64,
    falling: u64,
}

/// A trigger line driven by [`set_high`](Self::set_high) and
/// [`set_low`](Self::set_low).
#[derive(Debug, Clone, Default)]
pub struct SimulatedTrigger {
    shared: Arc<(Mutex<TriggerState>, Condvar)>,
}

impl SimulatedTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TriggerState> {
        self.shared.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drive the line high, producing a rising edge if it was low.
    pub fn set_high(&self) {
        let mut state = self.lock();
        if !state.level {
            state.level = true;
            state.rising += 1;
            self.shared.1.notify_all();
        }
    }

    /// Drive the line low, producing a falling edge if it was high.
    pub fn set_low(&self) {
        let mut state = self.lock();
        if state.level {
            state.level = false;
            state.falling += 1;
            self.shared.1.notify_all();
        }
    }

    pub fn level(&self) -> bool {
        self.lock().level
    }
}

impl TriggerInput for SimulatedTrigger {
    fn is_high(&mut self) -> TriggerResult<bool> {
        Ok(self.level())
    }

    fn wait_for_edge(&mut self, edge: Edge, timeout: Duration) -> TriggerResult<bool> {
        let count = |s: &TriggerState| match edge {
            Edge::Rising => s.rising,
            Edge::Falling => s.falling,
        };

        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        let start = count(&state);
        while count(&state) == start {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            state = self
                .shared
                .1
                .wait_timeout(state, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zaber::SerialLink;

    const POSITION: u8 = Command::ReturnCurrentPosition.code();

    #[test]
    fn test_position_reply() {
        let bus = SimulatedBus::new();
        bus.set_position(Axis::Lens, 1234);
        let mut link = SerialLink::new(bus.clone());

        link.send(2, POSITION, 0).unwrap();
        let reply = link.receive().unwrap().unwrap();
        assert_eq!(reply, Packet::new(2, 60, 1234));
        assert_eq!(bus.sent(), vec![Packet::new(2, 60, 0)]);
    }

    #[test]
    fn test_move_takes_configured_polls() {
        let bus = SimulatedBus::new();
        bus.set_polls_per_move(3);
        let mut link = SerialLink::new(bus.clone());

        link.send(1, Command::MoveAbsolute.code(), 500).unwrap();
        assert_eq!(link.receive().unwrap(), Some(Packet::new(1, 20, 500)));

        let mut seen = Vec::new();
        for _ in 0..3 {
            link.send(1, POSITION, 0).unwrap();
            seen.push(link.receive().unwrap().unwrap().data);
        }
        assert_eq!(seen, vec![0, 0, 500]);
    }

    #[test]
    fn test_home_sets_mode_bit() {
        let bus = SimulatedBus::with_homed(false);
        bus.set_position(Axis::Mirror, 999);
        let mut link = SerialLink::new(bus.clone());

        let setting = Command::ReturnSetting.code();
        link.send(1, setting, DEVICE_MODE).unwrap();
        let reply = link.receive().unwrap().unwrap();
        assert_eq!(reply.command, DEVICE_MODE as u8);
        assert_eq!((reply.data >> HOMED_MODE_BIT) & 1, 0);

        link.send(1, Command::Home.code(), 0).unwrap();
        assert!(bus.is_homed(Axis::Mirror));
        assert_eq!(bus.position(Axis::Mirror), 0);
    }

    #[test]
    fn test_empty_bus_times_out() {
        let mut link = SerialLink::new(SimulatedBus::new());
        assert!(link.receive().unwrap().is_none());
    }

    #[test]
    fn test_trigger_edges() {
        let trigger = SimulatedTrigger::new();
        let mut input = trigger.clone();

        assert!(!input
            .wait_for_edge(Edge::Rising, Duration::from_millis(10))
            .unwrap());

        let driver = trigger.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            driver.set_high();
        });
        assert!(input
            .wait_for_edge(Edge::Rising, Duration::from_secs(5))
            .unwrap());
        assert!(input.is_high().unwrap());
        handle.join().unwrap();

        // Setting high again is not an edge
        trigger.set_high();
        assert!(!input
            .wait_for_edge(Edge::Rising, Duration::from_millis(10))
            .unwrap());
    }
}
