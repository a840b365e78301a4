//! Real-time pacing for the emulation thread.
//!
//! Two clocks share one issue point. The throttle clock holds instruction
//! issue to the configured CPU frequency using the cycle cost of the last
//! instruction; the interrupt clock fires `RST 1` and `RST 2` alternately
//! once per half frame while the CPU has interrupts enabled.
//!
//! The loop itself only blocks at the top of an iteration, either sleeping
//! off cycle debt or waiting in [`Control`] while paused.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::emulator::{CpuSnapshot, Emulator};
use crate::error::EmulatorError;
use crate::io::SharedLatches;
use crate::memory::VideoRam;
use crate::metrics::{record_throttle_sleep, update_cpu_state};

/// Time source for the scheduler.
pub trait Clock: Send + 'static {
    /// Time since an arbitrary fixed origin.
    fn now(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    // Thread sleep alone overshoots by far more than one instruction time.
    fn sleep(&self, duration: Duration) {
        spin_sleep::sleep(duration);
    }
}

/// Virtual time. `sleep` advances it instantly; clones share one timeline.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Paused,
    /// Paused, with one instruction granted.
    Stepping,
    Stopped,
}

/// Run state shared between the emulation thread and its controllers.
pub struct Control {
    state: Mutex<RunState>,
    changed: Condvar,
}

impl Control {
    pub fn new(initial: RunState) -> Self {
        Control {
            state: Mutex::new(initial),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, allowed: impl Fn(RunState) -> bool, to: RunState) -> bool {
        let mut state = self.lock();
        if !allowed(*state) {
            return false;
        }
        *state = to;
        self.changed.notify_all();
        true
    }

    pub fn state(&self) -> RunState {
        *self.lock()
    }

    pub fn pause(&self) -> bool {
        let paused = self.transition(|s| s == RunState::Running, RunState::Paused);
        if paused {
            info!("emulation paused");
        }
        paused
    }

    pub fn resume(&self) -> bool {
        let resumed = self.transition(
            |s| s == RunState::Paused || s == RunState::Stepping,
            RunState::Running,
        );
        if resumed {
            info!("emulation resumed");
        }
        resumed
    }

    /// Grant one instruction. Only accepted while paused.
    pub fn step(&self) -> bool {
        let accepted = self.transition(|s| s == RunState::Paused, RunState::Stepping);
        if !accepted {
            debug!("step ignored, emulation is not paused");
        }
        accepted
    }

    pub fn stop(&self) {
        if self.transition(|s| s != RunState::Stopped, RunState::Stopped) {
            info!("emulation stopping");
        }
    }

    /// Called by the loop after a granted step. A `resume` that arrived
    /// during the step wins.
    pub fn finish_step(&self) {
        self.transition(|s| s == RunState::Stepping, RunState::Paused);
    }

    /// Block while paused; returns the state the loop should act on.
    pub fn wait_for_turn(&self) -> RunState {
        let state = self.lock();
        let state = self
            .changed
            .wait_while(state, |s| *s == RunState::Paused)
            .unwrap_or_else(PoisonError::into_inner);
        *state
    }

    /// Block until a granted step has been executed.
    pub fn wait_until_settled(&self) -> RunState {
        let state = self.lock();
        let state = self
            .changed
            .wait_while(state, |s| *s == RunState::Stepping)
            .unwrap_or_else(PoisonError::into_inner);
        *state
    }
}

/// What one [`Scheduler::tick`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tick {
    /// Cycle cost of the instruction issued, if one was due.
    pub executed: Option<u32>,
    /// Vector of the interrupt delivered, if one fired.
    pub interrupt: Option<u8>,
}

pub struct Scheduler<C: Clock> {
    clock: C,
    ns_per_cycle: u64,
    interrupt_interval: Duration,
    catch_up_limit: Duration,
    last_instruction: Duration,
    cycle_debt: u64,
    last_interrupt: Duration,
    // 0 selects vector 1, 1 selects vector 2
    toggle: u8,
}

impl<C: Clock> Scheduler<C> {
    pub fn new(clock: C, emulator: &Emulator) -> Self {
        let config = emulator.config();
        let now = clock.now();
        Scheduler {
            ns_per_cycle: config.ns_per_cycle(),
            interrupt_interval: config.interrupt_interval(),
            catch_up_limit: config.catch_up_limit(),
            last_instruction: now,
            cycle_debt: 0,
            last_interrupt: now,
            toggle: 0,
            clock,
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn next_vector(&self) -> u8 {
        self.toggle + 1
    }

    /// Issue at most one instruction and at most one interrupt. When neither
    /// was due, sleep until the next instruction is.
    pub fn tick(&mut self, emulator: &mut Emulator) -> Result<Tick, EmulatorError> {
        let now = self.clock.now();
        let mut tick = Tick::default();

        let due = self.last_instruction + Duration::from_nanos(self.cycle_debt * self.ns_per_cycle);
        if now >= due {
            // Never try to win back more than the catch-up limit.
            self.last_instruction = due.max(now.saturating_sub(self.catch_up_limit));
            let cycles = emulator.step()?;
            self.cycle_debt = cycles as u64;
            tick.executed = Some(cycles);
        }

        if now.saturating_sub(self.last_interrupt) >= self.interrupt_interval
            && emulator.cpu.interrupts_enabled
        {
            let vector = self.next_vector();
            emulator.interrupt(vector);
            self.last_interrupt = now;
            self.toggle ^= 1;
            tick.interrupt = Some(vector);
        }

        if tick == Tick::default() {
            let wait = due.saturating_sub(now);
            self.clock.sleep(wait);
            record_throttle_sleep(wait);
        }
        Ok(tick)
    }

    /// Execute one instruction immediately, ignoring the throttle. Used for
    /// debug steps while paused.
    pub fn step_now(&mut self, emulator: &mut Emulator) -> Result<u32, EmulatorError> {
        let cycles = emulator.step()?;
        self.cycle_debt = 0;
        Ok(cycles)
    }

    /// Shift both checkpoints forward by time spent suspended, so a resume
    /// does not fire a burst of stale interrupts or instructions.
    pub fn rebase(&mut self, suspended_for: Duration) {
        self.last_instruction += suspended_for;
        self.last_interrupt += suspended_for;
    }
}

/// Cloneable access to a running emulator for other threads and tasks.
#[derive(Clone)]
pub struct Remote {
    pub id: String,
    pub control: Arc<Control>,
    pub latches: Arc<SharedLatches>,
    pub video: VideoRam,
    state: watch::Receiver<CpuSnapshot>,
}

impl Remote {
    /// Most recently published CPU state.
    pub fn snapshot(&self) -> CpuSnapshot {
        self.state.borrow().clone()
    }
}

/// Owner of the emulation thread. Dropping it stops the thread and waits
/// for it.
pub struct EmulatorHandle {
    remote: Remote,
    thread: Option<JoinHandle<Result<(), EmulatorError>>>,
}

impl EmulatorHandle {
    pub fn spawn<C: Clock>(emulator: Emulator, clock: C) -> Result<Self, EmulatorError> {
        Self::spawn_with_state(emulator, clock, RunState::Running)
    }

    pub fn spawn_with_state<C: Clock>(
        emulator: Emulator,
        clock: C,
        initial: RunState,
    ) -> Result<Self, EmulatorError> {
        let control = Arc::new(Control::new(initial));
        let (state_tx, state_rx) = watch::channel(emulator.snapshot());
        let remote = Remote {
            id: emulator.id().to_string(),
            control: Arc::clone(&control),
            latches: emulator.latches(),
            video: emulator.video_ram(),
            state: state_rx,
        };

        let name: String = format!("i8080-{}", emulator.id()).chars().take(15).collect();
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || run(emulator, clock, control, state_tx))?;

        Ok(EmulatorHandle {
            remote,
            thread: Some(thread),
        })
    }

    pub fn remote(&self) -> Remote {
        self.remote.clone()
    }

    pub fn control(&self) -> &Control {
        &self.remote.control
    }

    pub fn pause(&self) -> bool {
        self.remote.control.pause()
    }

    pub fn resume(&self) -> bool {
        self.remote.control.resume()
    }

    pub fn step(&self) -> bool {
        self.remote.control.step()
    }

    pub fn stop(&self) {
        self.remote.control.stop()
    }

    /// Wait for the emulation thread to finish and return how it ended.
    /// Does not stop it; call [`stop`](Self::stop) first for that.
    pub fn join(mut self) -> Result<(), EmulatorError> {
        self.join_thread()
    }

    fn join_thread(&mut self) -> Result<(), EmulatorError> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| EmulatorError::ThreadPanicked)?,
            None => Ok(()),
        }
    }
}

impl Drop for EmulatorHandle {
    fn drop(&mut self) {
        self.stop();
        if let Err(err) = self.join_thread() {
            debug!("emulation thread ended with: {}", err);
        }
    }
}

fn publish(state: &watch::Sender<CpuSnapshot>, emulator: &Emulator) {
    let snapshot = emulator.snapshot();
    update_cpu_state(&snapshot);
    state.send_replace(snapshot);
}

fn run<C: Clock>(
    mut emulator: Emulator,
    clock: C,
    control: Arc<Control>,
    state: watch::Sender<CpuSnapshot>,
) -> Result<(), EmulatorError> {
    let mut scheduler = Scheduler::new(clock, &emulator);
    info!("emulation thread started for {}", emulator.id());

    let result = loop {
        let outcome = match control.state() {
            RunState::Stopped => break Ok(()),
            RunState::Running => scheduler.tick(&mut emulator).map(|tick| {
                if tick.interrupt.is_some() {
                    publish(&state, &emulator);
                }
            }),
            RunState::Stepping => scheduler.step_now(&mut emulator).map(|_| {
                publish(&state, &emulator);
                control.finish_step();
            }),
            RunState::Paused => {
                publish(&state, &emulator);
                let paused_at = scheduler.clock().now();
                control.wait_for_turn();
                let paused_for = scheduler.clock().now().saturating_sub(paused_at);
                scheduler.rebase(paused_for);
                Ok(())
            }
        };
        if let Err(err) = outcome {
            break Err(err);
        }
    };

    publish(&state, &emulator);
    match &result {
        Ok(()) => info!("emulation thread for {} stopped", emulator.id()),
        Err(err) => {
            error!("emulation halted: {}", err);
            control.stop();
        }
    }
    result
}
