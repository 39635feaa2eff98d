// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use log::{info, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use time::OffsetDateTime;

use crate::config::RepositoryConfig;
use crate::error::SchedulerError;
use crate::scheduler::time_range::{self, TimeRange};
use crate::scheduler::wakeup::{LoopThread, WakeupSignal};

const ON_HOLD_WAIT: Duration = Duration::from_secs(60 * 60);

/// Reported scheduler state. `Jammed` and `OnHold` are never stored, they are
/// derived from `Online` when queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerState {
    Online,
    Opening,
    Closing,
    Offline,
    Jammed,
    OnHold,
}

impl SchedulerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SchedulerState::Online,
            1 => SchedulerState::Opening,
            2 => SchedulerState::Closing,
            _ => SchedulerState::Offline,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SchedulerState::Online => 0,
            SchedulerState::Opening => 1,
            SchedulerState::Closing => 2,
            _ => 3,
        }
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchedulerState::Online => "ONLINE",
            SchedulerState::Opening => "OPENING",
            SchedulerState::Closing => "CLOSING",
            SchedulerState::Offline => "OFFLINE",
            SchedulerState::Jammed => "JAMMED",
            SchedulerState::OnHold => "ONHOLD",
        };
        f.write_str(s)
    }
}

/// What the loop should do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NextStep {
    /// Not started yet.
    Init,
    /// Step again after the minimum wait.
    Continue,
    /// Step again after the configured delay.
    Delay,
    /// Leave the loop for good.
    Abort,
}

/// Handed to `Step::next_step` so a step can sleep on the scheduler's own
/// wakeup signal.
pub struct StepContext<'a> {
    signal: &'a WakeupSignal,
}

impl StepContext<'_> {
    pub fn wait_for(&self, duration: Duration) -> bool {
        self.signal.wait_for(duration)
    }

    pub fn is_running(&self) -> bool {
        self.signal.is_running()
    }
}

/// The work a `PollingScheduler` performs periodically.
pub trait Step: Send + Sync + 'static {
    fn next_step(&self, ctx: &StepContext<'_>) -> anyhow::Result<NextStep>;

    /// Called once on the loop thread before the first step.
    fn initialize(&self) {}

    /// Called once each time the scheduler enters on-hold mode.
    fn on_hold(&self) {}

    /// Free-form description of what the scheduler is currently busy with.
    fn activity(&self) -> Option<String> {
        None
    }
}

#[derive(Debug)]
struct Timing {
    delay: Duration,
    minimum_wait: Duration,
    jammed_threshold: Duration,
    step_start: Instant,
    last_step: Duration,
    next_step: NextStep,
    started_at: Option<OffsetDateTime>,
}

struct Shared {
    name: String,
    signal: Arc<WakeupSignal>,
    state: AtomicU8,
    initialized: AtomicBool,
    timing: Mutex<Timing>,
    time_ranges: RwLock<Vec<TimeRange>>,
}

impl Shared {
    fn timing(&self) -> MutexGuard<'_, Timing> {
        self.timing.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn stored_state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn is_restricted(&self) -> bool {
        let ranges = self.time_ranges.read().unwrap_or_else(|p| p.into_inner());
        time_range::is_restricted(&ranges, time_range::local_time_of_day())
    }
}

/// A single dedicated loop thread that calls `Step::next_step` periodically.
///
/// ```text
///  Offline --start--> Opening --loop--> Online --shutdown--> Closing --exit--> Offline
/// ```
pub struct PollingScheduler {
    shared: Arc<Shared>,
    thread: Mutex<Option<LoopThread>>,
    shutdown_timeout: Duration,
}

impl PollingScheduler {
    pub fn new(name: impl Into<String>, config: &RepositoryConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                signal: Arc::new(WakeupSignal::new()),
                state: AtomicU8::new(SchedulerState::Offline.as_u8()),
                initialized: AtomicBool::new(false),
                timing: Mutex::new(Timing {
                    delay: config.delay(),
                    minimum_wait: config.minimum_wait(),
                    jammed_threshold: config.jammed_threshold(),
                    step_start: Instant::now(),
                    last_step: Duration::ZERO,
                    next_step: NextStep::Init,
                    started_at: None,
                }),
                time_ranges: RwLock::new(config.time_ranges.clone()),
            }),
            thread: Mutex::new(None),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The signal the loop sleeps on; repositories wake it on `put`.
    pub fn signal(&self) -> Arc<WakeupSignal> {
        self.shared.signal.clone()
    }

    pub fn start(&self, step: Arc<dyn Step>) -> Result<(), SchedulerError> {
        let mut thread = self.thread.lock().unwrap_or_else(|p| p.into_inner());
        if thread.is_some() {
            return Err(SchedulerError::AlreadyStarted(self.shared.name.clone()));
        }
        if !self.shared.signal.is_running() {
            return Err(SchedulerError::ShutDown(self.shared.name.clone()));
        }
        self.shared.timing().started_at = Some(OffsetDateTime::now_utc());
        self.shared.set_state(SchedulerState::Opening);
        let shared = self.shared.clone();
        match LoopThread::spawn(self.shared.name.clone(), move || run_loop(shared, step)) {
            Ok(handle) => {
                *thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(SchedulerState::Offline);
                Err(e)
            }
        }
    }

    /// Stops the loop cooperatively and waits (bounded) for it to exit.
    pub fn shutdown(&self) {
        if self.shared.stored_state() != SchedulerState::Offline {
            self.shared.set_state(SchedulerState::Closing);
        }
        self.shared.signal.shutdown();
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(thread) = thread {
            if !thread.join_timeout(self.shutdown_timeout) {
                warn!("Scheduler {} is still busy after shutdown", self.shared.name);
            }
        }
    }

    pub fn wakeup(&self) {
        self.shared.signal.wakeup();
    }

    pub fn set_on_hold(&self, hold: bool) {
        self.shared.signal.set_on_hold(hold);
        if !hold {
            self.wakeup();
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.signal.is_running()
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::SeqCst)
    }

    pub fn is_sleeping(&self) -> bool {
        self.shared.signal.is_sleeping()
    }

    pub fn is_on_hold(&self) -> bool {
        self.shared.stored_state() == SchedulerState::Online && self.shared.signal.is_on_hold()
    }

    pub fn is_restricted(&self) -> bool {
        self.shared.is_restricted()
    }

    pub fn is_jammed(&self) -> bool {
        self.shared.stored_state() == SchedulerState::Online
            && !self.is_sleeping()
            && !self.is_restricted()
            && self.step_time() > self.jammed_threshold()
    }

    pub fn state(&self) -> SchedulerState {
        if self.is_jammed() {
            SchedulerState::Jammed
        } else if self.is_on_hold() {
            SchedulerState::OnHold
        } else {
            self.shared.stored_state()
        }
    }

    /// Time spent in the current step, or since the last wakeup if that came
    /// later. Wakeups from a repository's `put` count too.
    pub fn step_time(&self) -> Duration {
        let step_start = self.shared.timing().step_start;
        match self.shared.signal.last_wakeup() {
            Some(woken) if woken > step_start => woken.elapsed(),
            _ => step_start.elapsed(),
        }
    }

    pub fn last_step_time(&self) -> Duration {
        self.shared.timing().last_step
    }

    pub fn next_directive(&self) -> NextStep {
        self.shared.timing().next_step
    }

    pub fn started_at(&self) -> Option<OffsetDateTime> {
        self.shared.timing().started_at
    }

    pub fn delay(&self) -> Duration {
        self.shared.timing().delay
    }

    pub fn set_delay(&self, delay: Duration) {
        self.shared.timing().delay = delay;
    }

    pub fn jammed_threshold(&self) -> Duration {
        self.shared.timing().jammed_threshold
    }

    pub fn set_jammed_threshold(&self, threshold: Duration) {
        self.shared.timing().jammed_threshold = threshold;
    }

    pub fn set_time_ranges(&self, ranges: Vec<TimeRange>) {
        *self
            .shared
            .time_ranges
            .write()
            .unwrap_or_else(|p| p.into_inner()) = ranges;
    }

    pub fn time_ranges(&self) -> Vec<TimeRange> {
        self.shared
            .time_ranges
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// One-line status for an external monitor, e.g. `ONLINE (sweeping)`.
    pub fn monitor_status(&self, activity: Option<String>) -> String {
        let status = if self.is_on_hold() || self.is_restricted() {
            "ONHOLD"
        } else if self.is_jammed() {
            "JAMMED"
        } else {
            "ONLINE"
        };
        match activity {
            Some(activity) if !activity.is_empty() => format!("{status} ({activity})"),
            _ => status.to_string(),
        }
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        if self.shared.stored_state() != SchedulerState::Offline {
            self.shutdown();
        }
    }
}

fn run_loop(shared: Arc<Shared>, step: Arc<dyn Step>) {
    let signal = shared.signal.clone();
    info!(
        "Scheduler {} initialized (frequency of {:?})",
        shared.name,
        shared.timing().delay
    );
    step.initialize();
    shared.initialized.store(true, Ordering::SeqCst);
    shared.set_state(SchedulerState::Online);
    shared.timing().next_step = NextStep::Delay;
    let ctx = StepContext { signal: &signal };
    let mut on_hold = false;
    while signal.is_running() {
        let (delay, minimum_wait, directive) = {
            let timing = shared.timing();
            (timing.delay, timing.minimum_wait, timing.next_step)
        };
        if shared.is_restricted() && !delay.is_zero() {
            signal.wait_for(delay);
            continue;
        }
        if directive == NextStep::Delay && !delay.is_zero() {
            signal.wait_for(delay);
        } else if directive == NextStep::Continue && !minimum_wait.is_zero() {
            signal.wait_for(minimum_wait);
        }
        if !signal.is_running() {
            break;
        }
        if signal.is_on_hold() {
            if !on_hold {
                info!("Scheduler {} switch to onHold mode", shared.name);
                on_hold = true;
                step.on_hold();
            }
            // a full hour on hold still lets one step through
            if signal.wait_for(ON_HOLD_WAIT) {
                continue;
            }
        } else {
            on_hold = false;
        }
        shared.timing().step_start = Instant::now();
        let next = match step.next_step(&ctx) {
            Ok(next) => next,
            Err(e) => {
                warn!("Scheduler {}: step failed: {e:#}", shared.name);
                NextStep::Delay
            }
        };
        {
            let mut timing = shared.timing();
            timing.last_step = timing.step_start.elapsed();
            timing.next_step = next;
        }
        if next == NextStep::Abort {
            info!("Scheduler {} aborted by its step", shared.name);
            break;
        }
    }
    shared.set_state(SchedulerState::Offline);
    info!("Scheduler {} done", shared.name);
}
