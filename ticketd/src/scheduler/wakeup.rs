// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use log::{debug, warn};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::SchedulerError;

#[derive(Debug)]
struct WakeupState {
    running: bool,
    on_hold: bool,
    // set by wakeup(), consumed by the next wait_for()
    pending: bool,
    sleeping: bool,
    last_wakeup: Option<Instant>,
}

/// Sleep-with-early-wakeup primitive shared between a loop thread and the
/// threads that want to nudge it.
///
/// A wakeup that arrives while nobody is waiting is remembered, so the next
/// `wait_for` returns straight away instead of sleeping a full period.
#[derive(Debug)]
pub struct WakeupSignal {
    sync_state: (Mutex<WakeupState>, Condvar),
}

impl Default for WakeupSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeupSignal {
    pub fn new() -> Self {
        Self {
            sync_state: (
                Mutex::new(WakeupState {
                    running: true,
                    on_hold: false,
                    pending: false,
                    sleeping: false,
                    last_wakeup: None,
                }),
                Condvar::new(),
            ),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WakeupState> {
        // a panicking hook must not take the loop down with it
        self.sync_state
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Blocks up to `duration`. Returns `true` if the wait was cut short by
    /// `wakeup()`, by switching to on-hold or by `shutdown()`.
    pub fn wait_for(&self, duration: Duration) -> bool {
        let cvar = &self.sync_state.1;
        let mut state = self.lock();
        if state.pending || !state.running {
            state.pending = false;
            return true;
        }
        state.sleeping = true;
        let deadline = Instant::now().checked_add(duration);
        let interrupted = loop {
            if state.pending || !state.running {
                break true;
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break false;
                    }
                    deadline - now
                }
                // effectively forever
                None => Duration::from_secs(u32::MAX as u64),
            };
            state = match cvar.wait_timeout(state, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        };
        state.pending = false;
        state.sleeping = false;
        interrupted
    }

    pub fn wakeup(&self) {
        let mut state = self.lock();
        state.pending = true;
        state.last_wakeup = Some(Instant::now());
        self.sync_state.1.notify_all();
    }

    pub fn set_on_hold(&self, hold: bool) {
        {
            let mut state = self.lock();
            if state.on_hold == hold {
                return;
            }
            state.on_hold = hold;
        }
        // entering hold interrupts the current sleep too, so the loop can
        // notice it; leaving hold must resume promptly
        self.wakeup();
    }

    pub fn is_on_hold(&self) -> bool {
        self.lock().on_hold
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn is_sleeping(&self) -> bool {
        self.lock().sleeping
    }

    pub fn last_wakeup(&self) -> Option<Instant> {
        self.lock().last_wakeup
    }

    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.running = false;
        self.sync_state.1.notify_all();
    }
}

/// A named OS thread hosting one loop, joinable with a timeout.
#[derive(Debug)]
pub struct LoopThread {
    name: String,
    handle: Option<JoinHandle<()>>,
    finished: Arc<(Mutex<bool>, Condvar)>,
}

impl LoopThread {
    pub fn spawn<F>(name: impl Into<String>, body: F) -> Result<Self, SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let finished = Arc::new((Mutex::new(false), Condvar::new()));
        let finished_in_thread = finished.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                // flag the exit even if the body panics
                struct Finish(Arc<(Mutex<bool>, Condvar)>);
                impl Drop for Finish {
                    fn drop(&mut self) {
                        let (lock, cvar) = &*self.0;
                        let mut done = lock.lock().unwrap_or_else(|p| p.into_inner());
                        *done = true;
                        cvar.notify_all();
                    }
                }
                let _finish = Finish(finished_in_thread);
                body();
            })
            .map_err(|source| SchedulerError::Spawn {
                name: name.clone(),
                source,
            })?;
        Ok(Self {
            name,
            handle: Some(handle),
            finished,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Waits up to `timeout` for the loop to exit. On timeout the thread is
    /// detached and `false` is returned.
    pub fn join_timeout(mut self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.finished;
        let done = lock.lock().unwrap_or_else(|p| p.into_inner());
        let (done, _) = cvar
            .wait_timeout_while(done, timeout, |done| !*done)
            .unwrap_or_else(|p| p.into_inner());
        let finished = *done;
        drop(done);
        match (finished, self.handle.take()) {
            (true, Some(handle)) => {
                if handle.join().is_err() {
                    warn!("Thread {} terminated with a panic", self.name);
                }
                debug!("Thread {} joined", self.name);
                true
            }
            (true, None) => true,
            (false, _) => {
                warn!(
                    "Thread {} did not stop within {:?}, detaching it",
                    self.name, timeout
                );
                false
            }
        }
    }
}
