// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ticketd::repository::UpdateWith;

/// Routes `log` output through the test harness; safe to call repeatedly.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Polls `cond` every 2ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Bookkeeping of an updater under test: attempts and successes per key, and
/// whether two updates of the same key ever overlapped.
#[derive(Debug, Default)]
pub struct Tally {
    attempts: Mutex<HashMap<String, usize>>,
    successes: Mutex<HashMap<String, usize>>,
    in_flight: Mutex<HashSet<String>>,
    overlapped: AtomicBool,
}

impl Tally {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Marks `key` as being updated; returns the attempt number (1-based).
    pub fn begin(&self, key: &str) -> usize {
        if !self.in_flight.lock().unwrap().insert(key.to_string()) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        let mut attempts = self.attempts.lock().unwrap();
        let n = attempts.entry(key.to_string()).or_default();
        *n += 1;
        *n
    }

    pub fn end(&self, key: &str, success: bool) {
        self.in_flight.lock().unwrap().remove(key);
        if success {
            *self
                .successes
                .lock()
                .unwrap()
                .entry(key.to_string())
                .or_default() += 1;
        }
    }

    pub fn attempts(&self, key: &str) -> usize {
        self.attempts.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn total_attempts(&self) -> usize {
        self.attempts.lock().unwrap().values().sum()
    }

    pub fn succeeded(&self) -> usize {
        self.successes.lock().unwrap().len()
    }

    pub fn each_succeeded_once(&self) -> bool {
        self.successes.lock().unwrap().values().all(|n| *n == 1)
    }

    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }
}

/// An updater recording into `tally` that fails the first `failures`
/// attempts of every key and sleeps `work` per attempt.
pub fn tallying_updater<O, K>(
    tally: Arc<Tally>,
    key: K,
    failures: usize,
    work: Duration,
) -> UpdateWith<impl Fn(&O) -> anyhow::Result<()> + Send + Sync + 'static, O>
where
    O: 'static,
    K: Fn(&O) -> String + Send + Sync + 'static,
{
    UpdateWith::new(move |object: &O| {
        let key = key(object);
        let attempt = tally.begin(&key);
        if !work.is_zero() {
            thread::sleep(work);
        }
        let success = attempt > failures;
        tally.end(&key, success);
        if success {
            Ok(())
        } else {
            anyhow::bail!("attempt {attempt} of {key} refused")
        }
    })
}
