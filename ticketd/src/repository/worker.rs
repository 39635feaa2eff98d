// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::SchedulerError;
use crate::repository::storage::{Storable, StorageCore};
use crate::scheduler::{LoopThread, WakeupSignal};

#[derive(Debug, Default)]
struct WorkerStats {
    updated: AtomicU64,
    failed: AtomicU64,
    // accumulated duration of successful updates
    duration_nanos: AtomicU64,
}

/// One member of a storage repository's worker pool. Pops expired objects
/// from the shared spool and updates them; drains the spool on shutdown.
pub struct StorageWorker {
    name: String,
    signal: Arc<WakeupSignal>,
    stats: Arc<WorkerStats>,
    thread: Mutex<Option<LoopThread>>,
    shutdown_timeout: Duration,
}

impl StorageWorker {
    pub(crate) fn start<O: Storable>(
        name: String,
        core: Arc<StorageCore<O>>,
        idle: Duration,
        shutdown_timeout: Duration,
    ) -> Result<Self, SchedulerError> {
        let signal = Arc::new(WakeupSignal::new());
        let stats = Arc::new(WorkerStats::default());
        let thread = {
            let signal = signal.clone();
            let stats = stats.clone();
            let name = name.clone();
            LoopThread::spawn(name.clone(), move || {
                worker_loop(&name, &core, &signal, &stats, idle)
            })?
        };
        Ok(Self {
            name,
            signal,
            stats,
            thread: Mutex::new(Some(thread)),
            shutdown_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn signal(&self) -> Arc<WakeupSignal> {
        self.signal.clone()
    }

    pub fn wakeup(&self) {
        self.signal.wakeup();
    }

    pub fn is_running(&self) -> bool {
        self.signal.is_running()
    }

    /// Number of successful updates.
    pub fn updated(&self) -> u64 {
        self.stats.updated.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.stats.failed.load(Ordering::SeqCst)
    }

    /// Total time spent in successful updates.
    pub fn duration(&self) -> Duration {
        Duration::from_nanos(self.stats.duration_nanos.load(Ordering::SeqCst))
    }

    /// `succeeded/total (average ms)`
    pub fn status(&self) -> String {
        let updated = self.updated();
        let total = updated + self.failed();
        let average = if updated > 0 {
            self.duration().as_millis() as u64 / updated
        } else {
            0
        };
        format!("{updated}/{total} ({average}ms)")
    }

    /// Stops taking new work once the spool is drained and waits (bounded)
    /// for the thread to exit.
    pub fn shutdown(&self) {
        self.signal.shutdown();
        let thread = self.thread.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(thread) = thread {
            thread.join_timeout(self.shutdown_timeout);
        }
    }
}

fn worker_loop<O: Storable>(
    name: &str,
    core: &StorageCore<O>,
    signal: &WakeupSignal,
    stats: &WorkerStats,
    idle: Duration,
) {
    info!("Storage worker {name} started");
    loop {
        let running = signal.is_running();
        let object = match core.spool.pop() {
            Some(object) => object,
            None if running => {
                signal.wait_for(idle);
                continue;
            }
            None => break,
        };
        let started = Instant::now();
        match core.update(&object) {
            Ok(()) => {
                stats.updated.fetch_add(1, Ordering::SeqCst);
                stats
                    .duration_nanos
                    .fetch_add(started.elapsed().as_nanos() as u64, Ordering::SeqCst);
                debug!("{name}: updated {}", core.objects.key_of(&object));
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::SeqCst);
                let key = core.objects.key_of(&object);
                if signal.is_running() {
                    warn!("{name}: update of {key} failed, requeued: {e:#}");
                    core.objects.reinsert(object);
                } else {
                    warn!("{name}: update of {key} failed during shutdown, dropped: {e:#}");
                }
            }
        }
    }
    info!("Storage worker {name} done");
}
