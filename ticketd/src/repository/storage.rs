// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use log::{debug, info, warn};
use std::cmp::Ordering as CmpOrdering;
use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use crate::config::RepositoryConfig;
use crate::error::SchedulerError;
use crate::repository::keyed::KeyedRepository;
use crate::repository::policy::{ExpiryPolicy, Updater};
use crate::repository::spool::Spool;
use crate::repository::worker::StorageWorker;
use crate::scheduler::{NextStep, PollingScheduler, SchedulerState, Step, StepContext, WakeupSignal};

/// Anything a storage repository can hold.
pub trait Storable: Clone + PartialEq + Debug + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Debug + Send + Sync + 'static> Storable for T {}

/// State shared by the sweep thread and the workers.
pub(crate) struct StorageCore<O: Storable> {
    name: String,
    pub(crate) objects: KeyedRepository<O>,
    pub(crate) spool: Spool<O>,
    policy: Box<dyn ExpiryPolicy<O>>,
    updater: Box<dyn Updater<O>>,
    worker_signals: RwLock<Vec<Arc<WakeupSignal>>>,
    idle_interval: Duration,
}

impl<O: Storable> StorageCore<O> {
    pub(crate) fn update(&self, object: &O) -> anyhow::Result<()> {
        self.updater.update(object)
    }

    fn has_workers(&self) -> bool {
        !self
            .worker_signals
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .is_empty()
    }

    fn wakeup_workers(&self) {
        for signal in self
            .worker_signals
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
        {
            signal.wakeup();
        }
    }

    /// One pass over the repository. Expired objects leave the map and are
    /// either updated inline or handed to the workers.
    fn sweep(&self) -> usize {
        let inline = !self.has_workers();
        let mut dispatched = 0;
        let mut spooled = false;
        for object in self.objects.list() {
            let key = self.objects.key_of(&object);
            // the policy sees the value stored now, not the snapshot copy
            let Some(object) = self
                .objects
                .remove_if(&key, |current| self.policy.expired(current))
            else {
                continue;
            };
            dispatched += 1;
            if inline {
                if let Err(e) = self.updater.update(&object) {
                    warn!(
                        "{}: update of {} failed, requeued: {e:#}",
                        self.name,
                        self.objects.key_of(&object)
                    );
                    self.objects.reinsert(object);
                }
            } else if self.spool.push_unique(object) {
                spooled = true;
            }
        }
        if spooled {
            self.wakeup_workers();
        }
        dispatched
    }
}

impl<O: Storable> Step for StorageCore<O> {
    fn next_step(&self, ctx: &StepContext<'_>) -> anyhow::Result<NextStep> {
        if self.objects.is_empty() {
            if !self.objects.wakeup_on_put() {
                return Ok(NextStep::Delay);
            }
            // a put cuts this short
            ctx.wait_for(self.idle_interval);
            if !ctx.is_running() {
                return Ok(NextStep::Delay);
            }
        }
        let dispatched = self.sweep();
        if dispatched > 0 {
            debug!("{}: {dispatched} expired object(s) dispatched", self.name);
        }
        Ok(NextStep::Delay)
    }

    fn activity(&self) -> Option<String> {
        Some(format!(
            "queue={},spool={}",
            self.objects.size(),
            self.spool.len()
        ))
    }
}

/// A keyed repository whose entries expire and are then "updated"
/// (persisted, finalized) inline or by a pool of workers.
///
/// ```text
///   put() --> [ map ] --sweep: expired?--> update() inline        (0 workers)
///                                     \--> [ spool ] --> worker --> update()
///                                              ^                      |
///                         [ map ] <--reinsert on failure -------------+
/// ```
pub struct StorageRepository<O: Storable> {
    core: Arc<StorageCore<O>>,
    scheduler: PollingScheduler,
    workers: Mutex<Vec<StorageWorker>>,
    worker_count: usize,
    worker_idle: Duration,
    shutdown_timeout: Duration,
    started: Mutex<Option<Instant>>,
}

impl<O: Storable> StorageRepository<O> {
    pub fn new(
        name: impl Into<String>,
        config: &RepositoryConfig,
        key: impl Fn(&O) -> String + Send + Sync + 'static,
        policy: impl ExpiryPolicy<O>,
        updater: impl Updater<O>,
    ) -> Self {
        let name = name.into();
        let scheduler = PollingScheduler::new(name.clone(), config);
        let objects =
            KeyedRepository::new(name.clone(), config, key).with_wakeup(scheduler.signal());
        Self {
            core: Arc::new(StorageCore {
                name,
                objects,
                spool: Spool::new(),
                policy: Box::new(policy),
                updater: Box::new(updater),
                worker_signals: RwLock::new(Vec::new()),
                idle_interval: config.idle_interval(),
            }),
            scheduler,
            workers: Mutex::new(Vec::new()),
            worker_count: config.workers,
            worker_idle: config.worker_idle(),
            shutdown_timeout: config.shutdown_timeout(),
            started: Mutex::new(None),
        }
    }

    fn workers(&self) -> MutexGuard<'_, Vec<StorageWorker>> {
        self.workers.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Starts the workers, then the sweep loop.
    pub fn start(&self) -> Result<(), SchedulerError> {
        {
            let mut workers = self.workers();
            if !workers.is_empty() {
                return Err(SchedulerError::AlreadyStarted(self.core.name.clone()));
            }
            for i in 0..self.worker_count {
                let worker = StorageWorker::start(
                    format!("{}-worker-{i}", self.core.name),
                    self.core.clone(),
                    self.worker_idle,
                    self.shutdown_timeout,
                )?;
                workers.push(worker);
            }
            *self
                .core
                .worker_signals
                .write()
                .unwrap_or_else(|p| p.into_inner()) =
                workers.iter().map(|w| w.signal()).collect();
            if !workers.is_empty() {
                info!("{} storage worker(s) started for {}", workers.len(), self.core.name);
            }
        }
        self.scheduler.start(self.core.clone())?;
        *self.started.lock().unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());
        Ok(())
    }

    /// Stops the sweep, then lets every worker drain the spool.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        for worker in self.workers().iter() {
            worker.shutdown();
        }
    }

    pub fn scheduler(&self) -> &PollingScheduler {
        &self.scheduler
    }

    pub fn state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn objects(&self) -> &KeyedRepository<O> {
        &self.core.objects
    }

    pub fn put(&self, object: O) {
        self.core.objects.put(object);
    }

    pub fn get(&self, key: &str) -> Option<O> {
        self.core.objects.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.core.objects.contains_key(key)
    }

    pub fn remove_by_key(&self, key: &str) -> Option<O> {
        self.core.objects.remove_by_key(key)
    }

    pub fn remove(&self, object: &O) -> Option<O> {
        self.core.objects.remove(object)
    }

    pub fn list(&self) -> Vec<O> {
        self.core.objects.list()
    }

    pub fn list_sorted(&self, cmp: impl Fn(&O, &O) -> CmpOrdering) -> Vec<O> {
        self.core.objects.list_sorted(cmp)
    }

    pub fn size(&self) -> usize {
        self.core.objects.size()
    }

    pub fn clear(&self) {
        self.core.objects.clear();
    }

    pub fn wakeup(&self) {
        self.scheduler.wakeup();
    }

    /// Runs one sweep on the calling thread, regardless of the schedule.
    /// Returns the number of objects that expired.
    pub fn sweep_now(&self) -> usize {
        self.core.sweep()
    }

    /// Takes the object stored under `key` out of the repository and updates
    /// it right away. On failure the object goes back into the repository.
    pub fn flush(&self, key: &str) -> anyhow::Result<bool> {
        let Some(object) = self.core.objects.remove_by_key(key) else {
            return Ok(false);
        };
        debug!("{}: remove/update {key}", self.core.name);
        if let Err(e) = self.core.update(&object) {
            self.core.objects.reinsert(object);
            return Err(e);
        }
        Ok(true)
    }

    pub fn spool_size(&self) -> usize {
        self.core.spool.len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers().len()
    }

    pub fn worker_status(&self, index: usize) -> Option<String> {
        self.workers().get(index).map(|w| w.status())
    }

    pub fn updated(&self) -> u64 {
        self.workers().iter().map(|w| w.updated()).sum()
    }

    pub fn failed(&self) -> u64 {
        self.workers().iter().map(|w| w.failed()).sum()
    }

    /// Monitoring line, e.g. `ONLINE (queue=3,spool=0)`.
    pub fn monitor_status(&self) -> String {
        self.scheduler.monitor_status(self.core.activity())
    }
}

impl<O: Storable> fmt::Display for StorageRepository<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let uptime = self
            .started
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .map(|started| started.elapsed())
            .unwrap_or_default();
        let workers = self.workers();
        let updated: u64 = workers.iter().map(|w| w.updated()).sum();
        let duration: Duration = workers.iter().map(|w| w.duration()).sum();
        write!(f, "threads={},duration={:?}", workers.len(), uptime)?;
        if updated > 0 {
            let updated = updated as u32;
            write!(
                f,
                ",speed={:?},trend={:?}",
                duration / updated,
                uptime / updated
            )?;
        }
        Ok(())
    }
}

impl<O: Storable> Drop for StorageRepository<O> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
