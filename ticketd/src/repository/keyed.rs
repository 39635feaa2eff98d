// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use dashmap::DashMap;
use log::warn;
use std::cmp::Ordering as CmpOrdering;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::RepositoryConfig;
use crate::scheduler::WakeupSignal;

pub type KeyFn<O> = Arc<dyn Fn(&O) -> String + Send + Sync>;
pub type StatusFn<O> = Arc<dyn Fn(&O) -> String + Send + Sync>;
pub type Comparator<O> = Arc<dyn Fn(&O, &O) -> CmpOrdering + Send + Sync>;

/// Concurrent map of domain objects keyed by a string derived from each
/// object, with optional capacity backpressure.
pub struct KeyedRepository<O> {
    name: String,
    objects: DashMap<String, O>,
    key: KeyFn<O>,
    status: RwLock<Option<StatusFn<O>>>,
    comparator: RwLock<Option<Comparator<O>>>,
    max_authorised_size: AtomicUsize,
    max_recorded_size: AtomicUsize,
    // serializes the capacity check with the insert
    put_gate: Mutex<()>,
    put_backoff: Duration,
    wakeup_on_put: AtomicBool,
    wakeup: Option<Arc<WakeupSignal>>,
}

impl<O: Clone + Debug> KeyedRepository<O> {
    pub fn new(
        name: impl Into<String>,
        config: &RepositoryConfig,
        key: impl Fn(&O) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            objects: DashMap::new(),
            key: Arc::new(key),
            status: RwLock::new(None),
            comparator: RwLock::new(None),
            max_authorised_size: AtomicUsize::new(config.max_authorised_size),
            max_recorded_size: AtomicUsize::new(0),
            put_gate: Mutex::new(()),
            put_backoff: config.put_backoff(),
            wakeup_on_put: AtomicBool::new(config.wakeup_on_put),
            wakeup: None,
        }
    }

    /// Wake `signal` whenever an object is put (if wakeup-on-put is enabled).
    pub fn with_wakeup(mut self, signal: Arc<WakeupSignal>) -> Self {
        self.wakeup = Some(signal);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_of(&self, object: &O) -> String {
        (self.key)(object)
    }

    pub fn set_status_renderer(&self, status: impl Fn(&O) -> String + Send + Sync + 'static) {
        *self.status.write().unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(status));
    }

    pub fn set_comparator(&self, cmp: impl Fn(&O, &O) -> CmpOrdering + Send + Sync + 'static) {
        *self.comparator.write().unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(cmp));
    }

    pub fn comparator(&self) -> Option<Comparator<O>> {
        self.comparator
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn set_max_authorised_size(&self, size: usize) {
        self.max_authorised_size.store(size, Ordering::SeqCst);
    }

    pub fn max_authorised_size(&self) -> usize {
        self.max_authorised_size.load(Ordering::SeqCst)
    }

    pub fn max_recorded_size(&self) -> usize {
        self.max_recorded_size.load(Ordering::SeqCst)
    }

    pub fn set_wakeup_on_put(&self, wakeup: bool) {
        self.wakeup_on_put.store(wakeup, Ordering::SeqCst);
    }

    pub fn wakeup_on_put(&self) -> bool {
        self.wakeup_on_put.load(Ordering::SeqCst)
    }

    /// Inserts `object`, blocking while the repository is at capacity.
    /// Replacing an object under an existing key never blocks.
    pub fn put(&self, object: O) {
        let key = self.key_of(&object);
        let mut waited = None;
        loop {
            {
                let _gate = self.put_gate.lock().unwrap_or_else(|p| p.into_inner());
                let max = self.max_authorised_size();
                if max == 0 || self.objects.len() < max || self.objects.contains_key(&key) {
                    self.objects.insert(key, object);
                    self.max_recorded_size
                        .fetch_max(self.objects.len(), Ordering::SeqCst);
                    break;
                }
            }
            // the gate is released while backing off
            waited.get_or_insert_with(Instant::now);
            thread::sleep(self.put_backoff);
        }
        if self.wakeup_on_put() {
            if let Some(signal) = &self.wakeup {
                signal.wakeup();
            }
        }
        if let Some(started) = waited {
            warn!(
                "{}: submission delayed by {:?}",
                self.name,
                started.elapsed()
            );
        }
    }

    /// Puts back an object whose update failed. Skips the capacity wait: the
    /// caller may be the only thread that ever frees a slot.
    pub(crate) fn reinsert(&self, object: O) {
        let key = self.key_of(&object);
        let _gate = self.put_gate.lock().unwrap_or_else(|p| p.into_inner());
        self.objects.insert(key, object);
        self.max_recorded_size
            .fetch_max(self.objects.len(), Ordering::SeqCst);
    }

    /// Removes the object under `key` only if `predicate` holds for the value
    /// currently stored there.
    pub(crate) fn remove_if(&self, key: &str, predicate: impl FnOnce(&O) -> bool) -> Option<O> {
        self.objects
            .remove_if(key, |_, object| predicate(object))
            .map(|(_, object)| object)
    }

    pub fn get(&self, key: &str) -> Option<O> {
        self.objects.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    pub fn contains(&self, object: &O) -> bool {
        self.contains_key(&self.key_of(object))
    }

    pub fn remove_by_key(&self, key: &str) -> Option<O> {
        self.objects.remove(key).map(|(_, object)| object)
    }

    pub fn remove(&self, object: &O) -> Option<O> {
        self.remove_by_key(&self.key_of(object))
    }

    pub fn size(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn clear(&self) {
        self.objects.clear();
    }

    /// Point-in-time copy, sorted with the configured comparator if any.
    pub fn list(&self) -> Vec<O> {
        match self.comparator() {
            Some(cmp) => self.list_sorted(|a, b| cmp(a, b)),
            None => self.snapshot(),
        }
    }

    pub fn list_sorted(&self, cmp: impl Fn(&O, &O) -> CmpOrdering) -> Vec<O> {
        let mut list = self.snapshot();
        list.sort_by(|a, b| cmp(a, b));
        list
    }

    fn snapshot(&self) -> Vec<O> {
        self.objects
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn status_of(&self, object: &O) -> String {
        let status = self.status.read().unwrap_or_else(|p| p.into_inner()).clone();
        match status {
            Some(status) => status(object),
            None => format!("{:?}", object),
        }
    }

    /// One `key=status` line per object.
    pub fn status(&self) -> String {
        self.list()
            .iter()
            .map(|object| {
                format!(
                    "{}={}",
                    self.key_of(object),
                    self.status_of(object).trim().replace(' ', "_")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
