// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// FIFO hand-over between a sweep and its workers. An object already waiting
/// in the spool is not queued a second time.
#[derive(Debug)]
pub struct Spool<O> {
    queue: Mutex<VecDeque<O>>,
}

impl<O> Default for Spool<O> {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }
}

impl<O: PartialEq> Spool<O> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<O>> {
        self.queue.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Returns false if an equal object was already queued.
    pub fn push_unique(&self, object: O) -> bool {
        let mut queue = self.lock();
        if queue.contains(&object) {
            return false;
        }
        queue.push_back(object);
        true
    }

    pub fn pop(&self) -> Option<O> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
