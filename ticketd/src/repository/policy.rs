// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::marker::PhantomData;

/// Decides when an object leaves the repository to be updated.
pub trait ExpiryPolicy<O>: Send + Sync + 'static {
    /// The default hands every object over on the very next sweep.
    fn expired(&self, _object: &O) -> bool {
        true
    }
}

/// Persists or finalizes an object once it has expired. An error asks for the
/// object to be retried on a later sweep.
pub trait Updater<O>: Send + Sync + 'static {
    fn update(&self, object: &O) -> anyhow::Result<()>;
}

/// Expires every object as soon as the sweep sees it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediately;

impl<O> ExpiryPolicy<O> for Immediately {}

/// Adapts a closure into an `ExpiryPolicy`.
pub struct ExpireWhen<F, O> {
    predicate: F,
    _object: PhantomData<fn(&O)>,
}

impl<F, O> ExpireWhen<F, O>
where
    F: Fn(&O) -> bool + Send + Sync + 'static,
{
    pub fn new(predicate: F) -> Self {
        Self {
            predicate,
            _object: PhantomData,
        }
    }
}

impl<F, O> ExpiryPolicy<O> for ExpireWhen<F, O>
where
    F: Fn(&O) -> bool + Send + Sync + 'static,
    O: 'static,
{
    fn expired(&self, object: &O) -> bool {
        (self.predicate)(object)
    }
}

/// Adapts a closure into an `Updater`.
pub struct UpdateWith<F, O> {
    update: F,
    _object: PhantomData<fn(&O)>,
}

impl<F, O> UpdateWith<F, O>
where
    F: Fn(&O) -> anyhow::Result<()> + Send + Sync + 'static,
{
    pub fn new(update: F) -> Self {
        Self {
            update,
            _object: PhantomData,
        }
    }
}

impl<F, O> Updater<O> for UpdateWith<F, O>
where
    F: Fn(&O) -> anyhow::Result<()> + Send + Sync + 'static,
    O: 'static,
{
    fn update(&self, object: &O) -> anyhow::Result<()> {
        (self.update)(object)
    }
}
