// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
//! # Design: Keyed repositories with expiry
//!
//! ## Overview
//! A `KeyedRepository` is a concurrent map of domain objects; the key is
//! derived from each object by a caller supplied function. A
//! `StorageRepository` adds a `PollingScheduler` that sweeps the map:
//! objects for which the `ExpiryPolicy` answers true are taken out and handed
//! to the `Updater`.
//!
//! With zero workers the sweep thread updates objects itself. Otherwise the
//! sweep only moves them into a `Spool` and wakes the `StorageWorker`s, which
//! pop and update concurrently. An object is never in the map and the spool
//! at the same time, so it is never updated twice in parallel.
//!
//! A failed update puts the object back into the map; it is retried on a
//! later sweep, as long as the policy still says it is expired.
//!
//! On shutdown the sweep stops first, then each worker drains what is left in
//! the spool before its thread exits.

pub mod keyed;
pub mod policy;
pub mod spool;
pub mod storage;
pub mod worker;

pub use keyed::KeyedRepository;
pub use policy::{ExpireWhen, ExpiryPolicy, Immediately, UpdateWith, Updater};
pub use spool::Spool;
pub use storage::{Storable, StorageRepository};
pub use worker::StorageWorker;

#[cfg(test)]
mod tests;
