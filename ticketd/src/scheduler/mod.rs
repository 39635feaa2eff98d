// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
//! # Design: Wakeup-driven polling schedulers
//!
//! ## Overview
//! Every periodic component (repositories, sweeps) owns exactly one dedicated
//! loop thread. The loop sleeps on a `WakeupSignal` between steps, so other
//! threads can cut the sleep short instead of waiting for the next period.
//!
//! - `WakeupSignal`: condition variable with a pending flag; no busy polling.
//! - `LoopThread`: named OS thread, joinable with a bound.
//! - `PollingScheduler`: state machine, step timing, jam detection,
//!   on-hold mode and time-of-day windows around a pluggable `Step`.
//!
//!          wakeup() / set_on_hold(false)
//!                 |
//!         +-------v--------+       +-----------------+
//!         |  WakeupSignal  |<------|   LoopThread    |
//!         +-------+--------+ wait  |  run_loop()     |
//!                 |                +--------+--------+
//!                 |                         |
//!                 |                +--------v--------+
//!                 +--------------->|  Step          |
//!                    StepContext   |  next_step()    |
//!                                  +-----------------+

pub mod polling;
pub mod time_range;
pub mod wakeup;

pub use polling::{NextStep, PollingScheduler, SchedulerState, Step, StepContext};
pub use time_range::TimeRange;
pub use wakeup::{LoopThread, WakeupSignal};
