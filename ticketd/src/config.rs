// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Construction-time settings of repositories and schedulers.
//!
//! All durations are expressed in milliseconds so the structures can be read
//! straight from a JSON file:
//!
//! ```json
//! {
//!   "repository": { "workers": 2, "delay_ms": 1000, "time_ranges": ["06:00-22:00"] },
//!   "default_timeout_ms": 18000000,
//!   "timeout_after_completion_ms": 180000
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::scheduler::time_range::TimeRange;

const SECOND: u64 = 1000;
const MINUTE: u64 = 60 * SECOND;
const HOUR: u64 = 60 * MINUTE;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Number of storage workers. 0 processes expired objects inline on the
    /// sweep thread.
    pub workers: usize,
    /// Pause between two sweeps.
    pub delay_ms: u64,
    /// Pause after a step asked to continue right away.
    pub minimum_wait_ms: u64,
    /// A step running longer than this reports the scheduler as jammed.
    pub jammed_threshold_ms: u64,
    /// How long an empty repository sleeps before looking again.
    pub idle_interval_ms: u64,
    /// How long an idle worker sleeps before looking at the spool again.
    pub worker_idle_ms: u64,
    /// Bound for joining loop threads on shutdown.
    pub shutdown_timeout_ms: u64,
    /// Pause between two capacity checks of a blocked `put`.
    pub put_backoff_ms: u64,
    /// 0 means unbounded.
    pub max_authorised_size: usize,
    /// Wake the sweep as soon as an object is put.
    pub wakeup_on_put: bool,
    /// Local time-of-day windows in which sweeping is allowed. Empty means
    /// always.
    pub time_ranges: Vec<TimeRange>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            delay_ms: 30 * SECOND,
            minimum_wait_ms: SECOND,
            jammed_threshold_ms: 5 * MINUTE,
            idle_interval_ms: HOUR,
            worker_idle_ms: 5 * SECOND,
            shutdown_timeout_ms: 30 * SECOND,
            put_backoff_ms: 50,
            max_authorised_size: 0,
            wakeup_on_put: true,
            time_ranges: Vec::new(),
        }
    }
}

impl RepositoryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn minimum_wait(&self) -> Duration {
        Duration::from_millis(self.minimum_wait_ms)
    }

    pub fn jammed_threshold(&self) -> Duration {
        Duration::from_millis(self.jammed_threshold_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn worker_idle(&self) -> Duration {
        Duration::from_millis(self.worker_idle_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn put_backoff(&self) -> Duration {
        Duration::from_millis(self.put_backoff_ms)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_authorised_size(mut self, size: usize) -> Self {
        self.max_authorised_size = size;
        self
    }
}

/// Partial `RepositoryConfig` as read from a file. Unset fields keep the
/// value of whatever base the settings are applied to.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RepositorySettings {
    workers: Option<usize>,
    delay_ms: Option<u64>,
    minimum_wait_ms: Option<u64>,
    jammed_threshold_ms: Option<u64>,
    idle_interval_ms: Option<u64>,
    worker_idle_ms: Option<u64>,
    shutdown_timeout_ms: Option<u64>,
    put_backoff_ms: Option<u64>,
    max_authorised_size: Option<usize>,
    wakeup_on_put: Option<bool>,
    time_ranges: Option<Vec<TimeRange>>,
}

impl RepositorySettings {
    fn apply(self, base: RepositoryConfig) -> RepositoryConfig {
        RepositoryConfig {
            workers: self.workers.unwrap_or(base.workers),
            delay_ms: self.delay_ms.unwrap_or(base.delay_ms),
            minimum_wait_ms: self.minimum_wait_ms.unwrap_or(base.minimum_wait_ms),
            jammed_threshold_ms: self.jammed_threshold_ms.unwrap_or(base.jammed_threshold_ms),
            idle_interval_ms: self.idle_interval_ms.unwrap_or(base.idle_interval_ms),
            worker_idle_ms: self.worker_idle_ms.unwrap_or(base.worker_idle_ms),
            shutdown_timeout_ms: self.shutdown_timeout_ms.unwrap_or(base.shutdown_timeout_ms),
            put_backoff_ms: self.put_backoff_ms.unwrap_or(base.put_backoff_ms),
            max_authorised_size: self.max_authorised_size.unwrap_or(base.max_authorised_size),
            wakeup_on_put: self.wakeup_on_put.unwrap_or(base.wakeup_on_put),
            time_ranges: self.time_ranges.unwrap_or(base.time_ranges),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TicketRepositorySettings {
    repository: RepositorySettings,
    default_timeout_ms: Option<u64>,
    timeout_after_completion_ms: Option<u64>,
}

impl From<TicketRepositorySettings> for TicketRepositoryConfig {
    fn from(settings: TicketRepositorySettings) -> Self {
        let base = TicketRepositoryConfig::default();
        Self {
            repository: settings.repository.apply(base.repository),
            default_timeout_ms: settings.default_timeout_ms.unwrap_or(base.default_timeout_ms),
            timeout_after_completion_ms: settings
                .timeout_after_completion_ms
                .unwrap_or(base.timeout_after_completion_ms),
        }
    }
}

/// Ticket repository settings. Fields missing from a file fall back to the
/// ticket defaults, including those of a partially given `repository` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TicketRepositorySettings")]
pub struct TicketRepositoryConfig {
    pub repository: RepositoryConfig,
    /// Applies before completion unless the ticket sets its own timeout.
    pub default_timeout_ms: u64,
    /// Grace period once a ticket is completed or has failed.
    pub timeout_after_completion_ms: u64,
}

impl Default for TicketRepositoryConfig {
    fn default() -> Self {
        Self {
            repository: RepositoryConfig {
                delay_ms: MINUTE,
                ..RepositoryConfig::default()
            },
            default_timeout_ms: 5 * HOUR,
            timeout_after_completion_ms: 3 * MINUTE,
        }
    }
}

impl TicketRepositoryConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn timeout_after_completion(&self) -> Duration {
        Duration::from_millis(self.timeout_after_completion_ms)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let file = File::open(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }
}
