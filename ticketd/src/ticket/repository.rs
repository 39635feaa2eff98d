// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use log::{debug, error, warn};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;

use crate::config::TicketRepositoryConfig;
use crate::error::{SchedulerError, TicketError};
use crate::repository::{ExpiryPolicy, StorageRepository, Updater};
use crate::ticket::handle::Ticket;
use crate::ticket::TicketId;

static LAST_ID: AtomicI64 = AtomicI64::new(0);

/// Process-wide unique id: the current wall-clock milliseconds, or one more
/// than the last id handed out if the clock has not moved on.
fn unique_id() -> TicketId {
    let now = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
    let mut last = LAST_ID.load(Ordering::SeqCst);
    loop {
        let next = now.max(last + 1);
        match LAST_ID.compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return TicketId(next),
            Err(current) => last = current,
        }
    }
}

#[derive(Debug)]
struct Timeouts {
    default_ms: AtomicU64,
    after_completion_ms: AtomicU64,
}

impl Timeouts {
    fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_ms.load(Ordering::SeqCst))
    }

    fn after_completion(&self) -> Duration {
        Duration::from_millis(self.after_completion_ms.load(Ordering::SeqCst))
    }
}

/// Closes the ticket and returns its error, if any.
fn check_ticket(ticket: &Ticket, wait: Duration) -> Result<(), TicketError> {
    debug!("Ticket checked: {}", ticket.id());
    ticket.close(wait);
    match ticket.error() {
        Some(message) => {
            warn!("Ticket {} error: {message}", ticket.id());
            Err(TicketError::Failed {
                id: ticket.id(),
                message,
            })
        }
        None => Ok(()),
    }
}

/// A ticket expires when nobody touched it within its timeout, or when it
/// has been completed (or has failed) for longer than the grace period.
#[derive(Debug, Clone)]
pub struct TicketExpiry {
    timeouts: Arc<Timeouts>,
}

impl ExpiryPolicy<Arc<Ticket>> for TicketExpiry {
    fn expired(&self, ticket: &Arc<Ticket>) -> bool {
        let now = Instant::now();
        let timeout = ticket
            .timeout()
            .unwrap_or_else(|| self.timeouts.default_timeout());
        let idle = now.saturating_duration_since(ticket.stamped_at().unwrap_or(ticket.created_at()));
        let mut elapsed = idle;
        let mut expired = !timeout.is_zero() && idle > timeout;
        if !expired && (ticket.is_completed() || ticket.has_error()) {
            let finished = ticket.completed_at().or_else(|| ticket.errored_at());
            if let Some(finished) = finished {
                elapsed = now.saturating_duration_since(finished);
                expired = elapsed > self.timeouts.after_completion();
            }
        }
        if expired {
            debug!(
                "Ticket {} expired after {:?} ({})",
                ticket.id(),
                elapsed,
                ticket.status()
            );
            ticket.expired();
        }
        expired
    }
}

/// Closes expired tickets. Their errors end up in the log since nobody is
/// left to check them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TicketCloser;

impl Updater<Arc<Ticket>> for TicketCloser {
    fn update(&self, ticket: &Arc<Ticket>) -> anyhow::Result<()> {
        if let Err(e) = check_ticket(ticket, Duration::ZERO) {
            error!("Ticket update: {}: {e}", ticket.id());
        }
        Ok(())
    }
}

/// Keeps tickets until their owner checks them, closing them on its own
/// once they time out.
pub struct TicketRepository {
    storage: StorageRepository<Arc<Ticket>>,
    timeouts: Arc<Timeouts>,
}

impl TicketRepository {
    pub fn new(name: impl Into<String>, config: &TicketRepositoryConfig) -> Self {
        let timeouts = Arc::new(Timeouts {
            default_ms: AtomicU64::new(config.default_timeout_ms),
            after_completion_ms: AtomicU64::new(config.timeout_after_completion_ms),
        });
        let storage = StorageRepository::new(
            name,
            &config.repository,
            |ticket: &Arc<Ticket>| ticket.id().key(),
            TicketExpiry {
                timeouts: timeouts.clone(),
            },
            TicketCloser,
        );
        storage
            .objects()
            .set_comparator(|a: &Arc<Ticket>, b: &Arc<Ticket>| a.id().cmp(&b.id()));
        storage
            .objects()
            .set_status_renderer(|ticket: &Arc<Ticket>| ticket.status());
        Self { storage, timeouts }
    }

    pub fn start(&self) -> Result<(), SchedulerError> {
        self.storage.start()
    }

    pub fn shutdown(&self) {
        self.storage.shutdown();
    }

    pub fn storage(&self) -> &StorageRepository<Arc<Ticket>> {
        &self.storage
    }

    /// Assigns a fresh id and stores the ticket.
    pub fn add(&self, ticket: Arc<Ticket>) -> Arc<Ticket> {
        self.add_with_id(ticket, unique_id())
    }

    pub fn add_with_id(&self, ticket: Arc<Ticket>, id: TicketId) -> Arc<Ticket> {
        ticket.set_id(id);
        self.storage.put(ticket.clone());
        debug!("Ticket added: {id} ({})", ticket.status());
        ticket
    }

    pub fn get(&self, id: TicketId) -> Option<Arc<Ticket>> {
        let ticket = self.storage.get(&id.key());
        if ticket.is_none() {
            debug!("Ticket not found: {id} (get)");
        }
        ticket
    }

    /// Takes the ticket out, waits up to `wait` for its completion and closes
    /// it. Fails with the ticket's first error.
    pub fn check(&self, id: TicketId, wait: Duration) -> Result<Option<Arc<Ticket>>, TicketError> {
        let Some(ticket) = self.storage.remove_by_key(&id.key()) else {
            debug!("Ticket already closed/not found: {id}");
            return Ok(None);
        };
        check_ticket(&ticket, wait)?;
        Ok(Some(ticket))
    }

    /// `check` waiting either forever or not at all.
    pub fn check_blocking(&self, id: TicketId, wait: bool) -> Result<Option<Arc<Ticket>>, TicketError> {
        self.check(id, if wait { Duration::MAX } else { Duration::ZERO })
    }

    /// Drops the ticket without waiting: listeners are told, then it is
    /// closed.
    pub fn remove(&self, id: TicketId) -> Option<Arc<Ticket>> {
        let ticket = self.storage.remove_by_key(&id.key())?;
        debug!("Ticket removed: {id}");
        ticket.notify_users();
        ticket.close(Duration::ZERO);
        Some(ticket)
    }

    pub fn size(&self) -> usize {
        self.storage.size()
    }

    /// Tickets ordered by id.
    pub fn list(&self) -> Vec<Arc<Ticket>> {
        self.storage.list()
    }

    /// One `id=status` line per ticket.
    pub fn status(&self) -> String {
        self.storage.objects().status()
    }

    pub fn default_timeout(&self) -> Duration {
        self.timeouts.default_timeout()
    }

    pub fn set_default_timeout(&self, timeout: Duration) {
        self.timeouts
            .default_ms
            .store(timeout.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn timeout_after_completion(&self) -> Duration {
        self.timeouts.after_completion()
    }

    pub fn set_timeout_after_completion(&self, timeout: Duration) {
        self.timeouts
            .after_completion_ms
            .store(timeout.as_millis() as u64, Ordering::SeqCst);
    }
}

impl fmt::Display for TicketRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tickets={},{}", self.size(), self.storage)
    }
}
