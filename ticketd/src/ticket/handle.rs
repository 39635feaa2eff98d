// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use futures::channel::oneshot;
use log::{debug, warn};
use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::ticket::TicketId;

/// What a ticket is about. Supplies the status line and the hooks that run
/// when the ticket is closed or expires in its repository.
pub trait TicketKind: Send + Sync + 'static {
    fn status(&self, ticket: &Ticket) -> String;

    fn on_close(&self, _ticket: &Ticket) {}

    fn on_expired(&self, _ticket: &Ticket) {}
}

/// Plain kind carrying a human readable description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Described(pub String);

impl TicketKind for Described {
    fn status(&self, ticket: &Ticket) -> String {
        let state = if ticket.is_closed() {
            "closed"
        } else if ticket.is_completed() {
            "completed"
        } else {
            "open"
        };
        match ticket.error() {
            Some(error) => format!("{} [{state}, error: {error}]", self.0),
            None => format!("{} [{state}]", self.0),
        }
    }
}

/// A resource released when its ticket is closed.
pub trait Closable: Send + 'static {
    fn close(self: Box<Self>) -> anyhow::Result<()>;

    fn name(&self) -> String {
        type_name::<Self>().to_string()
    }
}

pub struct CloseWith<F> {
    name: String,
    close: F,
}

/// Wraps a closure as a `Closable`.
pub fn close_with<F>(name: impl Into<String>, close: F) -> CloseWith<F>
where
    F: FnOnce() -> anyhow::Result<()> + Send + 'static,
{
    CloseWith {
        name: name.into(),
        close,
    }
}

impl<F> Closable for CloseWith<F>
where
    F: FnOnce() -> anyhow::Result<()> + Send + 'static,
{
    fn close(self: Box<Self>) -> anyhow::Result<()> {
        (self.close)()
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// Completes another ticket when closed, so one ticket can wait for the
/// release of another.
pub struct CompleteTicket(Arc<Ticket>);

impl CompleteTicket {
    pub fn new(ticket: Arc<Ticket>) -> Self {
        Self(ticket)
    }
}

impl Closable for CompleteTicket {
    fn close(self: Box<Self>) -> anyhow::Result<()> {
        self.0.completed();
        Ok(())
    }

    fn name(&self) -> String {
        format!("completion of ticket {}", self.0.id())
    }
}

/// Told when the owner of a ticket gives up on it.
pub trait TicketListener: Send + Sync + 'static {
    fn notify(&self, ticket: &Ticket);
}

#[derive(Debug, Default)]
struct TicketState {
    stamp: Option<Instant>,
    timeout: Option<Duration>,
    completed_at: Option<Instant>,
    closed_at: Option<Instant>,
    error: Option<String>,
    errored_at: Option<Instant>,
    // pending completion() futures
    waiters: Vec<oneshot::Sender<()>>,
}

/// Handle for one unit of asynchronous work.
pub struct Ticket {
    id: AtomicI64,
    created_at: Instant,
    kind: Box<dyn TicketKind>,
    completed: AtomicBool,
    closed: AtomicBool,
    sync_state: (Mutex<TicketState>, Condvar),
    to_close: Mutex<Vec<Box<dyn Closable>>>,
    listeners: Mutex<Vec<Box<dyn TicketListener>>>,
}

impl Ticket {
    pub fn new(kind: impl TicketKind) -> Arc<Self> {
        Arc::new(Self {
            id: AtomicI64::new(TicketId::UNASSIGNED.0),
            created_at: Instant::now(),
            kind: Box::new(kind),
            completed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sync_state: (Mutex::new(TicketState::default()), Condvar::new()),
            to_close: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn described(description: impl Into<String>) -> Arc<Self> {
        Self::new(Described(description.into()))
    }

    fn state(&self) -> MutexGuard<'_, TicketState> {
        self.sync_state
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // " 42" once an id is assigned, empty before
    fn label(&self) -> String {
        let id = self.id();
        if id.is_assigned() {
            format!(" {id}")
        } else {
            String::new()
        }
    }

    pub fn id(&self) -> TicketId {
        TicketId(self.id.load(Ordering::SeqCst))
    }

    pub(crate) fn set_id(&self, id: TicketId) {
        self.id.store(id.0, Ordering::SeqCst);
    }

    pub fn kind(&self) -> &dyn TicketKind {
        self.kind.as_ref()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Records activity; the pre-completion timeout then counts from now.
    pub fn stamp(&self) {
        self.state().stamp = Some(Instant::now());
    }

    pub fn stamped_at(&self) -> Option<Instant> {
        self.state().stamp
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.state().timeout
    }

    /// `None` falls back to the repository default, `Some(Duration::ZERO)`
    /// never times out before completion.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.state().timeout = timeout;
    }

    pub fn status(&self) -> String {
        self.kind.status(self)
    }

    /// Called by the repository when the ticket timed out.
    pub fn expired(&self) {
        self.kind.on_expired(self);
    }

    pub fn set_error(&self, message: impl Into<String>) {
        self.record_error(message.into(), None);
    }

    /// Stores `"message (cause)"`.
    pub fn set_error_with(&self, message: impl Into<String>, cause: impl fmt::Display) {
        self.record_error(message.into(), Some(format!("{cause:#}")));
    }

    fn record_error(&self, mut message: String, cause: Option<String>) {
        let mut state = self.state();
        if let Some(existing) = &state.error {
            debug!(
                "Error ignored: {message} (ticket{} already failed with: {existing})",
                self.label()
            );
            return;
        }
        if message.is_empty() {
            warn!("Ticket{}: no error message specified", self.label());
            message = "no-message".to_string();
        }
        if let Some(cause) = cause.filter(|cause| !cause.is_empty()) {
            message = format!("{message} ({cause})");
        }
        state.error = Some(message);
        state.errored_at = Some(Instant::now());
    }

    pub fn error(&self) -> Option<String> {
        self.state().error.clone()
    }

    pub fn has_error(&self) -> bool {
        self.state().error.is_some()
    }

    pub fn errored_at(&self) -> Option<Instant> {
        self.state().errored_at
    }

    /// Marks the work as done and wakes everybody waiting in `close`.
    pub fn completed(&self) {
        if self
            .completed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Ticket{} already completed", self.label());
            return;
        }
        debug!("Ticket{} completed", self.label());
        let mut state = self.state();
        state.completed_at = Some(Instant::now());
        release(&mut state);
        self.sync_state.1.notify_all();
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn completed_at(&self) -> Option<Instant> {
        self.state().completed_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn closed_at(&self) -> Option<Instant> {
        self.state().closed_at
    }

    /// Resolves once the ticket is completed or closed.
    pub fn completion(&self) -> impl Future<Output = ()> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state();
            if self.is_completed() || self.is_closed() {
                let _ = tx.send(());
            } else {
                state.waiters.push(tx);
            }
        }
        async move {
            // a dropped ticket cancels the sender, which resolves too
            let _ = rx.await;
        }
    }

    /// Registers a resource to release on close. A ticket that is already
    /// closed releases it right away.
    pub fn to_close(&self, closable: impl Closable) {
        self.to_close_boxed(Box::new(closable));
    }

    pub fn to_close_all(&self, closables: impl IntoIterator<Item = Box<dyn Closable>>) {
        for closable in closables {
            self.to_close_boxed(closable);
        }
    }

    fn to_close_boxed(&self, closable: Box<dyn Closable>) {
        let mut to_close = self.to_close.lock().unwrap_or_else(|p| p.into_inner());
        if self.is_closed() {
            drop(to_close);
            self.close_one(closable);
        } else {
            to_close.push(closable);
        }
    }

    fn close_one(&self, closable: Box<dyn Closable>) {
        let name = closable.name();
        debug!("Closing: {name}");
        if let Err(e) = closable.close() {
            warn!("Ticket{}: failed to close {name}: {e:#}", self.label());
        }
    }

    pub fn add_listener(&self, listener: impl TicketListener) {
        self.listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Box::new(listener));
    }

    pub fn notify_users(&self) {
        let listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
        for listener in listeners.iter() {
            listener.notify(self);
        }
    }

    /// Waits up to `wait` for completion (`Duration::MAX` waits forever,
    /// zero does not wait), then closes the ticket. Only the first call
    /// releases the registered closables.
    pub fn close(&self, wait: Duration) {
        let sid = self.label();
        if !self.is_closed() && !wait.is_zero() && !self.is_completed() {
            debug!("Wait for completion of ticket{sid} ({wait:?})");
            let cvar = &self.sync_state.1;
            let deadline = Instant::now().checked_add(wait);
            let mut state = self.state();
            while !self.is_closed() && !self.is_completed() {
                state = match deadline {
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        match cvar.wait_timeout(state, deadline - now) {
                            Ok((guard, _)) => guard,
                            Err(poisoned) => poisoned.into_inner().0,
                        }
                    }
                    None => cvar.wait(state).unwrap_or_else(|p| p.into_inner()),
                };
            }
        }
        debug!("Ticket{sid} is ready to be closed");
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Ticket{sid} already closed");
            return;
        }
        let closables = mem::take(&mut *self.to_close.lock().unwrap_or_else(|p| p.into_inner()));
        for closable in closables {
            self.close_one(closable);
        }
        self.kind.on_close(self);
        let mut state = self.state();
        state.closed_at = Some(Instant::now());
        release(&mut state);
        self.sync_state.1.notify_all();
        debug!("Ticket{sid} closed");
    }
}

fn release(state: &mut TicketState) {
    for waiter in state.waiters.drain(..) {
        let _ = waiter.send(());
    }
}

impl PartialEq for Ticket {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self, other)
    }
}

impl Eq for Ticket {}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("id", &self.id())
            .field("completed", &self.is_completed())
            .field("closed", &self.is_closed())
            .field("error", &self.error())
            .finish()
    }
}
