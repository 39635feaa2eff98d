// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
//! # Design: Tickets
//!
//! A `Ticket` is the handle a caller keeps for a unit of asynchronous work.
//! The worker doing the work records errors on it, completes it and finally
//! closes it, which releases the resources registered with `to_close`.
//!
//! ```text
//!   Open --set_error()*--> (first error sticks)
//!    |                           |
//!    +--completed()--> Completed-+--close(wait)--> Closed
//!    |                                               ^
//!    +-----------------------close(0)----------------+
//! ```
//!
//! The `TicketRepository` hands out ids, keeps tickets until they are checked
//! by their owner and closes them on its own once they time out.

use std::fmt;

pub mod handle;
pub mod listener;
pub mod repository;

pub use handle::{close_with, Closable, CompleteTicket, Described, Ticket, TicketKind, TicketListener};
pub use listener::ChannelListener;
pub use repository::{TicketCloser, TicketExpiry, TicketRepository};

/// Identifier assigned by a `TicketRepository`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TicketId(pub i64);

impl TicketId {
    /// Carried by tickets that were never added to a repository.
    pub const UNASSIGNED: TicketId = TicketId(-1);

    pub fn is_assigned(self) -> bool {
        self != Self::UNASSIGNED
    }

    /// Repository key: the id left-padded with zeros to ten digits.
    pub fn key(self) -> String {
        format!("{:010}", self.0)
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
