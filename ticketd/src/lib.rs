// SPDX-License-Identifier: MIT
// ticketd: asynchronous work tracking and eviction
//
// - Polling schedulers with early wakeup, on-hold mode and time-of-day windows.
// - Keyed repositories whose entries expire and get updated inline or by a
//   worker pool.
// - Tickets: handles for asynchronous work, kept in a repository until
//   checked or timed out.
//
// Author: Johannes Leupolz <dev@leupolz.eu>

pub mod config;
pub mod error;
pub mod repository;
pub mod scheduler;
pub mod ticket;

pub use config::{RepositoryConfig, TicketRepositoryConfig};
pub use error::{ConfigError, SchedulerError, TicketError};
pub use repository::{KeyedRepository, StorageRepository};
pub use ticket::{Ticket, TicketId, TicketRepository};
