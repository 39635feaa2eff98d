// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use thiserror::Error;

use crate::ticket::TicketId;

/// Raised by the synchronous ticket calls. The display text is the first
/// error recorded on the ticket, verbatim.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TicketError {
    #[error("{message}")]
    Failed { id: TicketId, message: String },
}

impl TicketError {
    pub fn id(&self) -> TicketId {
        match self {
            TicketError::Failed { id, .. } => *id,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            TicketError::Failed { message, .. } => message,
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler {0} has already been started")]
    AlreadyStarted(String),
    #[error("scheduler {0} has been shut down and cannot be restarted")]
    ShutDown(String),
    #[error("failed to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid time range '{0}', expected HH:MM-HH:MM")]
    InvalidTimeRange(String),
    #[error("could not read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
