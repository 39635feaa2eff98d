// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use async_channel::{Receiver, Sender};
use log::debug;

use crate::ticket::handle::{Ticket, TicketListener};
use crate::ticket::TicketId;

/// Forwards the id of every notifying ticket into an async channel, for
/// front-ends that react to abandoned tickets from an executor.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    sender: Sender<TicketId>,
}

impl ChannelListener {
    pub fn new(sender: Sender<TicketId>) -> Self {
        Self { sender }
    }

    /// A listener together with the unbounded receiving end.
    pub fn unbounded() -> (Self, Receiver<TicketId>) {
        let (sender, receiver) = async_channel::unbounded();
        (Self::new(sender), receiver)
    }
}

impl TicketListener for ChannelListener {
    fn notify(&self, ticket: &Ticket) {
        if self.sender.try_send(ticket.id()).is_err() {
            debug!("Nobody listens for ticket {} any more", ticket.id());
        }
    }
}
