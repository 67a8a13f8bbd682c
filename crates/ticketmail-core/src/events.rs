//! Events emitted after a message transaction commits.

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{InboxMessageId, ProjectId, TenantId, TicketId};

/// Something downstream consumers may react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailEvent {
    /// A new ticket was opened from an inbound message.
    TicketCreated {
        /// Tenant.
        tenant_id: TenantId,
        /// New ticket.
        ticket_id: TicketId,
        /// Its project.
        project_id: ProjectId,
        /// Message that opened it.
        inbox_message_id: InboxMessageId,
    },
    /// A reply was appended to an existing ticket.
    MessageCreated {
        /// Tenant.
        tenant_id: TenantId,
        /// Ticket.
        ticket_id: TicketId,
        /// Appended message.
        inbox_message_id: InboxMessageId,
    },
}

/// Receiver of committed events. Emission must not fail the caller.
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    fn emit(&self, event: MailEvent);
}

/// Logs events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: MailEvent) {
        match event {
            MailEvent::TicketCreated {
                tenant_id,
                ticket_id,
                project_id,
                inbox_message_id,
            } => info!(
                %tenant_id, %ticket_id, %project_id, %inbox_message_id,
                "Ticket created from email"
            ),
            MailEvent::MessageCreated {
                tenant_id,
                ticket_id,
                inbox_message_id,
            } => info!(%tenant_id, %ticket_id, %inbox_message_id, "Email appended to ticket"),
        }
    }
}

/// Forwards events into a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<MailEvent>,
}

impl ChannelEventSink {
    /// Create a sink and the receiving end.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MailEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: MailEvent) {
        if self.sender.send(event).is_err() {
            warn!("Event receiver dropped; event discarded");
        }
    }
}
