//! Outbound request, log and outcome types.

use chrono::{DateTime, Utc};

use crate::{ConnectorId, ProjectId, TicketId};

/// Delivery state of one outbound attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundStatus {
    /// Accepted by the dispatcher, not yet handed to the transport.
    Queued,
    /// Accepted by the server.
    Sent,
    /// Transient failure or rate limit; may be retried later.
    Deferred,
    /// Permanent recipient failure.
    Bounced,
    /// Configuration, authentication or other failure.
    Error,
    /// Nothing sent because every recipient is suppressed.
    Skipped,
}

impl OutboundStatus {
    /// Parse from database string.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "queued" => Self::Queued,
            "sent" => Self::Sent,
            "deferred" => Self::Deferred,
            "bounced" => Self::Bounced,
            "skipped" => Self::Skipped,
            _ => Self::Error,
        }
    }

    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Deferred => "deferred",
            Self::Bounced => "bounced",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }
}

/// A reply to send on behalf of a ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    /// Ticket the reply belongs to.
    pub ticket_id: TicketId,
    /// Project for the log row; defaults to the sending mailbox's project.
    pub project_id: Option<ProjectId>,
    /// Outbound connector to send through.
    pub connector_id: ConnectorId,
    /// Sending mailbox address; must be a mailbox of the tenant.
    pub from: String,
    /// Display name for `From`.
    pub from_name: Option<String>,
    /// Primary recipients.
    pub to: Vec<String>,
    /// Copy recipients.
    pub cc: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Plain text body.
    pub text: String,
    /// HTML alternative.
    pub html: Option<String>,
    /// Caller-chosen Message-ID; makes re-submission idempotent.
    pub message_id: Option<String>,
}

/// One row of the outbound audit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    /// Message-ID of the attempt.
    pub message_id: String,
    /// Connector used.
    pub connector_id: ConnectorId,
    /// Ticket.
    pub ticket_id: Option<TicketId>,
    /// Project.
    pub project_id: Option<ProjectId>,
    /// Recipients the transport was asked to deliver to.
    pub recipients: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Current state.
    pub status: OutboundStatus,
    /// Why it is in that state.
    pub reason: Option<String>,
    /// Transport attempts made.
    pub attempt_count: u32,
    /// First logged.
    pub created_at: DateTime<Utc>,
    /// Last transition.
    pub updated_at: DateTime<Utc>,
    /// Accepted by the server.
    pub sent_at: Option<DateTime<Utc>>,
}

/// What happened to a send request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Delivered to the server.
    Sent,
    /// This Message-ID was already sent; nothing done.
    Duplicate,
    /// No recipient left after suppression.
    Skipped(String),
    /// Rate limited or transient failures exhausted the retry budget.
    Deferred(String),
    /// Server rejected the recipients permanently.
    Bounced(String),
    /// Anything else, including ineligible connectors.
    Failed(String),
}

/// Result of [`OutboundDispatcher::send`](super::OutboundDispatcher::send).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    /// Message-ID used for the attempt.
    pub message_id: String,
    /// Outcome.
    pub outcome: SendOutcome,
    /// Recipients dropped because they are suppressed.
    pub suppressed: Vec<String>,
    /// Transport attempts made.
    pub attempts: u32,
}
