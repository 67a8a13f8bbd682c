//! Stored inbound message types.

use chrono::{DateTime, Utc};

use crate::{ConnectorId, InboxMessageId, ProjectId, TenantId, TicketId};

/// An inbound message as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxMessage {
    /// Row id.
    pub id: InboxMessageId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Connector it was fetched through.
    pub connector_id: ConnectorId,
    /// Project of the ticket, or the mailbox default when unassigned.
    pub project_id: Option<ProjectId>,
    /// Mailbox that received it.
    pub mailbox_address: String,
    /// IMAP UID at fetch time.
    pub uid: Option<u32>,
    /// Normalised Message-ID.
    pub message_id: String,
    /// Normalised `In-Reply-To`.
    pub in_reply_to: Option<String>,
    /// Normalised `References`.
    pub references: Vec<String>,
    /// Oldest known ancestor.
    pub thread_ref: Option<String>,
    /// Sender address.
    pub from_address: Option<String>,
    /// Sender display name.
    pub from_name: Option<String>,
    /// `To` recipients.
    pub to: Vec<String>,
    /// `Cc` recipients.
    pub cc: Vec<String>,
    /// Subject.
    pub subject: String,
    /// Plain text body.
    pub body_text: Option<String>,
    /// HTML body.
    pub body_html: Option<String>,
    /// Preview.
    pub snippet: String,
    /// Attached to an existing ticket as a continuation.
    pub is_reply: bool,
    /// Machine generated; never creates or updates tickets.
    pub is_auto_reply: bool,
    /// Number of attachments.
    pub attachment_count: u32,
    /// Raw size.
    pub size_bytes: u64,
    /// `Date` header.
    pub sent_at: Option<DateTime<Utc>>,
    /// When the engine stored it.
    pub received_at: DateTime<Utc>,
    /// Ticket it belongs to, if any.
    pub ticket_id: Option<TicketId>,
}

/// Attachment metadata; the bytes live in the object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttachment {
    /// File name.
    pub filename: String,
    /// `type/subtype`.
    pub content_type: String,
    /// Size of the contents.
    pub size_bytes: u64,
    /// Hex SHA-256 of the contents.
    pub checksum: String,
    /// `Content-ID`.
    pub content_id: Option<String>,
    /// Displayed inline.
    pub inline: bool,
    /// Object store location.
    pub storage_path: String,
}

/// Final status of one fetched message in the inbound log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundStatus {
    /// Stored (new or duplicate).
    Accepted,
    /// Stored without a ticket, or skipped by policy.
    Rejected,
    /// Could not be processed.
    Error,
}

impl InboundStatus {
    /// Parse from database string representation.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "accepted" => Self::Accepted,
            "rejected" => Self::Rejected,
            _ => Self::Error,
        }
    }

    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Error => "error",
        }
    }
}

/// One row of the inbound log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundLogEntry {
    /// Connector.
    pub connector_id: ConnectorId,
    /// Mailbox.
    pub mailbox_address: String,
    /// IMAP UID.
    pub uid: Option<u32>,
    /// Message-ID, when it could be read.
    pub message_id: Option<String>,
    /// Outcome.
    pub status: InboundStatus,
    /// Why, for anything other than a plain accept.
    pub reason: Option<String>,
    /// Ticket touched.
    pub ticket_id: Option<TicketId>,
    /// When it was logged.
    pub created_at: DateTime<Utc>,
}
