//! Routing model types and token helpers.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::address;
use crate::{TenantId, TicketId};

/// Length of a public routing token.
pub const TOKEN_LEN: usize = 32;

/// Reply-routing state of one ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketRouting {
    /// Row id.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Routed ticket.
    pub ticket_id: TicketId,
    /// Unguessable token carried in the reply address.
    pub public_token: String,
    /// `local+token@domain`.
    pub reply_address: String,
    /// Message-ID that started the conversation.
    pub message_id_root: String,
    /// When the row was minted.
    pub created_at: DateTime<Utc>,
    /// Set once the row stops resolving.
    pub revoked_at: Option<DateTime<Utc>>,
}

impl TicketRouting {
    /// Whether the row still resolves replies.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }
}

/// Threading evidence extracted from an inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadSignals {
    /// The message's own Message-ID. A copy of a conversation root
    /// delivered to a second mailbox continues the ticket it opened.
    pub message_id: Option<String>,
    /// `In-Reply-To` header.
    pub in_reply_to: Option<String>,
    /// `References` header, oldest first as it appears on the wire.
    pub references: Vec<String>,
    /// Every envelope and header recipient (To, Cc, Delivered-To, X-Original-To).
    pub recipients: Vec<String>,
}

/// How a continuation was recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    /// `In-Reply-To` or `References` matched a conversation root.
    Header,
    /// A recipient carried a routing token.
    Token,
}

/// Outcome of thread resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The message belongs to an existing ticket.
    Continuation {
        /// Ticket to append to.
        ticket_id: TicketId,
        /// Evidence used.
        via: MatchSource,
    },
    /// Nothing matched; candidate for a new ticket.
    NoMatch,
    /// Evidence points at several tickets; needs manual review.
    Ambiguous {
        /// Conflicting tickets, sorted.
        candidates: Vec<TicketId>,
    },
}

impl Resolution {
    /// Ticket this resolution attaches to, if any.
    #[must_use]
    pub const fn ticket_id(&self) -> Option<TicketId> {
        match self {
            Self::Continuation { ticket_id, .. } => Some(*ticket_id),
            Self::NoMatch | Self::Ambiguous { .. } => None,
        }
    }
}

/// A fresh token: 32 lowercase hex characters from a random UUID.
#[must_use]
pub fn mint_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Whether `candidate` has the shape of a minted token.
#[must_use]
pub fn is_token(candidate: &str) -> bool {
    candidate.len() == TOKEN_LEN
        && candidate
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// `local+token@domain` for a mailbox address. An existing plus tag on the
/// mailbox is replaced.
#[must_use]
pub fn reply_address(mailbox_address: &str, token: &str) -> Option<String> {
    let normalized = address::normalize(mailbox_address);
    let (local, domain) = address::split(&normalized)?;
    let base = local.split_once('+').map_or(local, |(base, _)| base);
    Some(format!("{base}+{token}@{domain}"))
}

/// The routing token carried by a recipient address, if well formed.
#[must_use]
pub fn token_of(recipient: &str) -> Option<String> {
    let normalized = address::normalize(recipient);
    address::plus_tag(&normalized)
        .filter(|tag| is_token(tag))
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_32_lowercase_hex() {
        let token = mint_token();
        assert!(is_token(&token));
        assert_ne!(token, mint_token());
        assert!(!is_token("ABCDEF0123456789abcdef0123456789"));
        assert!(!is_token("short"));
        assert!(!is_token("g123456789abcdef0123456789abcdef"));
    }

    #[test]
    fn reply_address_uses_mailbox_parts() {
        let token = "0123456789abcdef0123456789abcdef";
        assert_eq!(
            reply_address("Support@Acme.com", token).as_deref(),
            Some("support+0123456789abcdef0123456789abcdef@acme.com")
        );
        assert_eq!(
            reply_address("support+old@acme.com", token).as_deref(),
            Some("support+0123456789abcdef0123456789abcdef@acme.com")
        );
        assert_eq!(reply_address("not-an-address", token), None);
    }

    #[test]
    fn token_extraction() {
        let token = mint_token();
        assert_eq!(
            token_of(&format!("<Support+{token}@acme.com>")),
            Some(token.clone())
        );
        assert_eq!(token_of("support+sales@acme.com"), None);
        assert_eq!(token_of("support@acme.com"), None);
    }
}
