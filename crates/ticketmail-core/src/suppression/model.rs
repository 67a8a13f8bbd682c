//! Suppression and bounce model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ProjectId, TenantId, TicketId};

/// Delivery failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BounceKind {
    /// Permanent rejection; the address is suppressed.
    Hard,
    /// Temporary rejection; recorded only.
    Soft,
    /// Recipient marked the message as spam; the address is suppressed.
    Complaint,
}

impl BounceKind {
    /// Parse from database string representation.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "hard" => Self::Hard,
            "complaint" => Self::Complaint,
            _ => Self::Soft,
        }
    }

    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Hard => "hard",
            Self::Soft => "soft",
            Self::Complaint => "complaint",
        }
    }

    /// Whether this kind adds the recipient to the suppression list.
    #[must_use]
    pub const fn suppresses(&self) -> bool {
        matches!(self, Self::Hard | Self::Complaint)
    }
}

/// Where a suppression entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressionSource {
    /// Hard bounce, either from feedback or an SMTP 5xx reply.
    HardBounce,
    /// Spam complaint.
    Complaint,
    /// Added by an operator.
    Manual,
}

impl SuppressionSource {
    /// Parse from database string representation.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "hard_bounce" => Self::HardBounce,
            "complaint" => Self::Complaint,
            _ => Self::Manual,
        }
    }

    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::HardBounce => "hard_bounce",
            Self::Complaint => "complaint",
            Self::Manual => "manual",
        }
    }
}

impl From<BounceKind> for SuppressionSource {
    fn from(kind: BounceKind) -> Self {
        match kind {
            BounceKind::Complaint => Self::Complaint,
            BounceKind::Hard | BounceKind::Soft => Self::HardBounce,
        }
    }
}

/// An address the tenant must not send to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suppression {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Normalised address.
    pub address: String,
    /// Human-readable cause.
    pub reason: String,
    /// Origin of the entry.
    pub source: SuppressionSource,
    /// When it was added.
    pub created_at: DateTime<Utc>,
}

/// Bounce or complaint feedback as delivered by a provider webhook or DSN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BounceEvent {
    /// Message-ID of the outbound message that bounced.
    #[serde(default)]
    pub message_id: Option<String>,
    /// Rejected recipient.
    pub recipient: String,
    /// Classification, if the provider supplied one.
    #[serde(default)]
    pub kind: Option<BounceKind>,
    /// DSN (`5.1.1`) or SMTP (`550`) status.
    #[serde(default)]
    pub status: Option<String>,
    /// Diagnostic text from the remote server.
    #[serde(default)]
    pub diagnostic: Option<String>,
    /// When the bounce happened.
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
    /// Original payload, kept verbatim.
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl BounceEvent {
    /// Minimal event for a recipient.
    #[must_use]
    pub fn new(recipient: impl Into<String>) -> Self {
        Self {
            message_id: None,
            recipient: recipient.into(),
            kind: None,
            status: None,
            diagnostic: None,
            occurred_at: None,
            raw: serde_json::Value::Null,
        }
    }
}

/// A stored bounce.
#[derive(Debug, Clone, PartialEq)]
pub struct Bounce {
    /// Row id.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Outbound Message-ID.
    pub message_id: Option<String>,
    /// Normalised recipient.
    pub recipient: String,
    /// Final classification.
    pub kind: BounceKind,
    /// Status code as reported.
    pub status_code: Option<String>,
    /// Diagnostic text.
    pub diagnostic: Option<String>,
    /// Ticket of the outbound message, when known.
    pub ticket_id: Option<TicketId>,
    /// Project of the outbound message, when known.
    pub project_id: Option<ProjectId>,
    /// Whether this bounce (or an earlier one) suppresses the recipient.
    pub suppressed: bool,
    /// When it happened.
    pub occurred_at: DateTime<Utc>,
}

/// Decide the bounce class of an event.
///
/// An explicit kind wins. Otherwise the status code decides (`5.x.x` or
/// `5xx` is hard, `4.x.x` or `4xx` soft), then complaint wording in the
/// diagnostic. Anything else is treated as soft.
#[must_use]
pub fn classify(event: &BounceEvent) -> BounceKind {
    if let Some(kind) = event.kind {
        return kind;
    }

    let diagnostic = event.diagnostic.as_deref().unwrap_or_default();
    let code = event
        .status
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| Some(diagnostic.trim_start()).filter(|s| s.starts_with(|c: char| c.is_ascii_digit())));

    match code.and_then(|c| c.chars().next()) {
        Some('5') => return BounceKind::Hard,
        Some('4') => return BounceKind::Soft,
        _ => {}
    }

    let lowered = diagnostic.to_lowercase();
    if lowered.contains("complaint") || lowered.contains("abuse") {
        BounceKind::Complaint
    } else {
        BounceKind::Soft
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn event(status: Option<&str>, diagnostic: Option<&str>) -> BounceEvent {
        BounceEvent {
            status: status.map(Into::into),
            diagnostic: diagnostic.map(Into::into),
            ..BounceEvent::new("user@example.com")
        }
    }

    #[test]
    fn explicit_kind_wins() {
        let mut e = event(Some("5.1.1"), None);
        e.kind = Some(BounceKind::Soft);
        assert_eq!(classify(&e), BounceKind::Soft);
    }

    #[test]
    fn status_codes() {
        assert_eq!(classify(&event(Some("5.1.1"), None)), BounceKind::Hard);
        assert_eq!(classify(&event(Some("550"), None)), BounceKind::Hard);
        assert_eq!(classify(&event(Some("4.2.2"), None)), BounceKind::Soft);
        assert_eq!(classify(&event(Some("421"), None)), BounceKind::Soft);
        assert_eq!(
            classify(&event(None, Some("550 5.1.1 mailbox unavailable"))),
            BounceKind::Hard
        );
    }

    #[test]
    fn complaints_and_unknowns() {
        assert_eq!(
            classify(&event(None, Some("Feedback: abuse report"))),
            BounceKind::Complaint
        );
        assert_eq!(classify(&event(None, None)), BounceKind::Soft);
        assert_eq!(classify(&event(Some("2.0.0"), Some("odd"))), BounceKind::Soft);
    }

    #[test]
    fn deserializes_webhook_payload() {
        let json = r#"{"recipient":"a@b.com","kind":"complaint","raw":{"id":7}}"#;
        let e: BounceEvent = serde_json::from_str(json).unwrap();
        assert_eq!(e.recipient, "a@b.com");
        assert_eq!(e.kind, Some(BounceKind::Complaint));
        assert_eq!(e.raw["id"], 7);
        assert!(BounceKind::Complaint.suppresses());
        assert!(!BounceKind::Soft.suppresses());
    }
}
