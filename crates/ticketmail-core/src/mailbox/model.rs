//! Mailbox model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ConnectorId, MailboxId, ProjectId, TenantId};

/// A case-insensitive substring predicate on one message field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMatch {
    /// Subject contains the pattern.
    SubjectContains(String),
    /// Sender address contains the pattern.
    FromContains(String),
    /// Any To/Cc address contains the pattern.
    ToContains(String),
}

/// One ordered routing rule of a mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Predicate.
    #[serde(rename = "match")]
    pub matcher: RuleMatch,
    /// Project for tickets created by this rule; the mailbox default when
    /// absent.
    #[serde(default)]
    pub project_id: Option<ProjectId>,
}

/// The fields routing rules look at.
#[derive(Debug, Clone, Copy)]
pub struct RuleInput<'a> {
    /// Subject line.
    pub subject: &'a str,
    /// Sender address.
    pub from: &'a str,
    /// To and Cc addresses.
    pub recipients: &'a [String],
}

impl RoutingRule {
    /// Whether the rule matches the message.
    #[must_use]
    pub fn matches(&self, input: &RuleInput<'_>) -> bool {
        let contains = |haystack: &str, needle: &str| {
            haystack.to_lowercase().contains(&needle.to_lowercase())
        };
        match &self.matcher {
            RuleMatch::SubjectContains(p) => contains(input.subject, p),
            RuleMatch::FromContains(p) => contains(input.from, p),
            RuleMatch::ToContains(p) => input.recipients.iter().any(|r| contains(r, p)),
        }
    }
}

/// A logical inbound address polled through one connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    /// Identifier.
    pub id: MailboxId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Inbound connector that polls this mailbox.
    pub connector_id: ConnectorId,
    /// Default project for new tickets.
    pub project_id: ProjectId,
    /// Normalised address, e.g. `support@acme.com`.
    pub address: String,
    /// IMAP folder to poll.
    pub folder: String,
    /// Ordered routing rules.
    pub routing_rules: Vec<RoutingRule>,
    /// Whether unmatched mail may open tickets.
    pub allow_new_ticket: bool,
    /// Operator switch.
    pub is_active: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Why a new-ticket candidate was turned away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NewTicketDecision {
    /// Create the ticket in this project.
    Create(ProjectId),
    /// Do not create; reason for the log.
    Reject(String),
}

impl Mailbox {
    /// Decide whether an unmatched message opens a ticket and where.
    ///
    /// With no rules every message qualifies for the default project; with
    /// rules, the first matching rule decides and no match rejects.
    #[must_use]
    pub fn new_ticket_decision(&self, input: &RuleInput<'_>) -> NewTicketDecision {
        if !self.allow_new_ticket {
            return NewTicketDecision::Reject(format!(
                "mailbox {} does not accept new tickets",
                self.address
            ));
        }
        if self.routing_rules.is_empty() {
            return NewTicketDecision::Create(self.project_id);
        }
        self.routing_rules
            .iter()
            .find(|rule| rule.matches(input))
            .map_or_else(
                || NewTicketDecision::Reject("no routing rule matched".to_string()),
                |rule| NewTicketDecision::Create(rule.project_id.unwrap_or(self.project_id)),
            )
    }
}

/// Input for creating a mailbox.
#[derive(Debug, Clone)]
pub struct NewMailbox {
    /// Inbound connector.
    pub connector_id: ConnectorId,
    /// Default project.
    pub project_id: ProjectId,
    /// Address.
    pub address: String,
    /// Folder; the connector's folder when `None`.
    pub folder: Option<String>,
    /// Ordered routing rules.
    pub routing_rules: Vec<RoutingRule>,
    /// Whether unmatched mail may open tickets.
    pub allow_new_ticket: bool,
}

/// A mailbox the scheduler should poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncTarget {
    /// Tenant.
    pub tenant_id: TenantId,
    /// Mailbox.
    pub mailbox_id: MailboxId,
}
