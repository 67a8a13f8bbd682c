//! Inbound mailbox registry.
//!
//! A mailbox is a logical address polled through one inbound connector,
//! with a default project, ordered routing rules and a new-ticket policy.

mod model;
mod repository;

pub use model::{
    Mailbox, NewMailbox, NewTicketDecision, RoutingRule, RuleInput, RuleMatch, SyncTarget,
};
pub use repository::MailboxRepository;
pub(crate) use repository::{fetch as fetch_mailbox, fetch_by_address};
