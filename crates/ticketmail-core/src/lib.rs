//! # ticketmail-core
//!
//! Email ingestion, threading and reply routing for a multi-tenant
//! ticketing platform.
//!
//! This crate provides:
//! - Connector registry with a validation state machine
//! - Inbound mailboxes with routing rules and new-ticket policy
//! - Per-mailbox sync cursor that doubles as a lease
//! - Inbound sync worker and scheduler (IMAP)
//! - Thread/VERP router (`In-Reply-To`/`References` and reply tokens)
//! - Outbound dispatcher (SMTP, DKIM, backoff, per-connector pools)
//! - Suppression list and bounce classification
//! - Tenant-scoped storage (`SQLite`) with write guards

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod address;
pub mod config;
pub mod connector;
mod error;
pub mod events;
pub mod inbox;
pub mod ingest;
pub mod mailbox;
pub mod objects;
pub mod outbound;
pub mod routing;
pub mod store;
pub mod suppression;
pub mod sync_status;
pub mod tenant;
pub mod ticket;
pub mod transport;

pub use config::EngineConfig;
pub use error::{Error, Result, TransportError};
pub use store::{Store, TenantTx};
pub use tenant::{
    ConnectorId, InboxMessageId, MailboxId, ProjectId, TenantContext, TenantId, TicketId,
};
