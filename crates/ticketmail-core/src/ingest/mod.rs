//! Inbound sync.
//!
//! [`SyncWorker`] runs one leased cycle for one mailbox: fetch UIDs above
//! the cursor, parse, dedupe, resolve the thread, create or append the
//! ticket, log and checkpoint, one transaction per message.
//! [`SyncScheduler`] fans those cycles out over a bounded task pool.

pub mod imap;
mod scheduler;
mod worker;

pub use imap::ImapProtocol;
pub use scheduler::SyncScheduler;
pub use worker::{Collaborators, CycleOutcome, CycleReport, SyncWorker};
