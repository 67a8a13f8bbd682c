//! Per-mailbox sync cursor and lease.

mod model;
mod tracker;

pub use model::{Lease, LeaseOutcome, SyncKey, SyncState, SyncStatus, advance_cursor};
pub(crate) use tracker::checkpoint;
pub use tracker::SyncStatusTracker;
