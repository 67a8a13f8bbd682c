//! Sync status model types.

use chrono::{DateTime, Utc};

use crate::{ConnectorId, TenantId};

/// Lifecycle of a mailbox's sync row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// Not being polled.
    #[default]
    Idle,
    /// A worker holds the lease.
    Syncing,
    /// Last cycle failed at mailbox level.
    Error,
    /// Operator paused polling.
    Paused,
}

impl SyncState {
    /// Parse from database string representation.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "syncing" => Self::Syncing,
            "error" => Self::Error,
            "paused" => Self::Paused,
            _ => Self::Idle,
        }
    }

    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Error => "error",
            Self::Paused => "paused",
        }
    }
}

/// Identifies one sync row inside a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncKey {
    /// Inbound connector.
    pub connector_id: ConnectorId,
    /// Normalised mailbox address.
    pub mailbox_address: String,
}

impl SyncKey {
    /// Key for a connector/mailbox pair.
    #[must_use]
    pub fn new(connector_id: ConnectorId, mailbox_address: &str) -> Self {
        Self {
            connector_id,
            mailbox_address: crate::address::normalize(mailbox_address),
        }
    }
}

/// Persisted cursor and lease of one mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Connector and mailbox.
    pub key: SyncKey,
    /// Highest committed IMAP UID.
    pub last_uid: u32,
    /// Date header of the last committed message.
    pub last_message_date: Option<DateTime<Utc>>,
    /// When the last cycle finished.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Lease state.
    pub state: SyncState,
    /// Mailbox-level failure of the last cycle.
    pub sync_error: Option<String>,
    /// New messages stored over the mailbox's lifetime.
    pub emails_synced_count: u64,
    /// Worker holding the lease.
    pub lease_owner: Option<String>,
    /// Last sign of life from the lease holder.
    pub lease_heartbeat_at: Option<DateTime<Utc>>,
}

/// A held mailbox lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Leased row.
    pub key: SyncKey,
    /// Holder identity.
    pub owner: String,
    /// Cursor at acquisition time.
    pub last_uid: u32,
    /// Whether a stale lease of a crashed worker was taken over.
    pub reclaimed: bool,
}

/// Result of trying to take a mailbox lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// Lease granted.
    Acquired(Lease),
    /// Another worker holds a fresh lease.
    Busy {
        /// Current holder.
        owner: Option<String>,
    },
    /// Operator paused the mailbox.
    Paused,
}

/// New cursor after committing `processed`; never moves backwards.
#[must_use]
pub fn advance_cursor(current: u32, processed: u32) -> u32 {
    current.max(processed)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn state_parse() {
        assert_eq!(SyncState::parse("paused"), SyncState::Paused);
        assert_eq!(SyncState::parse("unknown"), SyncState::Idle);
        assert_eq!(SyncState::Syncing.as_str(), "syncing");
    }

    proptest! {
        #[test]
        fn cursor_never_decreases(start in any::<u32>(), uids in proptest::collection::vec(any::<u32>(), 0..64)) {
            let mut cursor = start;
            for uid in uids {
                let next = advance_cursor(cursor, uid);
                prop_assert!(next >= cursor);
                prop_assert!(next >= uid);
                cursor = next;
            }
        }
    }
}
