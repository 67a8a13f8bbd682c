//! Mailbox lease and cursor tracking.
//!
//! `sync_status = 'syncing'` is the cross-process mutual exclusion for a
//! mailbox. Every transition is a conditional `UPDATE`, so two workers
//! racing for the same row cannot both win. Release and checkpoint are
//! conditioned on the lease owner, so a worker whose stale lease was
//! reclaimed cannot overwrite its successor's state.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::{debug, info, warn};

use super::model::{Lease, LeaseOutcome, SyncKey, SyncState, SyncStatus};
use crate::store::{Store, TenantTx, get_id};
use crate::tenant::TenantContext;
use crate::{Error, Result};

/// Reads and transitions sync status rows.
#[derive(Debug, Clone)]
pub struct SyncStatusTracker {
    store: Store,
    stale_after: Duration,
}

impl SyncStatusTracker {
    /// Create a tracker; leases silent for longer than `stale_after` are
    /// reclaimable.
    #[must_use]
    pub const fn new(store: Store, stale_after: Duration) -> Self {
        Self { store, stale_after }
    }

    /// Try to take the lease for a mailbox.
    ///
    /// Succeeds from `idle` or `error`, or from `syncing` when the holder's
    /// heartbeat is older than the staleness threshold. The persisted
    /// cursor is kept in every case.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn acquire(
        &self,
        ctx: &TenantContext,
        key: &SyncKey,
        owner: &str,
    ) -> Result<LeaseOutcome> {
        let now_ms = Utc::now().timestamp_millis();
        let stale_before = now_ms - i64::try_from(self.stale_after.as_millis()).unwrap_or(i64::MAX);

        let mut tx = self.store.begin(ctx).await?;
        ensure_row(&mut tx, key).await?;
        let before = fetch(&mut tx, key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("sync status {}", key.mailbox_address)))?;

        let acquired: Option<i64> = sqlx::query_scalar(
            r"
            UPDATE sync_status SET
                sync_status = 'syncing', lease_owner = ?, lease_heartbeat_ms = ?
            WHERE tenant_id = ? AND connector_id = ? AND mailbox_address = ?
              AND (sync_status IN ('idle', 'error')
                   OR (sync_status = 'syncing'
                       AND (lease_heartbeat_ms IS NULL OR lease_heartbeat_ms < ?)))
            RETURNING last_uid
            ",
        )
        .bind(owner)
        .bind(now_ms)
        .bind(tx.tenant())
        .bind(key.connector_id.to_string())
        .bind(&key.mailbox_address)
        .bind(stale_before)
        .fetch_optional(tx.conn())
        .await?;
        tx.commit().await?;

        let outcome = match acquired {
            Some(last_uid) => {
                let reclaimed = before.state == SyncState::Syncing;
                if reclaimed {
                    warn!(
                        mailbox = %key.mailbox_address,
                        previous_owner = ?before.lease_owner,
                        "Reclaimed stale mailbox lease"
                    );
                }
                LeaseOutcome::Acquired(Lease {
                    key: key.clone(),
                    owner: owner.to_string(),
                    last_uid: u32::try_from(last_uid).unwrap_or(0),
                    reclaimed,
                })
            }
            None if before.state == SyncState::Paused => LeaseOutcome::Paused,
            None => LeaseOutcome::Busy {
                owner: before.lease_owner,
            },
        };
        debug!(mailbox = %key.mailbox_address, ?outcome, "Lease attempt");
        Ok(outcome)
    }

    /// Refresh the lease heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LeaseLost`] if the lease is no longer held.
    pub async fn heartbeat(&self, ctx: &TenantContext, lease: &Lease) -> Result<()> {
        let mut tx = self.store.begin(ctx).await?;
        let result = sqlx::query(
            r"
            UPDATE sync_status SET lease_heartbeat_ms = ?
            WHERE tenant_id = ? AND connector_id = ? AND mailbox_address = ?
              AND lease_owner = ? AND sync_status = 'syncing'
            ",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(tx.tenant())
        .bind(lease.key.connector_id.to_string())
        .bind(&lease.key.mailbox_address)
        .bind(&lease.owner)
        .execute(tx.conn())
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::LeaseLost(lease.key.mailbox_address.clone()));
        }
        tx.commit().await
    }

    /// End the cycle: `idle` on success, `error` with the message otherwise.
    ///
    /// Returns `false` if the lease had already been lost, in which case
    /// nothing is written.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn release(
        &self,
        ctx: &TenantContext,
        lease: &Lease,
        failure: Option<&str>,
    ) -> Result<bool> {
        let state = if failure.is_some() {
            SyncState::Error
        } else {
            SyncState::Idle
        };
        let mut tx = self.store.begin(ctx).await?;
        let result = sqlx::query(
            r"
            UPDATE sync_status SET
                sync_status = ?, sync_error = ?, last_sync_at = ?,
                lease_owner = NULL, lease_heartbeat_ms = NULL
            WHERE tenant_id = ? AND connector_id = ? AND mailbox_address = ?
              AND lease_owner = ? AND sync_status = 'syncing'
            ",
        )
        .bind(state.as_str())
        .bind(failure)
        .bind(Utc::now())
        .bind(tx.tenant())
        .bind(lease.key.connector_id.to_string())
        .bind(&lease.key.mailbox_address)
        .bind(&lease.owner)
        .execute(tx.conn())
        .await?;
        tx.commit().await?;

        let released = result.rows_affected() == 1;
        if !released {
            warn!(mailbox = %lease.key.mailbox_address, "Lease was lost before release");
        }
        Ok(released)
    }

    /// Operator pause; the worker skips the mailbox until resumed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn pause(&self, ctx: &TenantContext, key: &SyncKey) -> Result<()> {
        let mut tx = self.store.begin(ctx).await?;
        ensure_row(&mut tx, key).await?;
        sqlx::query(
            r"
            UPDATE sync_status SET sync_status = 'paused', lease_owner = NULL,
                lease_heartbeat_ms = NULL
            WHERE tenant_id = ? AND connector_id = ? AND mailbox_address = ?
            ",
        )
        .bind(tx.tenant())
        .bind(key.connector_id.to_string())
        .bind(&key.mailbox_address)
        .execute(tx.conn())
        .await?;
        tx.commit().await?;
        info!(mailbox = %key.mailbox_address, "Mailbox sync paused");
        Ok(())
    }

    /// Undo a pause.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn resume(&self, ctx: &TenantContext, key: &SyncKey) -> Result<()> {
        let mut tx = self.store.begin(ctx).await?;
        sqlx::query(
            r"
            UPDATE sync_status SET sync_status = 'idle'
            WHERE tenant_id = ? AND connector_id = ? AND mailbox_address = ?
              AND sync_status = 'paused'
            ",
        )
        .bind(tx.tenant())
        .bind(key.connector_id.to_string())
        .bind(&key.mailbox_address)
        .execute(tx.conn())
        .await?;
        tx.commit().await?;
        info!(mailbox = %key.mailbox_address, "Mailbox sync resumed");
        Ok(())
    }

    /// Current status of a mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, ctx: &TenantContext, key: &SyncKey) -> Result<Option<SyncStatus>> {
        let mut tx = self.store.begin(ctx).await?;
        let status = fetch(&mut tx, key).await?;
        tx.commit().await?;
        Ok(status)
    }
}

/// Advance the cursor as part of a message's transaction.
///
/// `last_uid` only ever grows. `counted` adds one to the synced counter
/// (duplicates and failures are checkpointed without counting).
///
/// # Errors
///
/// Returns [`Error::LeaseLost`] if the caller no longer holds the lease,
/// which must abort the enclosing transaction.
pub(crate) async fn checkpoint(
    tx: &mut TenantTx,
    lease: &Lease,
    uid: u32,
    message_date: Option<DateTime<Utc>>,
    counted: bool,
) -> Result<()> {
    let result = sqlx::query(
        r"
        UPDATE sync_status SET
            last_uid = MAX(last_uid, ?),
            last_message_date = COALESCE(?, last_message_date),
            emails_synced_count = emails_synced_count + ?,
            lease_heartbeat_ms = ?
        WHERE tenant_id = ? AND connector_id = ? AND mailbox_address = ?
          AND lease_owner = ? AND sync_status = 'syncing'
        ",
    )
    .bind(i64::from(uid))
    .bind(message_date)
    .bind(i64::from(counted))
    .bind(Utc::now().timestamp_millis())
    .bind(tx.tenant())
    .bind(lease.key.connector_id.to_string())
    .bind(&lease.key.mailbox_address)
    .bind(&lease.owner)
    .execute(tx.conn())
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::LeaseLost(lease.key.mailbox_address.clone()));
    }
    Ok(())
}

async fn ensure_row(tx: &mut TenantTx, key: &SyncKey) -> Result<()> {
    sqlx::query(
        r"
        INSERT OR IGNORE INTO sync_status (tenant_id, connector_id, mailbox_address)
        VALUES (?, ?, ?)
        ",
    )
    .bind(tx.tenant())
    .bind(key.connector_id.to_string())
    .bind(&key.mailbox_address)
    .execute(tx.conn())
    .await?;
    Ok(())
}

async fn fetch(tx: &mut TenantTx, key: &SyncKey) -> Result<Option<SyncStatus>> {
    let row = sqlx::query(
        r"
        SELECT tenant_id, connector_id, mailbox_address, last_uid, last_message_date,
               last_sync_at, sync_status, sync_error, emails_synced_count,
               lease_owner, lease_heartbeat_ms
        FROM sync_status
        WHERE tenant_id = ? AND connector_id = ? AND mailbox_address = ?
        ",
    )
    .bind(tx.tenant())
    .bind(key.connector_id.to_string())
    .bind(&key.mailbox_address)
    .fetch_optional(tx.conn())
    .await?;
    row.as_ref().map(row_to_status).transpose()
}

/// Convert a database row to a `SyncStatus`.
fn row_to_status(row: &SqliteRow) -> Result<SyncStatus> {
    let last_uid: i64 = row.try_get("last_uid")?;
    let synced: i64 = row.try_get("emails_synced_count")?;
    let heartbeat: Option<i64> = row.try_get("lease_heartbeat_ms")?;
    Ok(SyncStatus {
        tenant_id: get_id(row, "tenant_id")?,
        key: SyncKey {
            connector_id: get_id(row, "connector_id")?,
            mailbox_address: row.try_get("mailbox_address")?,
        },
        last_uid: u32::try_from(last_uid)
            .map_err(|_| Error::Corrupt(format!("last_uid out of range: {last_uid}")))?,
        last_message_date: row.try_get("last_message_date")?,
        last_sync_at: row.try_get("last_sync_at")?,
        state: SyncState::parse(row.try_get("sync_status")?),
        sync_error: row.try_get("sync_error")?,
        emails_synced_count: u64::try_from(synced).unwrap_or(0),
        lease_owner: row.try_get("lease_owner")?,
        lease_heartbeat_at: heartbeat.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::connector::{ConnectorRepository, MemoryCredentialStore, NewConnector};
    use crate::TenantId;

    async fn setup(stale_after: Duration) -> (SyncStatusTracker, Store, TenantContext, SyncKey) {
        let store = Store::in_memory().await.unwrap();
        let ctx = TenantContext::new(TenantId::new());
        let connectors =
            ConnectorRepository::new(store.clone(), Arc::new(MemoryCredentialStore::new()));
        let connector = connectors
            .create(
                &ctx,
                NewConnector {
                    project_id: None,
                    name: "Support".into(),
                    kind: crate::connector::imap_kind(),
                },
                &[],
            )
            .await
            .unwrap();
        let key = SyncKey::new(connector.id, "support@acme.com");
        (SyncStatusTracker::new(store.clone(), stale_after), store, ctx, key)
    }

    fn acquired(outcome: LeaseOutcome) -> Lease {
        match outcome {
            LeaseOutcome::Acquired(lease) => lease,
            other => panic!("expected lease, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_second_worker_is_busy() {
        let (tracker, _, ctx, key) = setup(Duration::from_secs(600)).await;

        let lease = acquired(tracker.acquire(&ctx, &key, "worker-a").await.unwrap());
        assert_eq!(lease.last_uid, 0);
        assert!(!lease.reclaimed);

        assert_eq!(
            tracker.acquire(&ctx, &key, "worker-b").await.unwrap(),
            LeaseOutcome::Busy {
                owner: Some("worker-a".into())
            }
        );

        assert!(tracker.release(&ctx, &lease, None).await.unwrap());
        acquired(tracker.acquire(&ctx, &key, "worker-b").await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_lease_is_reclaimed_with_cursor() {
        let (tracker, store, ctx, key) = setup(Duration::ZERO).await;

        let old = acquired(tracker.acquire(&ctx, &key, "crashed").await.unwrap());
        let mut tx = store.begin(&ctx).await.unwrap();
        checkpoint(&mut tx, &old, 42, None, true).await.unwrap();
        tx.commit().await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let lease = acquired(tracker.acquire(&ctx, &key, "rescuer").await.unwrap());
        assert!(lease.reclaimed);
        assert_eq!(lease.last_uid, 42);

        // The crashed worker can no longer write.
        assert!(!tracker.release(&ctx, &old, Some("late")).await.unwrap());
        let mut tx = store.begin(&ctx).await.unwrap();
        let err = checkpoint(&mut tx, &old, 50, None, true).await.unwrap_err();
        assert!(matches!(err, Error::LeaseLost(_)));
        drop(tx);

        let status = tracker.get(&ctx, &key).await.unwrap().unwrap();
        assert_eq!(status.lease_owner.as_deref(), Some("rescuer"));
        assert_eq!(status.last_uid, 42);
    }

    #[tokio::test]
    async fn test_paused_mailbox_is_skipped() {
        let (tracker, _, ctx, key) = setup(Duration::from_secs(600)).await;

        tracker.pause(&ctx, &key).await.unwrap();
        assert_eq!(
            tracker.acquire(&ctx, &key, "worker").await.unwrap(),
            LeaseOutcome::Paused
        );

        tracker.resume(&ctx, &key).await.unwrap();
        acquired(tracker.acquire(&ctx, &key, "worker").await.unwrap());
    }

    #[tokio::test]
    async fn test_pause_revokes_running_lease() {
        let (tracker, _, ctx, key) = setup(Duration::from_secs(600)).await;
        let lease = acquired(tracker.acquire(&ctx, &key, "worker").await.unwrap());

        tracker.pause(&ctx, &key).await.unwrap();
        assert!(matches!(
            tracker.heartbeat(&ctx, &lease).await,
            Err(Error::LeaseLost(_))
        ));
        assert!(!tracker.release(&ctx, &lease, None).await.unwrap());
        let status = tracker.get(&ctx, &key).await.unwrap().unwrap();
        assert_eq!(status.state, SyncState::Paused);
    }

    #[tokio::test]
    async fn test_checkpoint_is_monotonic_and_counts() {
        let (tracker, store, ctx, key) = setup(Duration::from_secs(600)).await;
        let lease = acquired(tracker.acquire(&ctx, &key, "worker").await.unwrap());

        for (uid, counted) in [(10, true), (7, false), (12, true)] {
            let mut tx = store.begin(&ctx).await.unwrap();
            checkpoint(&mut tx, &lease, uid, Some(Utc::now()), counted)
                .await
                .unwrap();
            tx.commit().await.unwrap();
        }

        let status = tracker.get(&ctx, &key).await.unwrap().unwrap();
        assert_eq!(status.last_uid, 12);
        assert_eq!(status.emails_synced_count, 2);
        assert!(status.last_message_date.is_some());
        assert!(status.lease_heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn test_error_release_keeps_message_and_allows_retry() {
        let (tracker, _, ctx, key) = setup(Duration::from_secs(600)).await;
        let lease = acquired(tracker.acquire(&ctx, &key, "worker").await.unwrap());

        tracker
            .release(&ctx, &lease, Some("authentication failed"))
            .await
            .unwrap();
        let status = tracker.get(&ctx, &key).await.unwrap().unwrap();
        assert_eq!(status.state, SyncState::Error);
        assert_eq!(status.sync_error.as_deref(), Some("authentication failed"));
        assert!(status.last_sync_at.is_some());
        assert!(status.lease_owner.is_none());

        let lease = acquired(tracker.acquire(&ctx, &key, "worker").await.unwrap());
        tracker.release(&ctx, &lease, None).await.unwrap();
        let status = tracker.get(&ctx, &key).await.unwrap().unwrap();
        assert_eq!(status.state, SyncState::Idle);
        assert!(status.sync_error.is_none());
    }

    #[tokio::test]
    async fn test_other_tenant_sees_nothing() {
        let (tracker, _, ctx, key) = setup(Duration::from_secs(600)).await;
        acquired(tracker.acquire(&ctx, &key, "worker").await.unwrap());

        let other = TenantContext::new(TenantId::new());
        assert!(tracker.get(&other, &key).await.unwrap().is_none());
    }
}
