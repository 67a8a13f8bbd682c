//! Suppression list and bounce feedback.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::{debug, info};
use uuid::Uuid;

use super::model::{Bounce, BounceEvent, BounceKind, Suppression, SuppressionSource, classify};
use crate::address;
use crate::store::{Store, TenantTx, get_id, get_opt_id};
use crate::tenant::TenantContext;
use crate::{Error, ProjectId, Result, TicketId};

/// Tenant-scoped suppression list and bounce log.
#[derive(Debug, Clone)]
pub struct SuppressionManager {
    store: Store,
}

impl SuppressionManager {
    /// Create a manager over the given store.
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self { store }
    }

    /// Whether the tenant must not send to `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn is_suppressed(&self, ctx: &TenantContext, address: &str) -> Result<bool> {
        let mut tx = self.store.begin(ctx).await?;
        let suppressed = is_suppressed_in(&mut tx, address).await?;
        tx.commit().await?;
        Ok(suppressed)
    }

    /// Add an address to the suppression list. Re-adding is a no-op.
    ///
    /// Returns `true` if the address was newly suppressed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn suppress(
        &self,
        ctx: &TenantContext,
        address: &str,
        reason: &str,
        source: SuppressionSource,
    ) -> Result<bool> {
        let mut tx = self.store.begin(ctx).await?;
        let added = suppress_in(&mut tx, address, reason, source).await?;
        tx.commit().await?;
        Ok(added)
    }

    /// Operator removal of a suppressed address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the address is not suppressed.
    pub async fn unsuppress(&self, ctx: &TenantContext, address: &str) -> Result<()> {
        let address = address::normalize(address);
        let mut tx = self.store.begin(ctx).await?;
        let result = sqlx::query("DELETE FROM suppressions WHERE tenant_id = ? AND address = ?")
            .bind(tx.tenant())
            .bind(&address)
            .execute(tx.conn())
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("suppression {address}")));
        }
        tx.commit().await?;
        info!(tenant_id = %ctx.tenant_id(), address = %address, "Removed suppression");
        Ok(())
    }

    /// All suppressed addresses of the tenant, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list(&self, ctx: &TenantContext) -> Result<Vec<Suppression>> {
        let mut tx = self.store.begin(ctx).await?;
        let rows = sqlx::query(
            r"
            SELECT tenant_id, address, reason, source, created_at
            FROM suppressions WHERE tenant_id = ?
            ORDER BY created_at DESC, address
            ",
        )
        .bind(tx.tenant())
        .fetch_all(tx.conn())
        .await?;
        tx.commit().await?;
        rows.iter().map(row_to_suppression).collect()
    }

    /// Record bounce or complaint feedback.
    ///
    /// Links the bounce to its outbound message (marking it `bounced` on a
    /// hard bounce) and suppresses the recipient for hard bounces and
    /// complaints.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn ingest(&self, ctx: &TenantContext, event: &BounceEvent) -> Result<Bounce> {
        let kind = classify(event);
        let mut tx = self.store.begin(ctx).await?;
        let bounce = record_bounce(&mut tx, event, kind).await?;
        tx.commit().await?;
        Ok(bounce)
    }

    /// Bounces recorded for a recipient, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn bounces_for(&self, ctx: &TenantContext, recipient: &str) -> Result<Vec<Bounce>> {
        let recipient = address::normalize(recipient);
        let mut tx = self.store.begin(ctx).await?;
        let suppressed = is_suppressed_in(&mut tx, &recipient).await?;
        let rows = sqlx::query(
            r"
            SELECT id, tenant_id, message_id, recipient, kind, status_code, diagnostic,
                   ticket_id, project_id, occurred_at
            FROM bounces WHERE tenant_id = ? AND recipient = ?
            ORDER BY occurred_at DESC
            ",
        )
        .bind(tx.tenant())
        .bind(&recipient)
        .fetch_all(tx.conn())
        .await?;
        tx.commit().await?;
        rows.iter().map(|row| row_to_bounce(row, suppressed)).collect()
    }
}

/// Point lookup on the suppression primary key.
pub(crate) async fn is_suppressed_in(tx: &mut TenantTx, address: &str) -> Result<bool> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM suppressions WHERE tenant_id = ? AND address = ?")
            .bind(tx.tenant())
            .bind(address::normalize(address))
            .fetch_optional(tx.conn())
            .await?;
    Ok(found.is_some())
}

pub(crate) async fn suppress_in(
    tx: &mut TenantTx,
    address: &str,
    reason: &str,
    source: SuppressionSource,
) -> Result<bool> {
    let address = address::normalize(address);
    let result = sqlx::query(
        r"
        INSERT OR IGNORE INTO suppressions (tenant_id, address, reason, source, created_at)
        VALUES (?, ?, ?, ?, ?)
        ",
    )
    .bind(tx.tenant())
    .bind(&address)
    .bind(reason)
    .bind(source.as_str())
    .bind(Utc::now())
    .execute(tx.conn())
    .await?;

    let added = result.rows_affected() == 1;
    if added {
        info!(tenant_id = %tx.tenant_id(), address = %address, source = source.as_str(), "Suppressed address");
    }
    Ok(added)
}

/// Store a classified bounce inside the caller's transaction.
pub(crate) async fn record_bounce(
    tx: &mut TenantTx,
    event: &BounceEvent,
    kind: BounceKind,
) -> Result<Bounce> {
    let recipient = address::normalize(&event.recipient);
    let message_id = event
        .message_id
        .as_deref()
        .and_then(address::normalize_message_id);
    let occurred_at = event.occurred_at.unwrap_or_else(Utc::now);

    let (ticket_id, project_id) = match &message_id {
        Some(id) => outbound_origin(tx, id).await?,
        None => (None, None),
    };

    let id = Uuid::new_v4();
    sqlx::query(
        r"
        INSERT INTO bounces (
            id, tenant_id, message_id, recipient, kind, status_code, diagnostic,
            ticket_id, project_id, raw, occurred_at, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(id.to_string())
    .bind(tx.tenant())
    .bind(&message_id)
    .bind(&recipient)
    .bind(kind.as_str())
    .bind(&event.status)
    .bind(&event.diagnostic)
    .bind(ticket_id.map(|t| t.to_string()))
    .bind(project_id.map(|p| p.to_string()))
    .bind(serde_json::to_string(&event.raw)?)
    .bind(occurred_at)
    .bind(Utc::now())
    .execute(tx.conn())
    .await?;

    if kind == BounceKind::Hard {
        if let Some(message_id) = &message_id {
            sqlx::query(
                r"
                UPDATE outbound_log SET status = 'bounced', reason = ?, updated_at = ?
                WHERE tenant_id = ? AND message_id = ?
                ",
            )
            .bind(bounce_reason(event, &recipient))
            .bind(Utc::now())
            .bind(tx.tenant())
            .bind(message_id)
            .execute(tx.conn())
            .await?;
        }
    }

    let suppressed = if kind.suppresses() {
        suppress_in(tx, &recipient, &bounce_reason(event, &recipient), kind.into()).await?;
        true
    } else {
        is_suppressed_in(tx, &recipient).await?
    };

    debug!(
        tenant_id = %tx.tenant_id(),
        recipient = %recipient,
        kind = kind.as_str(),
        message_id = ?message_id,
        "Recorded bounce"
    );

    Ok(Bounce {
        id,
        tenant_id: tx.tenant_id(),
        message_id,
        recipient,
        kind,
        status_code: event.status.clone(),
        diagnostic: event.diagnostic.clone(),
        ticket_id,
        project_id,
        suppressed,
        occurred_at,
    })
}

async fn outbound_origin(
    tx: &mut TenantTx,
    message_id: &str,
) -> Result<(Option<TicketId>, Option<ProjectId>)> {
    let row = sqlx::query(
        "SELECT ticket_id, project_id FROM outbound_log WHERE tenant_id = ? AND message_id = ?",
    )
    .bind(tx.tenant())
    .bind(message_id)
    .fetch_optional(tx.conn())
    .await?;
    match row {
        Some(row) => Ok((
            get_opt_id(&row, "ticket_id")?,
            get_opt_id(&row, "project_id")?,
        )),
        None => Ok((None, None)),
    }
}

fn bounce_reason(event: &BounceEvent, recipient: &str) -> String {
    match (&event.status, &event.diagnostic) {
        (Some(status), Some(diagnostic)) => format!("{recipient}: {status} {diagnostic}"),
        (Some(text), None) | (None, Some(text)) => format!("{recipient}: {text}"),
        (None, None) => format!("{recipient}: bounced"),
    }
}

fn row_to_suppression(row: &SqliteRow) -> Result<Suppression> {
    Ok(Suppression {
        tenant_id: get_id(row, "tenant_id")?,
        address: row.try_get("address")?,
        reason: row.try_get("reason")?,
        source: SuppressionSource::parse(row.try_get("source")?),
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_bounce(row: &SqliteRow, suppressed: bool) -> Result<Bounce> {
    let occurred_at: DateTime<Utc> = row.try_get("occurred_at")?;
    Ok(Bounce {
        id: get_id(row, "id")?,
        tenant_id: get_id(row, "tenant_id")?,
        message_id: row.try_get("message_id")?,
        recipient: row.try_get("recipient")?,
        kind: BounceKind::parse(row.try_get("kind")?),
        status_code: row.try_get("status_code")?,
        diagnostic: row.try_get("diagnostic")?,
        ticket_id: get_opt_id(row, "ticket_id")?,
        project_id: get_opt_id(row, "project_id")?,
        suppressed,
        occurred_at,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{ConnectorId, TenantId};

    async fn setup() -> (SuppressionManager, Store, TenantContext) {
        let store = Store::in_memory().await.unwrap();
        (
            SuppressionManager::new(store.clone()),
            store,
            TenantContext::new(TenantId::new()),
        )
    }

    async fn insert_outbound(store: &Store, ctx: &TenantContext, message_id: &str, ticket: TicketId) {
        let mut tx = store.begin(ctx).await.unwrap();
        sqlx::query(
            r"
            INSERT INTO outbound_log (tenant_id, message_id, connector_id, ticket_id,
                status, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'sent', ?, ?)
            ",
        )
        .bind(tx.tenant())
        .bind(message_id)
        .bind(ConnectorId::new().to_string())
        .bind(ticket.to_string())
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(tx.conn())
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    async fn outbound_status(store: &Store, ctx: &TenantContext, message_id: &str) -> String {
        let mut tx = store.begin(ctx).await.unwrap();
        let status: String = sqlx::query_scalar(
            "SELECT status FROM outbound_log WHERE tenant_id = ? AND message_id = ?",
        )
        .bind(tx.tenant())
        .bind(message_id)
        .fetch_one(tx.conn())
        .await
        .unwrap();
        tx.commit().await.unwrap();
        status
    }

    #[tokio::test]
    async fn test_suppress_is_idempotent_and_normalized() {
        let (manager, _, ctx) = setup().await;

        assert!(
            manager
                .suppress(&ctx, " User@Example.COM ", "manual", SuppressionSource::Manual)
                .await
                .unwrap()
        );
        assert!(
            !manager
                .suppress(&ctx, "user@example.com", "again", SuppressionSource::Manual)
                .await
                .unwrap()
        );
        assert!(manager.is_suppressed(&ctx, "USER@example.com").await.unwrap());
        assert_eq!(manager.list(&ctx).await.unwrap().len(), 1);

        manager.unsuppress(&ctx, "user@example.com").await.unwrap();
        assert!(!manager.is_suppressed(&ctx, "user@example.com").await.unwrap());
        assert!(matches!(
            manager.unsuppress(&ctx, "user@example.com").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_suppression_is_per_tenant() {
        let (manager, _, ctx) = setup().await;
        let other = TenantContext::new(TenantId::new());

        manager
            .suppress(&ctx, "user@example.com", "manual", SuppressionSource::Manual)
            .await
            .unwrap();
        assert!(!manager.is_suppressed(&other, "user@example.com").await.unwrap());
        assert!(manager.list(&other).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hard_bounce_suppresses_and_links() {
        let (manager, store, ctx) = setup().await;
        let ticket = TicketId::new();
        insert_outbound(&store, &ctx, "<m1@acme.com>", ticket).await;

        let event = BounceEvent {
            message_id: Some("m1@ACME.com".into()),
            status: Some("5.1.1".into()),
            diagnostic: Some("user unknown".into()),
            ..BounceEvent::new("Gone@Example.com")
        };
        let bounce = manager.ingest(&ctx, &event).await.unwrap();

        assert_eq!(bounce.kind, BounceKind::Hard);
        assert!(bounce.suppressed);
        assert_eq!(bounce.ticket_id, Some(ticket));
        assert_eq!(bounce.recipient, "gone@example.com");
        assert!(manager.is_suppressed(&ctx, "gone@example.com").await.unwrap());
        assert_eq!(outbound_status(&store, &ctx, "<m1@acme.com>").await, "bounced");

        let stored = manager.bounces_for(&ctx, "gone@example.com").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].ticket_id, Some(ticket));
    }

    #[tokio::test]
    async fn test_soft_bounce_is_recorded_only() {
        let (manager, store, ctx) = setup().await;
        insert_outbound(&store, &ctx, "<m2@acme.com>", TicketId::new()).await;

        let event = BounceEvent {
            message_id: Some("<m2@acme.com>".into()),
            status: Some("4.2.2".into()),
            ..BounceEvent::new("full@example.com")
        };
        let bounce = manager.ingest(&ctx, &event).await.unwrap();

        assert_eq!(bounce.kind, BounceKind::Soft);
        assert!(!bounce.suppressed);
        assert!(!manager.is_suppressed(&ctx, "full@example.com").await.unwrap());
        assert_eq!(outbound_status(&store, &ctx, "<m2@acme.com>").await, "sent");
    }

    #[tokio::test]
    async fn test_complaint_suppresses() {
        let (manager, _, ctx) = setup().await;
        let event = BounceEvent {
            kind: Some(BounceKind::Complaint),
            ..BounceEvent::new("angry@example.com")
        };
        manager.ingest(&ctx, &event).await.unwrap();
        manager.ingest(&ctx, &event).await.unwrap();

        let list = manager.list(&ctx).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].source, SuppressionSource::Complaint);
        assert_eq!(manager.bounces_for(&ctx, "angry@example.com").await.unwrap().len(), 2);
    }
}
