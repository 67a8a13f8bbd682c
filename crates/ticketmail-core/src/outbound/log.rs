//! Outbound audit log, keyed by (tenant, Message-ID).

use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::model::{OutboundRecord, OutboundStatus};
use crate::store::{PROJECT_SCOPE, Store, TenantTx, get_id, get_json, get_opt_id};
use crate::tenant::TenantContext;
use crate::{ConnectorId, ProjectId, Result, TicketId};

const SELECT_RECORD: &str = r"
    SELECT message_id, connector_id, ticket_id, project_id, recipients, subject, status,
           reason, attempt_count, created_at, updated_at, sent_at
    FROM outbound_log
";

/// First row of an attempt.
pub(crate) struct NewOutboundRecord<'a> {
    pub message_id: &'a str,
    pub connector_id: ConnectorId,
    pub ticket_id: TicketId,
    pub project_id: Option<ProjectId>,
    pub recipients: &'a [String],
    pub subject: &'a str,
    pub status: OutboundStatus,
    pub reason: Option<&'a str>,
}

/// Read access to the outbound log.
#[derive(Debug, Clone)]
pub struct OutboundLog {
    store: Store,
}

impl OutboundLog {
    /// Create a log reader over the given store.
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self { store }
    }

    /// Record for one Message-ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, ctx: &TenantContext, message_id: &str) -> Result<Option<OutboundRecord>> {
        let mut tx = self.store.begin(ctx).await?;
        let row = sqlx::query(&format!(
            "{SELECT_RECORD} WHERE tenant_id = ? AND message_id = ? AND {PROJECT_SCOPE}"
        ))
        .bind(tx.tenant())
        .bind(message_id)
        .fetch_optional(tx.conn())
        .await?;
        tx.commit().await?;
        row.as_ref().map(row_to_record).transpose()
    }

    /// Every attempt for a ticket, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn for_ticket(
        &self,
        ctx: &TenantContext,
        ticket_id: TicketId,
    ) -> Result<Vec<OutboundRecord>> {
        let mut tx = self.store.begin(ctx).await?;
        let rows = sqlx::query(&format!(
            "{SELECT_RECORD} WHERE tenant_id = ? AND ticket_id = ? AND {PROJECT_SCOPE} \
             ORDER BY created_at, message_id"
        ))
        .bind(tx.tenant())
        .bind(ticket_id.to_string())
        .fetch_all(tx.conn())
        .await?;
        tx.commit().await?;
        rows.iter().map(row_to_record).collect()
    }
}

/// Current status of an attempt, if logged.
pub(crate) async fn status_in(tx: &mut TenantTx, message_id: &str) -> Result<Option<OutboundStatus>> {
    let status: Option<String> = sqlx::query_scalar(
        "SELECT status FROM outbound_log WHERE tenant_id = ? AND message_id = ?",
    )
    .bind(tx.tenant())
    .bind(message_id)
    .fetch_optional(tx.conn())
    .await?;
    Ok(status.as_deref().map(OutboundStatus::parse))
}

/// Insert the attempt, or restart a previous unsent attempt with the same id.
pub(crate) async fn open_in(tx: &mut TenantTx, record: &NewOutboundRecord<'_>) -> Result<()> {
    let now = Utc::now();
    sqlx::query(
        r"
        INSERT INTO outbound_log (
            tenant_id, message_id, connector_id, ticket_id, project_id, recipients,
            subject, status, reason, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (tenant_id, message_id) DO UPDATE SET
            connector_id = excluded.connector_id,
            recipients = excluded.recipients,
            status = excluded.status,
            reason = excluded.reason,
            updated_at = excluded.updated_at
        ",
    )
    .bind(tx.tenant())
    .bind(record.message_id)
    .bind(record.connector_id.to_string())
    .bind(record.ticket_id.to_string())
    .bind(record.project_id.map(|p| p.to_string()))
    .bind(serde_json::to_string(record.recipients)?)
    .bind(record.subject)
    .bind(record.status.as_str())
    .bind(record.reason)
    .bind(now)
    .bind(now)
    .execute(tx.conn())
    .await?;
    Ok(())
}

/// Move an attempt to a new status.
pub(crate) async fn transition_in(
    tx: &mut TenantTx,
    message_id: &str,
    status: OutboundStatus,
    reason: Option<&str>,
    attempts: u32,
) -> Result<()> {
    let now = Utc::now();
    let sent_at = (status == OutboundStatus::Sent).then_some(now);
    sqlx::query(
        r"
        UPDATE outbound_log SET
            status = ?, reason = ?, attempt_count = attempt_count + ?,
            sent_at = COALESCE(?, sent_at), updated_at = ?
        WHERE tenant_id = ? AND message_id = ?
        ",
    )
    .bind(status.as_str())
    .bind(reason)
    .bind(i64::from(attempts))
    .bind(sent_at)
    .bind(now)
    .bind(tx.tenant())
    .bind(message_id)
    .execute(tx.conn())
    .await?;
    Ok(())
}

fn row_to_record(row: &SqliteRow) -> Result<OutboundRecord> {
    let attempts: i64 = row.try_get("attempt_count")?;
    Ok(OutboundRecord {
        message_id: row.try_get("message_id")?,
        connector_id: get_id(row, "connector_id")?,
        ticket_id: get_opt_id(row, "ticket_id")?,
        project_id: get_opt_id(row, "project_id")?,
        recipients: get_json(row, "recipients")?,
        subject: row.try_get("subject")?,
        status: OutboundStatus::parse(row.try_get("status")?),
        reason: row.try_get("reason")?,
        attempt_count: u32::try_from(attempts).unwrap_or(u32::MAX),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        sent_at: row.try_get("sent_at")?,
    })
}
