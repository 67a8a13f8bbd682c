//! Inbound message storage repository.

use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::info;

use super::model::{InboundLogEntry, InboundStatus, InboxMessage, StoredAttachment};
use super::parse::ParsedEmail;
use crate::store::{PROJECT_SCOPE, Store, TenantTx, get_id, get_json, get_opt_id};
use crate::tenant::TenantContext;
use crate::{ConnectorId, Error, InboxMessageId, ProjectId, Result, TicketId};

const SELECT_MESSAGE: &str = r"
    SELECT id, tenant_id, connector_id, project_id, mailbox_address, uid, message_id,
           in_reply_to, refs, thread_ref, from_address, from_name, to_addresses,
           cc_addresses, subject, body_text, body_html, snippet, is_reply, is_auto_reply,
           attachment_count, size_bytes, sent_at, received_at, ticket_id
    FROM inbox_messages
";

/// Everything needed to store one fetched message.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NewInboxMessage<'a> {
    pub connector_id: ConnectorId,
    pub project_id: Option<ProjectId>,
    pub mailbox_address: &'a str,
    pub uid: u32,
    pub email: &'a ParsedEmail,
    pub ticket_id: Option<TicketId>,
    pub is_reply: bool,
    pub attachments: &'a [StoredAttachment],
}

/// Read access to stored inbound mail, plus manual review.
#[derive(Debug, Clone)]
pub struct InboxRepository {
    store: Store,
}

impl InboxRepository {
    /// Create a repository over the given store.
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self { store }
    }

    /// Get a message by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, ctx: &TenantContext, id: InboxMessageId) -> Result<Option<InboxMessage>> {
        let mut tx = self.store.begin(ctx).await?;
        let row = sqlx::query(&format!("{SELECT_MESSAGE} WHERE id = ? AND tenant_id = ?"))
            .bind(id.to_string())
            .bind(tx.tenant())
            .fetch_optional(tx.conn())
            .await?;
        tx.commit().await?;
        row.as_ref().map(row_to_message).transpose()
    }

    /// Messages of a ticket in arrival order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list_for_ticket(
        &self,
        ctx: &TenantContext,
        ticket_id: TicketId,
    ) -> Result<Vec<InboxMessage>> {
        let mut tx = self.store.begin(ctx).await?;
        let rows = sqlx::query(&format!(
            "{SELECT_MESSAGE} WHERE tenant_id = ? AND ticket_id = ? AND {PROJECT_SCOPE} \
             ORDER BY received_at, uid"
        ))
        .bind(tx.tenant())
        .bind(ticket_id.to_string())
        .fetch_all(tx.conn())
        .await?;
        tx.commit().await?;
        rows.iter().map(row_to_message).collect()
    }

    /// Stored messages without a ticket (rejected, auto-replies, ambiguous).
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list_unassigned(
        &self,
        ctx: &TenantContext,
        mailbox_address: &str,
    ) -> Result<Vec<InboxMessage>> {
        let mut tx = self.store.begin(ctx).await?;
        let rows = sqlx::query(&format!(
            "{SELECT_MESSAGE} WHERE tenant_id = ? AND mailbox_address = ? AND ticket_id IS NULL \
             AND {PROJECT_SCOPE} ORDER BY received_at, uid"
        ))
        .bind(tx.tenant())
        .bind(crate::address::normalize(mailbox_address))
        .fetch_all(tx.conn())
        .await?;
        tx.commit().await?;
        rows.iter().map(row_to_message).collect()
    }

    /// Manual review: link an unassigned message to a ticket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the message does not exist or is
    /// already linked.
    pub async fn assign(
        &self,
        ctx: &TenantContext,
        id: InboxMessageId,
        ticket_id: TicketId,
    ) -> Result<()> {
        let mut tx = self.store.begin(ctx).await?;
        let result = sqlx::query(
            r"
            UPDATE inbox_messages SET ticket_id = ?
            WHERE id = ? AND tenant_id = ? AND ticket_id IS NULL
            ",
        )
        .bind(ticket_id.to_string())
        .bind(id.to_string())
        .bind(tx.tenant())
        .execute(tx.conn())
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("unassigned inbox message {id}")));
        }
        tx.commit().await?;
        info!(tenant_id = %ctx.tenant_id(), inbox_message_id = %id, ticket_id = %ticket_id, "Assigned message");
        Ok(())
    }

    /// Attachment metadata of a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn attachments(
        &self,
        ctx: &TenantContext,
        id: InboxMessageId,
    ) -> Result<Vec<StoredAttachment>> {
        let mut tx = self.store.begin(ctx).await?;
        let rows = sqlx::query(
            r"
            SELECT filename, content_type, size_bytes, checksum, content_id, is_inline, storage_path
            FROM email_attachments WHERE tenant_id = ? AND inbox_message_id = ?
            ORDER BY rowid
            ",
        )
        .bind(tx.tenant())
        .bind(id.to_string())
        .fetch_all(tx.conn())
        .await?;
        tx.commit().await?;
        rows.iter().map(row_to_attachment).collect()
    }

    /// Most recent inbound log entries of a mailbox, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn inbound_log(
        &self,
        ctx: &TenantContext,
        mailbox_address: &str,
        limit: u32,
    ) -> Result<Vec<InboundLogEntry>> {
        let mut tx = self.store.begin(ctx).await?;
        let rows = sqlx::query(
            r"
            SELECT connector_id, mailbox_address, uid, message_id, status, reason, ticket_id,
                   created_at
            FROM inbound_log WHERE tenant_id = ? AND mailbox_address = ?
            ORDER BY id DESC LIMIT ?
            ",
        )
        .bind(tx.tenant())
        .bind(crate::address::normalize(mailbox_address))
        .bind(i64::from(limit))
        .fetch_all(tx.conn())
        .await?;
        tx.commit().await?;
        rows.iter().map(row_to_log_entry).collect()
    }

    /// Number of stored messages in a mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn count(&self, ctx: &TenantContext, mailbox_address: &str) -> Result<u64> {
        let mut tx = self.store.begin(ctx).await?;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM inbox_messages WHERE tenant_id = ? AND mailbox_address = ?",
        )
        .bind(tx.tenant())
        .bind(crate::address::normalize(mailbox_address))
        .fetch_one(tx.conn())
        .await?;
        tx.commit().await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

/// Whether this mailbox already stored the Message-ID.
pub(crate) async fn exists_in(tx: &mut TenantTx, message_id: &str, mailbox_address: &str) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar(
        r"
        SELECT 1 FROM inbox_messages
        WHERE tenant_id = ? AND message_id = ? AND mailbox_address = ?
        ",
    )
    .bind(tx.tenant())
    .bind(message_id)
    .bind(mailbox_address)
    .fetch_optional(tx.conn())
    .await?;
    Ok(found.is_some())
}

/// Store a message and its attachment metadata.
pub(crate) async fn insert_in(tx: &mut TenantTx, new: &NewInboxMessage<'_>) -> Result<InboxMessageId> {
    let id = InboxMessageId::new();
    let email = new.email;
    sqlx::query(
        r"
        INSERT INTO inbox_messages (
            id, tenant_id, connector_id, project_id, mailbox_address, uid, message_id,
            in_reply_to, refs, thread_ref, from_address, from_name, to_addresses,
            cc_addresses, subject, body_text, body_html, snippet, is_reply, is_auto_reply,
            attachment_count, size_bytes, sent_at, received_at, ticket_id
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(id.to_string())
    .bind(tx.tenant())
    .bind(new.connector_id.to_string())
    .bind(new.project_id.map(|p| p.to_string()))
    .bind(new.mailbox_address)
    .bind(i64::from(new.uid))
    .bind(&email.message_id)
    .bind(&email.in_reply_to)
    .bind(serde_json::to_string(&email.references)?)
    .bind(email.thread_ref())
    .bind(&email.from_address)
    .bind(&email.from_name)
    .bind(serde_json::to_string(&email.to)?)
    .bind(serde_json::to_string(&email.cc)?)
    .bind(&email.subject)
    .bind(&email.text)
    .bind(&email.html)
    .bind(&email.snippet)
    .bind(new.is_reply)
    .bind(email.auto_reply)
    .bind(i64::try_from(new.attachments.len()).unwrap_or(i64::MAX))
    .bind(i64::try_from(email.size_bytes).unwrap_or(i64::MAX))
    .bind(email.sent_at)
    .bind(Utc::now())
    .bind(new.ticket_id.map(|t| t.to_string()))
    .execute(tx.conn())
    .await?;

    for attachment in new.attachments {
        sqlx::query(
            r"
            INSERT INTO email_attachments (
                id, tenant_id, inbox_message_id, filename, content_type, size_bytes,
                checksum, content_id, is_inline, storage_path
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(tx.tenant())
        .bind(id.to_string())
        .bind(&attachment.filename)
        .bind(&attachment.content_type)
        .bind(i64::try_from(attachment.size_bytes).unwrap_or(i64::MAX))
        .bind(&attachment.checksum)
        .bind(&attachment.content_id)
        .bind(attachment.inline)
        .bind(&attachment.storage_path)
        .execute(tx.conn())
        .await?;
    }

    Ok(id)
}

/// Append to the inbound log.
pub(crate) async fn log_in(tx: &mut TenantTx, entry: &InboundLogEntry) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO inbound_log (
            tenant_id, connector_id, mailbox_address, uid, message_id, status, reason,
            ticket_id, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(tx.tenant())
    .bind(entry.connector_id.to_string())
    .bind(&entry.mailbox_address)
    .bind(entry.uid.map(i64::from))
    .bind(&entry.message_id)
    .bind(entry.status.as_str())
    .bind(&entry.reason)
    .bind(entry.ticket_id.map(|t| t.to_string()))
    .bind(entry.created_at)
    .execute(tx.conn())
    .await?;
    Ok(())
}

fn row_to_message(row: &SqliteRow) -> Result<InboxMessage> {
    let uid: Option<i64> = row.try_get("uid")?;
    let attachment_count: i64 = row.try_get("attachment_count")?;
    let size_bytes: i64 = row.try_get("size_bytes")?;
    Ok(InboxMessage {
        id: get_id(row, "id")?,
        tenant_id: get_id(row, "tenant_id")?,
        connector_id: get_id(row, "connector_id")?,
        project_id: get_opt_id(row, "project_id")?,
        mailbox_address: row.try_get("mailbox_address")?,
        uid: uid.and_then(|u| u32::try_from(u).ok()),
        message_id: row.try_get("message_id")?,
        in_reply_to: row.try_get("in_reply_to")?,
        references: get_json(row, "refs")?,
        thread_ref: row.try_get("thread_ref")?,
        from_address: row.try_get("from_address")?,
        from_name: row.try_get("from_name")?,
        to: get_json(row, "to_addresses")?,
        cc: get_json(row, "cc_addresses")?,
        subject: row.try_get("subject")?,
        body_text: row.try_get("body_text")?,
        body_html: row.try_get("body_html")?,
        snippet: row.try_get("snippet")?,
        is_reply: row.try_get("is_reply")?,
        is_auto_reply: row.try_get("is_auto_reply")?,
        attachment_count: u32::try_from(attachment_count).unwrap_or(0),
        size_bytes: u64::try_from(size_bytes).unwrap_or(0),
        sent_at: row.try_get("sent_at")?,
        received_at: row.try_get("received_at")?,
        ticket_id: get_opt_id(row, "ticket_id")?,
    })
}

fn row_to_attachment(row: &SqliteRow) -> Result<StoredAttachment> {
    let size_bytes: i64 = row.try_get("size_bytes")?;
    Ok(StoredAttachment {
        filename: row.try_get("filename")?,
        content_type: row.try_get("content_type")?,
        size_bytes: u64::try_from(size_bytes).unwrap_or(0),
        checksum: row.try_get("checksum")?,
        content_id: row.try_get("content_id")?,
        inline: row.try_get("is_inline")?,
        storage_path: row.try_get("storage_path")?,
    })
}

fn row_to_log_entry(row: &SqliteRow) -> Result<InboundLogEntry> {
    let uid: Option<i64> = row.try_get("uid")?;
    Ok(InboundLogEntry {
        connector_id: get_id(row, "connector_id")?,
        mailbox_address: row.try_get("mailbox_address")?,
        uid: uid.and_then(|u| u32::try_from(u).ok()),
        message_id: row.try_get("message_id")?,
        status: InboundStatus::parse(row.try_get("status")?),
        reason: row.try_get("reason")?,
        ticket_id: get_opt_id(row, "ticket_id")?,
        created_at: row.try_get("created_at")?,
    })
}
