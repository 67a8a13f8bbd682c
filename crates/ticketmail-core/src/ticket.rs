//! Ticket service seam.
//!
//! The engine never owns ticket workflow. It creates tickets and appends
//! conversation messages through [`TicketService`], inside the same
//! transaction as the inbox row and routing row so the three commit
//! together. [`LocalTicketService`] is the embedded `SQLite` implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::debug;

use crate::store::{PROJECT_SCOPE, Store, TenantTx, get_id, get_opt_id};
use crate::tenant::TenantContext;
use crate::{Error, InboxMessageId, ProjectId, Result, TicketId};

/// Ticket to open for a first inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTicket {
    /// Project the ticket is filed under.
    pub project_id: ProjectId,
    /// Subject without reply prefixes.
    pub subject: String,
    /// Customer address.
    pub requester: String,
}

/// Which way a conversation message travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Customer to support.
    Inbound,
    /// Support to customer.
    Outbound,
}

impl MessageDirection {
    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    /// Parse from database string representation.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        if s == "outbound" {
            Self::Outbound
        } else {
            Self::Inbound
        }
    }
}

/// Conversation entry to append to a ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketMessageInput {
    /// Stored inbound message this entry came from.
    pub inbox_message_id: Option<InboxMessageId>,
    /// Direction.
    pub direction: MessageDirection,
    /// Author address.
    pub author: String,
    /// Body text.
    pub body: String,
}

/// Ticket creation and conversation append, run in the caller's transaction.
#[async_trait]
pub trait TicketService: Send + Sync {
    /// Open a ticket.
    async fn create_ticket(&self, tx: &mut TenantTx, ticket: NewTicket) -> Result<TicketId>;

    /// Append a conversation message.
    async fn append_message(
        &self,
        tx: &mut TenantTx,
        ticket_id: TicketId,
        message: TicketMessageInput,
    ) -> Result<()>;

    /// Project of a ticket visible in the transaction's scope.
    async fn project_of(&self, tx: &mut TenantTx, ticket_id: TicketId) -> Result<Option<ProjectId>>;
}

/// A ticket as stored by [`LocalTicketService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    /// Ticket id.
    pub id: TicketId,
    /// Project.
    pub project_id: ProjectId,
    /// Subject.
    pub subject: String,
    /// Customer address.
    pub requester: String,
    /// Workflow status.
    pub status: String,
    /// Created.
    pub created_at: DateTime<Utc>,
    /// Last message.
    pub updated_at: DateTime<Utc>,
}

/// A conversation message as stored by [`LocalTicketService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketMessage {
    /// Source inbox message.
    pub inbox_message_id: Option<InboxMessageId>,
    /// Direction.
    pub direction: MessageDirection,
    /// Author.
    pub author: String,
    /// Body.
    pub body: String,
    /// Created.
    pub created_at: DateTime<Utc>,
}

/// Tickets in the engine's own database.
#[derive(Debug, Clone)]
pub struct LocalTicketService {
    store: Store,
}

impl LocalTicketService {
    /// Create a service over the given store.
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self { store }
    }

    /// Get a ticket.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, ctx: &TenantContext, id: TicketId) -> Result<Option<Ticket>> {
        let mut tx = self.store.begin(ctx).await?;
        let row = sqlx::query(&format!(
            r"
            SELECT id, project_id, subject, requester, status, created_at, updated_at
            FROM tickets WHERE id = ? AND tenant_id = ? AND {PROJECT_SCOPE}
            "
        ))
        .bind(id.to_string())
        .bind(tx.tenant())
        .fetch_optional(tx.conn())
        .await?;
        tx.commit().await?;
        row.as_ref().map(row_to_ticket).transpose()
    }

    /// Tickets of the tenant, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list(&self, ctx: &TenantContext) -> Result<Vec<Ticket>> {
        let mut tx = self.store.begin(ctx).await?;
        let rows = sqlx::query(&format!(
            r"
            SELECT id, project_id, subject, requester, status, created_at, updated_at
            FROM tickets WHERE tenant_id = ? AND {PROJECT_SCOPE}
            ORDER BY created_at, rowid
            "
        ))
        .bind(tx.tenant())
        .fetch_all(tx.conn())
        .await?;
        tx.commit().await?;
        rows.iter().map(row_to_ticket).collect()
    }

    /// Conversation of a ticket, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn messages(&self, ctx: &TenantContext, id: TicketId) -> Result<Vec<TicketMessage>> {
        let mut tx = self.store.begin(ctx).await?;
        let rows = sqlx::query(
            r"
            SELECT inbox_message_id, direction, author, body, created_at
            FROM ticket_messages WHERE tenant_id = ? AND ticket_id = ?
            ORDER BY created_at, rowid
            ",
        )
        .bind(tx.tenant())
        .bind(id.to_string())
        .fetch_all(tx.conn())
        .await?;
        tx.commit().await?;
        rows.iter().map(row_to_message).collect()
    }
}

#[async_trait]
impl TicketService for LocalTicketService {
    async fn create_ticket(&self, tx: &mut TenantTx, ticket: NewTicket) -> Result<TicketId> {
        if !tx.context().allows_project(Some(ticket.project_id)) {
            return Err(Error::NotFound(format!("project {}", ticket.project_id)));
        }
        let id = TicketId::new();
        let now = Utc::now();
        sqlx::query(
            r"
            INSERT INTO tickets (id, tenant_id, project_id, subject, requester, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(id.to_string())
        .bind(tx.tenant())
        .bind(ticket.project_id.to_string())
        .bind(&ticket.subject)
        .bind(&ticket.requester)
        .bind(now)
        .bind(now)
        .execute(tx.conn())
        .await?;
        debug!(tenant_id = %tx.tenant_id(), ticket_id = %id, "Created ticket");
        Ok(id)
    }

    async fn append_message(
        &self,
        tx: &mut TenantTx,
        ticket_id: TicketId,
        message: TicketMessageInput,
    ) -> Result<()> {
        let now = Utc::now();
        let touched = sqlx::query("UPDATE tickets SET updated_at = ? WHERE id = ? AND tenant_id = ?")
            .bind(now)
            .bind(ticket_id.to_string())
            .bind(tx.tenant())
            .execute(tx.conn())
            .await?;
        if touched.rows_affected() == 0 {
            return Err(Error::NotFound(format!("ticket {ticket_id}")));
        }

        sqlx::query(
            r"
            INSERT INTO ticket_messages (
                id, tenant_id, ticket_id, inbox_message_id, direction, author, body, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(tx.tenant())
        .bind(ticket_id.to_string())
        .bind(message.inbox_message_id.map(|m| m.to_string()))
        .bind(message.direction.as_str())
        .bind(&message.author)
        .bind(&message.body)
        .bind(now)
        .execute(tx.conn())
        .await?;
        Ok(())
    }

    async fn project_of(&self, tx: &mut TenantTx, ticket_id: TicketId) -> Result<Option<ProjectId>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT project_id FROM tickets WHERE id = ? AND tenant_id = ?")
                .bind(ticket_id.to_string())
                .bind(tx.tenant())
                .fetch_optional(tx.conn())
                .await?;
        raw.map(|raw| {
            raw.parse()
                .map_err(|_| Error::Corrupt(format!("project_id: invalid identifier {raw:?}")))
        })
        .transpose()
    }
}

fn row_to_ticket(row: &SqliteRow) -> Result<Ticket> {
    Ok(Ticket {
        id: get_id(row, "id")?,
        project_id: get_id(row, "project_id")?,
        subject: row.try_get("subject")?,
        requester: row.try_get("requester")?,
        status: row.try_get("status")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_message(row: &SqliteRow) -> Result<TicketMessage> {
    Ok(TicketMessage {
        inbox_message_id: get_opt_id(row, "inbox_message_id")?,
        direction: MessageDirection::parse(row.try_get("direction")?),
        author: row.try_get("author")?,
        body: row.try_get("body")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::TenantId;

    fn inbound(body: &str) -> TicketMessageInput {
        TicketMessageInput {
            inbox_message_id: None,
            direction: MessageDirection::Inbound,
            author: "jane@customer.com".into(),
            body: body.into(),
        }
    }

    #[tokio::test]
    async fn test_create_and_append_in_one_transaction() {
        let store = Store::in_memory().await.unwrap();
        let service = LocalTicketService::new(store.clone());
        let ctx = TenantContext::new(TenantId::new());
        let project = ProjectId::new();

        let mut tx = store.begin(&ctx).await.unwrap();
        let id = service
            .create_ticket(
                &mut tx,
                NewTicket {
                    project_id: project,
                    subject: "Broken".into(),
                    requester: "jane@customer.com".into(),
                },
            )
            .await
            .unwrap();
        service.append_message(&mut tx, id, inbound("first")).await.unwrap();
        assert_eq!(service.project_of(&mut tx, id).await.unwrap(), Some(project));
        tx.commit().await.unwrap();

        let ticket = service.get(&ctx, id).await.unwrap().unwrap();
        assert_eq!(ticket.status, "open");
        assert_eq!(service.messages(&ctx, id).await.unwrap().len(), 1);
        assert_eq!(service.list(&ctx).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rolled_back_ticket_disappears() {
        let store = Store::in_memory().await.unwrap();
        let service = LocalTicketService::new(store.clone());
        let ctx = TenantContext::new(TenantId::new());

        let mut tx = store.begin(&ctx).await.unwrap();
        let id = service
            .create_ticket(
                &mut tx,
                NewTicket {
                    project_id: ProjectId::new(),
                    subject: "Gone".into(),
                    requester: "a@b.com".into(),
                },
            )
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert!(service.get(&ctx, id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_to_foreign_ticket_fails() {
        let store = Store::in_memory().await.unwrap();
        let service = LocalTicketService::new(store.clone());
        let owner = TenantContext::new(TenantId::new());

        let mut tx = store.begin(&owner).await.unwrap();
        let id = service
            .create_ticket(
                &mut tx,
                NewTicket {
                    project_id: ProjectId::new(),
                    subject: "Mine".into(),
                    requester: "a@b.com".into(),
                },
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let intruder = TenantContext::new(TenantId::new());
        let mut tx = store.begin(&intruder).await.unwrap();
        assert!(matches!(
            service.append_message(&mut tx, id, inbound("hi")).await,
            Err(Error::NotFound(_))
        ));
    }
}
