//! Ticket routing storage and reply resolution.

use std::collections::BTreeSet;

use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{
    MatchSource, Resolution, ThreadSignals, TicketRouting, mint_token, reply_address, token_of,
};
use crate::address;
use crate::store::{Store, TenantTx, get_id};
use crate::tenant::TenantContext;
use crate::{Error, Result, TicketId};

const SELECT_ROUTING: &str = r"
    SELECT id, tenant_id, ticket_id, public_token, reply_address, message_id_root,
           created_at, revoked_at
    FROM ticket_mail_routing
";

/// Mints, resolves and revokes reply routing.
#[derive(Debug, Clone)]
pub struct ThreadRouter {
    store: Store,
}

impl ThreadRouter {
    /// Create a router over the given store.
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self { store }
    }

    /// Decide which ticket, if any, an inbound message continues.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn resolve(&self, ctx: &TenantContext, signals: &ThreadSignals) -> Result<Resolution> {
        let mut tx = self.store.begin(ctx).await?;
        let resolution = resolve_in(&mut tx, signals).await?;
        tx.commit().await?;
        Ok(resolution)
    }

    /// Active routing of a ticket, minting one if there is none.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the mailbox address is malformed.
    pub async fn ensure_active(
        &self,
        ctx: &TenantContext,
        ticket_id: TicketId,
        mailbox_address: &str,
        message_id_root: &str,
    ) -> Result<TicketRouting> {
        let mut tx = self.store.begin(ctx).await?;
        let routing = ensure_active_in(&mut tx, ticket_id, mailbox_address, message_id_root).await?;
        tx.commit().await?;
        Ok(routing)
    }

    /// Active routing of a ticket.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn find_active(
        &self,
        ctx: &TenantContext,
        ticket_id: TicketId,
    ) -> Result<Option<TicketRouting>> {
        let mut tx = self.store.begin(ctx).await?;
        let routing = find_active_in(&mut tx, ticket_id).await?;
        tx.commit().await?;
        Ok(routing)
    }

    /// Stop a routing row from resolving. The row is kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no active row with that id exists.
    pub async fn revoke(&self, ctx: &TenantContext, routing_id: Uuid) -> Result<()> {
        let mut tx = self.store.begin(ctx).await?;
        let result = sqlx::query(
            r"
            UPDATE ticket_mail_routing SET revoked_at = ?
            WHERE id = ? AND tenant_id = ? AND revoked_at IS NULL
            ",
        )
        .bind(Utc::now())
        .bind(routing_id.to_string())
        .bind(tx.tenant())
        .execute(tx.conn())
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("active routing {routing_id}")));
        }
        tx.commit().await?;
        info!(tenant_id = %ctx.tenant_id(), routing_id = %routing_id, "Revoked routing");
        Ok(())
    }

    /// Revoke the active routing of a ticket. Returns how many rows changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn revoke_for_ticket(&self, ctx: &TenantContext, ticket_id: TicketId) -> Result<u64> {
        let mut tx = self.store.begin(ctx).await?;
        let result = sqlx::query(
            r"
            UPDATE ticket_mail_routing SET revoked_at = ?
            WHERE ticket_id = ? AND tenant_id = ? AND revoked_at IS NULL
            ",
        )
        .bind(Utc::now())
        .bind(ticket_id.to_string())
        .bind(tx.tenant())
        .execute(tx.conn())
        .await?;
        tx.commit().await?;
        if result.rows_affected() > 0 {
            info!(tenant_id = %ctx.tenant_id(), ticket_id = %ticket_id, "Revoked ticket routing");
        }
        Ok(result.rows_affected())
    }

    /// Every routing row of a ticket, active or not, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn history(&self, ctx: &TenantContext, ticket_id: TicketId) -> Result<Vec<TicketRouting>> {
        let mut tx = self.store.begin(ctx).await?;
        let rows = sqlx::query(&format!(
            "{SELECT_ROUTING} WHERE tenant_id = ? AND ticket_id = ? ORDER BY created_at"
        ))
        .bind(tx.tenant())
        .bind(ticket_id.to_string())
        .fetch_all(tx.conn())
        .await?;
        tx.commit().await?;
        rows.iter().map(row_to_routing).collect()
    }
}

/// Resolve inside the caller's transaction.
///
/// Header evidence is the message's own id, `In-Reply-To`, then
/// `References` newest first. A root shared by several active tickets,
/// conflicting header matches, or a header match that disagrees with a
/// token match are ambiguous.
pub(crate) async fn resolve_in(tx: &mut TenantTx, signals: &ThreadSignals) -> Result<Resolution> {
    let header_ids: Vec<String> = signals
        .message_id
        .iter()
        .chain(signals.in_reply_to.iter())
        .chain(signals.references.iter().rev())
        .filter_map(|id| address::normalize_message_id(id))
        .collect();

    let mut header_tickets = BTreeSet::new();
    let mut first_header = None;
    for id in &header_ids {
        let tickets = tickets_for_root(tx, id).await?;
        if let Some(&ticket) = tickets.first() {
            first_header.get_or_insert(ticket);
        }
        header_tickets.extend(tickets);
    }

    let mut token_tickets = BTreeSet::new();
    for token in signals.recipients.iter().filter_map(|r| token_of(r)) {
        if let Some(ticket) = ticket_for_token(tx, &token).await? {
            token_tickets.insert(ticket);
        }
    }

    let candidates: BTreeSet<TicketId> = header_tickets.union(&token_tickets).copied().collect();
    let resolution = match (first_header, token_tickets.iter().next()) {
        _ if candidates.len() > 1 => {
            warn!(
                tenant_id = %tx.tenant_id(),
                candidates = ?candidates,
                "Thread evidence points at several tickets"
            );
            Resolution::Ambiguous {
                candidates: candidates.into_iter().collect(),
            }
        }
        (Some(ticket_id), _) => Resolution::Continuation {
            ticket_id,
            via: MatchSource::Header,
        },
        (None, Some(&ticket_id)) => Resolution::Continuation {
            ticket_id,
            via: MatchSource::Token,
        },
        (None, None) => Resolution::NoMatch,
    };
    debug!(tenant_id = %tx.tenant_id(), ?resolution, "Resolved thread");
    Ok(resolution)
}

/// Active routing of a ticket or a newly minted one.
pub(crate) async fn ensure_active_in(
    tx: &mut TenantTx,
    ticket_id: TicketId,
    mailbox_address: &str,
    message_id_root: &str,
) -> Result<TicketRouting> {
    if let Some(routing) = find_active_in(tx, ticket_id).await? {
        return Ok(routing);
    }
    mint_in(tx, ticket_id, mailbox_address, message_id_root).await
}

/// Mint a routing row for a ticket with no active routing.
pub(crate) async fn mint_in(
    tx: &mut TenantTx,
    ticket_id: TicketId,
    mailbox_address: &str,
    message_id_root: &str,
) -> Result<TicketRouting> {
    let token = mint_token();
    let reply = reply_address(mailbox_address, &token)
        .ok_or_else(|| Error::Config(format!("invalid mailbox address {mailbox_address:?}")))?;
    let root = address::normalize_message_id(message_id_root)
        .ok_or_else(|| Error::Config("empty conversation root".into()))?;
    insert_routing(tx, ticket_id, &token, &reply, &root).await
}

async fn insert_routing(
    tx: &mut TenantTx,
    ticket_id: TicketId,
    token: &str,
    reply: &str,
    root: &str,
) -> Result<TicketRouting> {
    let id = Uuid::new_v4();
    sqlx::query(
        r"
        INSERT INTO ticket_mail_routing (
            id, tenant_id, ticket_id, public_token, reply_address, message_id_root, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(id.to_string())
    .bind(tx.tenant())
    .bind(ticket_id.to_string())
    .bind(token)
    .bind(reply)
    .bind(root)
    .bind(Utc::now())
    .execute(tx.conn())
    .await?;

    debug!(tenant_id = %tx.tenant_id(), ticket_id = %ticket_id, reply_address = %reply, "Minted routing");
    let row = sqlx::query(&format!("{SELECT_ROUTING} WHERE id = ?"))
        .bind(id.to_string())
        .fetch_one(tx.conn())
        .await?;
    row_to_routing(&row)
}

pub(crate) async fn find_active_in(
    tx: &mut TenantTx,
    ticket_id: TicketId,
) -> Result<Option<TicketRouting>> {
    let row = sqlx::query(&format!(
        "{SELECT_ROUTING} WHERE tenant_id = ? AND ticket_id = ? AND revoked_at IS NULL"
    ))
    .bind(tx.tenant())
    .bind(ticket_id.to_string())
    .fetch_optional(tx.conn())
    .await?;
    row.as_ref().map(row_to_routing).transpose()
}

async fn tickets_for_root(tx: &mut TenantTx, root: &str) -> Result<Vec<TicketId>> {
    let raw: Vec<String> = sqlx::query_scalar(
        r"
        SELECT ticket_id FROM ticket_mail_routing
        WHERE tenant_id = ? AND message_id_root = ? AND revoked_at IS NULL
        ORDER BY created_at, ticket_id
        ",
    )
    .bind(tx.tenant())
    .bind(root)
    .fetch_all(tx.conn())
    .await?;
    raw.into_iter()
        .filter_map(|raw| parse_ticket(Some(raw)).transpose())
        .collect()
}

async fn ticket_for_token(tx: &mut TenantTx, token: &str) -> Result<Option<TicketId>> {
    let raw: Option<String> = sqlx::query_scalar(
        r"
        SELECT ticket_id FROM ticket_mail_routing
        WHERE tenant_id = ? AND public_token = ? AND revoked_at IS NULL
        ",
    )
    .bind(tx.tenant())
    .bind(token)
    .fetch_optional(tx.conn())
    .await?;
    parse_ticket(raw)
}

fn parse_ticket(raw: Option<String>) -> Result<Option<TicketId>> {
    raw.map(|raw| {
        raw.parse()
            .map_err(|_| Error::Corrupt(format!("ticket_id: invalid identifier {raw:?}")))
    })
    .transpose()
}

fn row_to_routing(row: &SqliteRow) -> Result<TicketRouting> {
    Ok(TicketRouting {
        id: get_id(row, "id")?,
        tenant_id: get_id(row, "tenant_id")?,
        ticket_id: get_id(row, "ticket_id")?,
        public_token: row.try_get("public_token")?,
        reply_address: row.try_get("reply_address")?,
        message_id_root: row.try_get("message_id_root")?,
        created_at: row.try_get("created_at")?,
        revoked_at: row.try_get("revoked_at")?,
    })
}
