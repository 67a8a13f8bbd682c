//! Mailbox storage repository.

use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::info;

use super::model::{Mailbox, NewMailbox, RoutingRule, SyncTarget};
use crate::connector::{ConnectorKind, is_valid_email};
use crate::store::{PROJECT_SCOPE, Store, TenantTx, get_id, get_json};
use crate::tenant::TenantContext;
use crate::{Error, MailboxId, Result, address};

const SELECT_MAILBOX: &str = r"
    SELECT id, tenant_id, connector_id, project_id, address, folder,
           routing_rules, allow_new_ticket, is_active, created_at
    FROM mailboxes
";

/// Repository for inbound mailbox configuration.
#[derive(Debug, Clone)]
pub struct MailboxRepository {
    store: Store,
}

impl MailboxRepository {
    /// Create a repository over the given store.
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self { store }
    }

    /// Create a mailbox bound to an inbound connector of the same tenant.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a malformed address,
    /// [`Error::Ineligible`] if the connector is not inbound, or a unique
    /// violation if the (project, address) pair already exists.
    pub async fn create(&self, ctx: &TenantContext, new: NewMailbox) -> Result<Mailbox> {
        let address = address::normalize(&new.address);
        if !is_valid_email(&address) {
            return Err(Error::Config(format!("invalid mailbox address {address:?}")));
        }

        let mut tx = self.store.begin(ctx).await?;
        let connector = crate::connector::fetch_connector(&mut tx, new.connector_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("connector {}", new.connector_id)))?;
        let ConnectorKind::InboundImap(settings) = &connector.kind else {
            return Err(Error::Ineligible(format!(
                "connector {} is {}, mailboxes need inbound_imap",
                connector.id,
                connector.kind.as_str()
            )));
        };

        let id = MailboxId::new();
        let folder = new.folder.unwrap_or_else(|| settings.folder.clone());
        sqlx::query(
            r"
            INSERT INTO mailboxes (
                id, tenant_id, connector_id, project_id, address, folder,
                routing_rules, allow_new_ticket, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(id.to_string())
        .bind(tx.tenant())
        .bind(new.connector_id.to_string())
        .bind(new.project_id.to_string())
        .bind(&address)
        .bind(&folder)
        .bind(serde_json::to_string(&new.routing_rules)?)
        .bind(new.allow_new_ticket)
        .bind(Utc::now())
        .execute(tx.conn())
        .await?;

        let mailbox = fetch(&mut tx, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("mailbox {id}")))?;
        tx.commit().await?;

        info!(
            tenant_id = %ctx.tenant_id(),
            mailbox = %address,
            "Created mailbox"
        );
        Ok(mailbox)
    }

    /// Get mailbox by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, ctx: &TenantContext, id: MailboxId) -> Result<Option<Mailbox>> {
        let mut tx = self.store.begin(ctx).await?;
        let mailbox = fetch(&mut tx, id).await?;
        tx.commit().await?;
        Ok(mailbox)
    }

    /// All mailboxes visible to the context's project scope.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list(&self, ctx: &TenantContext) -> Result<Vec<Mailbox>> {
        let mut tx = self.store.begin(ctx).await?;
        let rows = sqlx::query(&format!(
            "{SELECT_MAILBOX} WHERE tenant_id = ? AND {PROJECT_SCOPE} ORDER BY address ASC"
        ))
        .bind(tx.tenant())
        .fetch_all(tx.conn())
        .await?;
        tx.commit().await?;
        rows.iter().map(row_to_mailbox).collect()
    }

    /// Replace routing rules and the new-ticket policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the mailbox is not in this tenant.
    pub async fn update_policy(
        &self,
        ctx: &TenantContext,
        id: MailboxId,
        routing_rules: &[RoutingRule],
        allow_new_ticket: bool,
    ) -> Result<()> {
        let mut tx = self.store.begin(ctx).await?;
        let result = sqlx::query(
            r"
            UPDATE mailboxes SET routing_rules = ?, allow_new_ticket = ?
            WHERE id = ? AND tenant_id = ?
            ",
        )
        .bind(serde_json::to_string(routing_rules)?)
        .bind(allow_new_ticket)
        .bind(id.to_string())
        .bind(tx.tenant())
        .execute(tx.conn())
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("mailbox {id}")));
        }
        tx.commit().await
    }

    /// Enable or disable polling of a mailbox.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the mailbox is not in this tenant.
    pub async fn set_active(&self, ctx: &TenantContext, id: MailboxId, active: bool) -> Result<()> {
        let mut tx = self.store.begin(ctx).await?;
        let result =
            sqlx::query("UPDATE mailboxes SET is_active = ? WHERE id = ? AND tenant_id = ?")
                .bind(active)
                .bind(id.to_string())
                .bind(tx.tenant())
                .execute(tx.conn())
                .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("mailbox {id}")));
        }
        tx.commit().await
    }

    /// Delete a mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete(&self, ctx: &TenantContext, id: MailboxId) -> Result<()> {
        let mut tx = self.store.begin(ctx).await?;
        sqlx::query("DELETE FROM mailboxes WHERE id = ? AND tenant_id = ?")
            .bind(id.to_string())
            .bind(tx.tenant())
            .execute(tx.conn())
            .await?;
        tx.commit().await
    }

    /// Every active mailbox whose connector is active and validated, across
    /// all tenants.
    ///
    /// This is the scheduler's discovery read and the only query that is not
    /// tenant scoped; it returns identifiers only, and all further work on a
    /// target runs inside that target's tenant context.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn sync_targets(&self) -> Result<Vec<SyncTarget>> {
        let rows = sqlx::query(
            r"
            SELECT m.tenant_id, m.id
            FROM mailboxes m
            JOIN connectors c ON c.id = m.connector_id AND c.tenant_id = m.tenant_id
            WHERE m.is_active = 1
              AND c.is_active = 1
              AND c.validation_status = 'validated'
              AND c.kind = 'inbound_imap'
            ORDER BY m.tenant_id, m.address
            ",
        )
        .fetch_all(self.store.pool())
        .await?;

        rows.iter()
            .map(|row| {
                Ok(SyncTarget {
                    tenant_id: get_id(row, "tenant_id")?,
                    mailbox_id: get_id(row, "id")?,
                })
            })
            .collect()
    }
}

/// Load one mailbox inside an open transaction.
pub(crate) async fn fetch(tx: &mut TenantTx, id: MailboxId) -> Result<Option<Mailbox>> {
    let row = sqlx::query(&format!("{SELECT_MAILBOX} WHERE id = ? AND tenant_id = ?"))
        .bind(id.to_string())
        .bind(tx.tenant())
        .fetch_optional(tx.conn())
        .await?;
    row.as_ref().map(row_to_mailbox).transpose()
}

/// Find the active mailbox with this address, any project.
pub(crate) async fn fetch_by_address(tx: &mut TenantTx, address: &str) -> Result<Option<Mailbox>> {
    let row = sqlx::query(&format!(
        "{SELECT_MAILBOX} WHERE tenant_id = ? AND address = ? AND is_active = 1 \
         ORDER BY created_at ASC LIMIT 1"
    ))
    .bind(tx.tenant())
    .bind(address::normalize(address))
    .fetch_optional(tx.conn())
    .await?;
    row.as_ref().map(row_to_mailbox).transpose()
}

/// Convert a database row to a Mailbox.
fn row_to_mailbox(row: &SqliteRow) -> Result<Mailbox> {
    Ok(Mailbox {
        id: get_id(row, "id")?,
        tenant_id: get_id(row, "tenant_id")?,
        connector_id: get_id(row, "connector_id")?,
        project_id: get_id(row, "project_id")?,
        address: row.try_get("address")?,
        folder: row.try_get("folder")?,
        routing_rules: get_json(row, "routing_rules")?,
        allow_new_ticket: row.try_get("allow_new_ticket")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::connector::{
        AuthMethod, ConnectorRepository, MemoryCredentialStore, NewConnector, OAuthProvider,
        ProviderSettings, Security, SeenStrategy, ServerEndpoint,
    };
    use crate::mailbox::RuleMatch;
    use crate::{ConnectorId, ProjectId, TenantId};

    struct Fixture {
        store: Store,
        connectors: ConnectorRepository,
        mailboxes: MailboxRepository,
    }

    async fn fixture() -> Fixture {
        let store = Store::in_memory().await.unwrap();
        Fixture {
            connectors: ConnectorRepository::new(
                store.clone(),
                Arc::new(MemoryCredentialStore::new()),
            ),
            mailboxes: MailboxRepository::new(store.clone()),
            store,
        }
    }

    async fn imap_connector(fx: &Fixture, ctx: &TenantContext) -> ConnectorId {
        fx.connectors
            .create(
                ctx,
                NewConnector {
                    project_id: None,
                    name: "Support".into(),
                    kind: ConnectorKind::InboundImap(crate::connector::ImapSettings {
                        server: ServerEndpoint::new("imap.acme.com", 993, Security::Tls),
                        auth: AuthMethod::Password {
                            username: "support".into(),
                        },
                        folder: "Support".into(),
                        seen_strategy: SeenStrategy::Never,
                    }),
                },
                &[],
            )
            .await
            .unwrap()
            .id
    }

    fn new_mailbox(connector_id: ConnectorId, project_id: ProjectId) -> NewMailbox {
        NewMailbox {
            connector_id,
            project_id,
            address: " Support@Acme.com ".into(),
            folder: None,
            routing_rules: vec![],
            allow_new_ticket: true,
        }
    }

    #[tokio::test]
    async fn test_create_normalizes_and_inherits_folder() {
        let fx = fixture().await;
        let ctx = TenantContext::new(TenantId::new());
        let connector = imap_connector(&fx, &ctx).await;

        let mailbox = fx
            .mailboxes
            .create(&ctx, new_mailbox(connector, ProjectId::new()))
            .await
            .unwrap();
        assert_eq!(mailbox.address, "support@acme.com");
        assert_eq!(mailbox.folder, "Support");
    }

    #[tokio::test]
    async fn test_unique_per_project_and_address() {
        let fx = fixture().await;
        let ctx = TenantContext::new(TenantId::new());
        let connector = imap_connector(&fx, &ctx).await;
        let project = ProjectId::new();

        fx.mailboxes
            .create(&ctx, new_mailbox(connector, project))
            .await
            .unwrap();
        let err = fx
            .mailboxes
            .create(&ctx, new_mailbox(connector, project))
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());

        fx.mailboxes
            .create(&ctx, new_mailbox(connector, ProjectId::new()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_outbound_connector_is_rejected() {
        let fx = fixture().await;
        let ctx = TenantContext::new(TenantId::new());
        let outbound = fx
            .connectors
            .create(
                &ctx,
                NewConnector {
                    project_id: None,
                    name: "Gmail".into(),
                    kind: ConnectorKind::OutboundProvider(ProviderSettings {
                        provider: OAuthProvider::Google,
                        account_email: "support@acme.com".into(),
                        dkim: None,
                    }),
                },
                &[],
            )
            .await
            .unwrap();

        let err = fx
            .mailboxes
            .create(&ctx, new_mailbox(outbound.id, ProjectId::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Ineligible(_)));
    }

    #[tokio::test]
    async fn test_connector_of_other_tenant_is_not_found() {
        let fx = fixture().await;
        let owner = TenantContext::new(TenantId::new());
        let connector = imap_connector(&fx, &owner).await;

        let other = TenantContext::new(TenantId::new());
        let err = fx
            .mailboxes
            .create(&other, new_mailbox(connector, ProjectId::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_sync_targets_require_validated_connector() {
        let fx = fixture().await;
        let ctx = TenantContext::new(TenantId::new());
        let connector = imap_connector(&fx, &ctx).await;
        let mailbox = fx
            .mailboxes
            .create(&ctx, new_mailbox(connector, ProjectId::new()))
            .await
            .unwrap();

        assert!(fx.mailboxes.sync_targets().await.unwrap().is_empty());

        fx.connectors.begin_validation(&ctx, connector).await.unwrap();
        fx.connectors
            .finish_validation(&ctx, connector, Ok(()))
            .await
            .unwrap();
        assert_eq!(
            fx.mailboxes.sync_targets().await.unwrap(),
            vec![SyncTarget {
                tenant_id: ctx.tenant_id(),
                mailbox_id: mailbox.id,
            }]
        );

        fx.mailboxes.set_active(&ctx, mailbox.id, false).await.unwrap();
        assert!(fx.mailboxes.sync_targets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_policy_and_lookup_by_address() {
        let fx = fixture().await;
        let ctx = TenantContext::new(TenantId::new());
        let connector = imap_connector(&fx, &ctx).await;
        let mailbox = fx
            .mailboxes
            .create(&ctx, new_mailbox(connector, ProjectId::new()))
            .await
            .unwrap();

        let rules = vec![RoutingRule {
            matcher: RuleMatch::SubjectContains("refund".into()),
            project_id: None,
        }];
        fx.mailboxes
            .update_policy(&ctx, mailbox.id, &rules, false)
            .await
            .unwrap();

        let mut tx = fx.store.begin(&ctx).await.unwrap();
        let found = fetch_by_address(&mut tx, "SUPPORT@acme.com")
            .await
            .unwrap()
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(found.routing_rules, rules);
        assert!(!found.allow_new_ticket);
    }

    #[tokio::test]
    async fn test_delete_connector_cascades() {
        let fx = fixture().await;
        let ctx = TenantContext::new(TenantId::new());
        let connector = imap_connector(&fx, &ctx).await;
        let mailbox = fx
            .mailboxes
            .create(&ctx, new_mailbox(connector, ProjectId::new()))
            .await
            .unwrap();

        fx.connectors.delete(&ctx, connector).await.unwrap();
        assert!(fx.mailboxes.get(&ctx, mailbox.id).await.unwrap().is_none());
    }
}
