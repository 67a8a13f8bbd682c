//! Connector storage repository.

use std::sync::Arc;

use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::{debug, info, warn};

use super::credentials::{CredentialKind, CredentialStore};
use super::model::{
    Connector, ConnectorHealth, ConnectorKind, NewConnector, ValidationStatus,
};
use crate::store::{PROJECT_SCOPE, Store, TenantTx, get_id, get_json, get_opt_id};
use crate::tenant::TenantContext;
use crate::transport::{DkimKey, ImapTarget, SmtpTarget};
use crate::{ConnectorId, Error, Result, TenantId};

const SELECT_CONNECTOR: &str = r"
    SELECT id, tenant_id, project_id, name, settings, is_active,
           validation_status, validation_error, last_validation_at,
           last_health, consecutive_failures, created_at, updated_at
    FROM connectors
";

/// What [`ConnectorRepository::record_health`] did to the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthChange {
    /// Health recorded, eligibility unchanged.
    Recorded,
    /// Too many consecutive failures; the connector was reset to `pending`.
    RevalidationRequired,
}

/// Repository for connector configuration, status and secrets.
#[derive(Clone)]
pub struct ConnectorRepository {
    store: Store,
    credentials: Arc<dyn CredentialStore>,
}

impl ConnectorRepository {
    /// Create a repository over the given store and secret backend.
    #[must_use]
    pub fn new(store: Store, credentials: Arc<dyn CredentialStore>) -> Self {
        Self { store, credentials }
    }

    /// Secret backend.
    #[must_use]
    pub fn credentials(&self) -> &dyn CredentialStore {
        self.credentials.as_ref()
    }

    /// Create a connector in `pending` state and store its secrets.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert or the credential store fails.
    pub async fn create(
        &self,
        ctx: &TenantContext,
        new: NewConnector,
        secrets: &[(CredentialKind, &str)],
    ) -> Result<Connector> {
        let id = ConnectorId::new();
        let now = Utc::now();
        let mut tx = self.store.begin(ctx).await?;
        sqlx::query(
            r"
            INSERT INTO connectors (
                id, tenant_id, project_id, name, kind, settings,
                validation_status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?)
            ",
        )
        .bind(id.to_string())
        .bind(tx.tenant())
        .bind(new.project_id.map(|p| p.to_string()))
        .bind(&new.name)
        .bind(new.kind.as_str())
        .bind(serde_json::to_string(&new.kind)?)
        .bind(now)
        .bind(now)
        .execute(tx.conn())
        .await?;

        for (kind, secret) in secrets {
            self.credentials
                .store(ctx.tenant_id(), id, *kind, secret)?;
        }

        let connector = fetch(&mut tx, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("connector {id}")))?;
        tx.commit().await?;

        info!(
            tenant_id = %ctx.tenant_id(),
            connector_id = %id,
            kind = new.kind.as_str(),
            "Created connector"
        );
        Ok(connector)
    }

    /// Replace a connector's configuration; resets it to `pending`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the connector is not in this tenant.
    pub async fn update(
        &self,
        ctx: &TenantContext,
        id: ConnectorId,
        name: &str,
        kind: &ConnectorKind,
    ) -> Result<()> {
        let mut tx = self.store.begin(ctx).await?;
        let result = sqlx::query(
            r"
            UPDATE connectors SET
                name = ?, kind = ?, settings = ?,
                validation_status = 'pending', validation_error = NULL,
                consecutive_failures = 0, updated_at = ?
            WHERE id = ? AND tenant_id = ?
            ",
        )
        .bind(name)
        .bind(kind.as_str())
        .bind(serde_json::to_string(kind)?)
        .bind(Utc::now())
        .bind(id.to_string())
        .bind(tx.tenant())
        .execute(tx.conn())
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("connector {id}")));
        }
        tx.commit().await?;
        debug!(connector_id = %id, "Connector updated, validation reset to pending");
        Ok(())
    }

    /// Store or rotate one secret; resets the connector to `pending`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connector is unknown or the store fails.
    pub async fn set_secret(
        &self,
        ctx: &TenantContext,
        id: ConnectorId,
        kind: CredentialKind,
        secret: &str,
    ) -> Result<()> {
        let mut tx = self.store.begin(ctx).await?;
        if fetch(&mut tx, id).await?.is_none() {
            return Err(Error::NotFound(format!("connector {id}")));
        }
        self.credentials.store(ctx.tenant_id(), id, kind, secret)?;
        set_status(&mut tx, id, ValidationStatus::Pending, None).await?;
        tx.commit().await
    }

    /// Enable or disable a connector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the connector is not in this tenant.
    pub async fn set_active(&self, ctx: &TenantContext, id: ConnectorId, active: bool) -> Result<()> {
        let mut tx = self.store.begin(ctx).await?;
        let result = sqlx::query(
            "UPDATE connectors SET is_active = ?, updated_at = ? WHERE id = ? AND tenant_id = ?",
        )
        .bind(active)
        .bind(Utc::now())
        .bind(id.to_string())
        .bind(tx.tenant())
        .execute(tx.conn())
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("connector {id}")));
        }
        tx.commit().await
    }

    /// Get connector by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, ctx: &TenantContext, id: ConnectorId) -> Result<Option<Connector>> {
        let mut tx = self.store.begin(ctx).await?;
        let connector = fetch(&mut tx, id).await?;
        tx.commit().await?;
        Ok(connector)
    }

    /// All connectors visible to the context's project scope.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list(&self, ctx: &TenantContext) -> Result<Vec<Connector>> {
        let mut tx = self.store.begin(ctx).await?;
        let rows = sqlx::query(&format!(
            "{SELECT_CONNECTOR} WHERE tenant_id = ? AND {PROJECT_SCOPE} ORDER BY created_at ASC"
        ))
        .bind(tx.tenant())
        .fetch_all(tx.conn())
        .await?;
        tx.commit().await?;
        rows.iter().map(row_to_connector).collect()
    }

    /// Connectors waiting for validation.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list_pending(&self, ctx: &TenantContext) -> Result<Vec<Connector>> {
        Ok(self
            .list(ctx)
            .await?
            .into_iter()
            .filter(|c| c.validation_status == ValidationStatus::Pending)
            .collect())
    }

    /// Tenants that have at least one active connector in `pending`.
    ///
    /// Like the mailbox discovery read this is not tenant scoped; it returns
    /// identifiers only and validation runs inside each tenant's context.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn pending_tenants(&self) -> Result<Vec<TenantId>> {
        let rows = sqlx::query(
            r"
            SELECT DISTINCT tenant_id FROM connectors
            WHERE validation_status = 'pending' AND is_active = 1
            ORDER BY tenant_id
            ",
        )
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(|row| get_id(row, "tenant_id")).collect()
    }

    /// Delete a connector. Mailboxes, sync status and stored messages
    /// cascade; secrets are removed from the credential store.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete(&self, ctx: &TenantContext, id: ConnectorId) -> Result<()> {
        let mut tx = self.store.begin(ctx).await?;
        sqlx::query("DELETE FROM connectors WHERE id = ? AND tenant_id = ?")
            .bind(id.to_string())
            .bind(tx.tenant())
            .execute(tx.conn())
            .await?;
        tx.commit().await?;

        if let Err(e) = self.credentials.delete_all(ctx.tenant_id(), id) {
            warn!("Failed to delete credentials for connector {id}: {e}");
        }
        Ok(())
    }

    /// Move a connector to `validating` unless another validator holds it.
    ///
    /// Returns `false` when the connector is already `validating`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn begin_validation(&self, ctx: &TenantContext, id: ConnectorId) -> Result<bool> {
        let mut tx = self.store.begin(ctx).await?;
        let result = sqlx::query(
            r"
            UPDATE connectors SET validation_status = 'validating', updated_at = ?
            WHERE id = ? AND tenant_id = ? AND validation_status != 'validating'
            ",
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .bind(tx.tenant())
        .execute(tx.conn())
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    /// Record the outcome of a validation attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn finish_validation(
        &self,
        ctx: &TenantContext,
        id: ConnectorId,
        outcome: std::result::Result<(), String>,
    ) -> Result<ValidationStatus> {
        let now = Utc::now();
        let (status, error) = match outcome {
            Ok(()) => (ValidationStatus::Validated, None),
            Err(message) => (ValidationStatus::Failed, Some(message)),
        };
        let health = ConnectorHealth {
            ok: error.is_none(),
            checked_at: now,
            message: error.clone(),
        };

        let mut tx = self.store.begin(ctx).await?;
        sqlx::query(
            r"
            UPDATE connectors SET
                validation_status = ?, validation_error = ?, last_validation_at = ?,
                last_health = ?, consecutive_failures = 0, updated_at = ?
            WHERE id = ? AND tenant_id = ?
            ",
        )
        .bind(status.as_str())
        .bind(&error)
        .bind(now)
        .bind(serde_json::to_string(&health)?)
        .bind(now)
        .bind(id.to_string())
        .bind(tx.tenant())
        .execute(tx.conn())
        .await?;
        tx.commit().await?;

        match &error {
            None => info!(connector_id = %id, "Connector validated"),
            Some(e) => warn!(connector_id = %id, error = %e, "Connector validation failed"),
        }
        Ok(status)
    }

    /// Record a sync or send outcome.
    ///
    /// After `revalidate_after` consecutive failures a validated connector
    /// is reset to `pending`, which makes it ineligible until it passes
    /// validation again.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn record_health(
        &self,
        ctx: &TenantContext,
        id: ConnectorId,
        failure: Option<&str>,
        revalidate_after: u32,
    ) -> Result<HealthChange> {
        let now = Utc::now();
        let health = ConnectorHealth {
            ok: failure.is_none(),
            checked_at: now,
            message: failure.map(ToString::to_string),
        };

        let mut tx = self.store.begin(ctx).await?;
        let Some(failure) = failure else {
            sqlx::query(
                r"
                UPDATE connectors SET last_health = ?, consecutive_failures = 0
                WHERE id = ? AND tenant_id = ?
                ",
            )
            .bind(serde_json::to_string(&health)?)
            .bind(id.to_string())
            .bind(tx.tenant())
            .execute(tx.conn())
            .await?;
            tx.commit().await?;
            return Ok(HealthChange::Recorded);
        };

        let failures: Option<i64> = sqlx::query_scalar(
            r"
            UPDATE connectors SET last_health = ?, consecutive_failures = consecutive_failures + 1
            WHERE id = ? AND tenant_id = ?
            RETURNING consecutive_failures
            ",
        )
        .bind(serde_json::to_string(&health)?)
        .bind(id.to_string())
        .bind(tx.tenant())
        .fetch_optional(tx.conn())
        .await?;

        let demote = failures.is_some_and(|n| n >= i64::from(revalidate_after.max(1)));
        let change = if demote {
            let demoted = sqlx::query(
                r"
                UPDATE connectors SET
                    validation_status = 'pending', validation_error = ?, updated_at = ?
                WHERE id = ? AND tenant_id = ? AND validation_status = 'validated'
                ",
            )
            .bind(format!(
                "re-validation required after repeated failures; last error: {failure}"
            ))
            .bind(now)
            .bind(id.to_string())
            .bind(tx.tenant())
            .execute(tx.conn())
            .await?;
            if demoted.rows_affected() == 1 {
                warn!(connector_id = %id, "Connector reset to pending after repeated failures");
                HealthChange::RevalidationRequired
            } else {
                HealthChange::Recorded
            }
        } else {
            HealthChange::Recorded
        };
        tx.commit().await?;
        Ok(change)
    }

    /// Login parameters for an inbound connector.
    ///
    /// # Errors
    ///
    /// Returns an error if the connector is not IMAP or its secret is missing.
    pub fn imap_target(&self, connector: &Connector, folder: &str) -> Result<ImapTarget> {
        let ConnectorKind::InboundImap(settings) = &connector.kind else {
            return Err(Error::Ineligible(format!(
                "connector {} is {}, not inbound_imap",
                connector.id,
                connector.kind.as_str()
            )));
        };
        let secret = self.credentials.require(
            connector.tenant_id,
            connector.id,
            settings.auth.credential_kind(),
        )?;
        Ok(ImapTarget {
            settings: settings.clone(),
            folder: folder.to_string(),
            secret,
        })
    }

    /// Submission parameters for an outbound connector.
    ///
    /// # Errors
    ///
    /// Returns an error if the connector is inbound or a secret is missing.
    pub fn smtp_target(&self, connector: &Connector) -> Result<SmtpTarget> {
        let server = match &connector.kind {
            ConnectorKind::OutboundSmtp(settings) => settings.server.clone(),
            ConnectorKind::OutboundProvider(settings) => settings.provider.smtp_endpoint(),
            ConnectorKind::InboundImap(_) => {
                return Err(Error::Ineligible(format!(
                    "connector {} is inbound_imap and cannot send",
                    connector.id
                )));
            }
        };
        let auth = connector.kind.auth();
        let secret =
            self.credentials
                .require(connector.tenant_id, connector.id, auth.credential_kind())?;
        let dkim = match connector.kind.dkim() {
            Some(settings) => Some(DkimKey {
                settings: settings.clone(),
                private_key: self.credentials.require(
                    connector.tenant_id,
                    connector.id,
                    CredentialKind::DkimKey,
                )?,
            }),
            None => None,
        };
        Ok(SmtpTarget {
            server,
            auth,
            secret,
            dkim,
        })
    }
}

/// Load one connector inside an open transaction.
pub(crate) async fn fetch(tx: &mut TenantTx, id: ConnectorId) -> Result<Option<Connector>> {
    let row = sqlx::query(&format!("{SELECT_CONNECTOR} WHERE id = ? AND tenant_id = ?"))
        .bind(id.to_string())
        .bind(tx.tenant())
        .fetch_optional(tx.conn())
        .await?;
    row.as_ref().map(row_to_connector).transpose()
}

async fn set_status(
    tx: &mut TenantTx,
    id: ConnectorId,
    status: ValidationStatus,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r"
        UPDATE connectors SET validation_status = ?, validation_error = ?, updated_at = ?
        WHERE id = ? AND tenant_id = ?
        ",
    )
    .bind(status.as_str())
    .bind(error)
    .bind(Utc::now())
    .bind(id.to_string())
    .bind(tx.tenant())
    .execute(tx.conn())
    .await?;
    Ok(())
}

/// Convert a database row to a Connector.
fn row_to_connector(row: &SqliteRow) -> Result<Connector> {
    let last_health: Option<String> = row.try_get("last_health")?;
    let failures: i64 = row.try_get("consecutive_failures")?;
    Ok(Connector {
        id: get_id(row, "id")?,
        tenant_id: get_id(row, "tenant_id")?,
        project_id: get_opt_id(row, "project_id")?,
        name: row.try_get("name")?,
        kind: get_json(row, "settings")?,
        is_active: row.try_get("is_active")?,
        validation_status: ValidationStatus::parse(row.try_get("validation_status")?),
        validation_error: row.try_get("validation_error")?,
        last_validation_at: row.try_get("last_validation_at")?,
        last_health: last_health
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        consecutive_failures: u32::try_from(failures).unwrap_or(u32::MAX),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use crate::connector::credentials::MemoryCredentialStore;
    use crate::connector::model::{
        AuthMethod, Direction, ImapSettings, Security, SeenStrategy, ServerEndpoint,
    };
    use crate::{ProjectId, TenantId};

    pub(crate) fn imap_kind() -> ConnectorKind {
        ConnectorKind::InboundImap(ImapSettings {
            server: ServerEndpoint::new("imap.acme.com", 993, Security::Tls),
            auth: AuthMethod::Password {
                username: "support@acme.com".into(),
            },
            folder: "INBOX".into(),
            seen_strategy: SeenStrategy::Never,
        })
    }

    async fn repo() -> ConnectorRepository {
        let store = Store::in_memory().await.unwrap();
        ConnectorRepository::new(store, Arc::new(MemoryCredentialStore::new()))
    }

    fn new_imap(project: Option<ProjectId>) -> NewConnector {
        NewConnector {
            project_id: project,
            name: "Support inbox".into(),
            kind: imap_kind(),
        }
    }

    #[tokio::test]
    async fn test_create_starts_pending() {
        let repo = repo().await;
        let ctx = TenantContext::new(TenantId::new());
        let connector = repo
            .create(&ctx, new_imap(None), &[(CredentialKind::Password, "pw")])
            .await
            .unwrap();

        assert_eq!(connector.validation_status, ValidationStatus::Pending);
        assert!(!connector.is_eligible());
        assert_eq!(connector.kind, imap_kind());
        assert!(repo.imap_target(&connector, "INBOX").is_ok());
    }

    #[tokio::test]
    async fn test_other_tenant_cannot_read() {
        let repo = repo().await;
        let owner = TenantContext::new(TenantId::new());
        let connector = repo.create(&owner, new_imap(None), &[]).await.unwrap();

        let other = TenantContext::new(TenantId::new());
        assert!(repo.get(&other, connector.id).await.unwrap().is_none());
        assert!(repo.list(&other).await.unwrap().is_empty());
        assert!(matches!(
            repo.set_active(&other, connector.id, false).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_project_scope_filters_list() {
        let repo = repo().await;
        let tenant = TenantId::new();
        let (a, b) = (ProjectId::new(), ProjectId::new());
        let ctx = TenantContext::new(tenant);
        repo.create(&ctx, new_imap(Some(a)), &[]).await.unwrap();
        repo.create(&ctx, new_imap(Some(b)), &[]).await.unwrap();
        repo.create(&ctx, new_imap(None), &[]).await.unwrap();

        assert_eq!(repo.list(&ctx).await.unwrap().len(), 3);
        let narrowed = TenantContext::new(tenant).with_projects([a]);
        let visible = repo.list(&narrowed).await.unwrap();
        assert_eq!(visible.len(), 2);
        assert!(visible.iter().all(|c| c.project_id != Some(b)));
    }

    #[tokio::test]
    async fn test_validation_transitions() {
        let repo = repo().await;
        let ctx = TenantContext::new(TenantId::new());
        let connector = repo.create(&ctx, new_imap(None), &[]).await.unwrap();

        assert!(repo.begin_validation(&ctx, connector.id).await.unwrap());
        assert!(!repo.begin_validation(&ctx, connector.id).await.unwrap());

        let status = repo
            .finish_validation(&ctx, connector.id, Ok(()))
            .await
            .unwrap();
        assert_eq!(status, ValidationStatus::Validated);
        let stored = repo.get(&ctx, connector.id).await.unwrap().unwrap();
        assert!(stored.is_eligible_for(Direction::Inbound));
        assert!(!stored.is_eligible_for(Direction::Outbound));
        assert!(stored.last_validation_at.is_some());
        assert!(stored.validation_error.is_none());

        repo.update(&ctx, connector.id, "Renamed", &imap_kind())
            .await
            .unwrap();
        let stored = repo.get(&ctx, connector.id).await.unwrap().unwrap();
        assert_eq!(stored.validation_status, ValidationStatus::Pending);
        assert_eq!(stored.name, "Renamed");
    }

    #[tokio::test]
    async fn test_failed_validation_keeps_message() {
        let repo = repo().await;
        let ctx = TenantContext::new(TenantId::new());
        let connector = repo.create(&ctx, new_imap(None), &[]).await.unwrap();

        repo.begin_validation(&ctx, connector.id).await.unwrap();
        repo.finish_validation(&ctx, connector.id, Err("bad password".into()))
            .await
            .unwrap();
        let stored = repo.get(&ctx, connector.id).await.unwrap().unwrap();
        assert_eq!(stored.validation_status, ValidationStatus::Failed);
        assert_eq!(stored.validation_error.as_deref(), Some("bad password"));
        assert!(
            stored
                .ineligibility(Direction::Inbound)
                .unwrap()
                .contains("bad password")
        );
        assert!(!stored.last_health.unwrap().ok);
    }

    #[tokio::test]
    async fn test_repeated_failures_require_revalidation() {
        let repo = repo().await;
        let ctx = TenantContext::new(TenantId::new());
        let connector = repo.create(&ctx, new_imap(None), &[]).await.unwrap();
        repo.begin_validation(&ctx, connector.id).await.unwrap();
        repo.finish_validation(&ctx, connector.id, Ok(())).await.unwrap();

        for _ in 0..2 {
            let change = repo
                .record_health(&ctx, connector.id, Some("timeout"), 3)
                .await
                .unwrap();
            assert_eq!(change, HealthChange::Recorded);
        }
        let change = repo
            .record_health(&ctx, connector.id, Some("timeout"), 3)
            .await
            .unwrap();
        assert_eq!(change, HealthChange::RevalidationRequired);

        let stored = repo.get(&ctx, connector.id).await.unwrap().unwrap();
        assert_eq!(stored.validation_status, ValidationStatus::Pending);
        assert_eq!(stored.consecutive_failures, 3);
        assert!(!stored.is_eligible());
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let repo = repo().await;
        let ctx = TenantContext::new(TenantId::new());
        let connector = repo.create(&ctx, new_imap(None), &[]).await.unwrap();

        repo.record_health(&ctx, connector.id, Some("x"), 5).await.unwrap();
        repo.record_health(&ctx, connector.id, None, 5).await.unwrap();
        let stored = repo.get(&ctx, connector.id).await.unwrap().unwrap();
        assert_eq!(stored.consecutive_failures, 0);
        assert!(stored.last_health.unwrap().ok);
    }

    #[tokio::test]
    async fn test_delete_removes_secrets() {
        let repo = repo().await;
        let ctx = TenantContext::new(TenantId::new());
        let connector = repo
            .create(&ctx, new_imap(None), &[(CredentialKind::Password, "pw")])
            .await
            .unwrap();

        repo.delete(&ctx, connector.id).await.unwrap();
        assert!(repo.get(&ctx, connector.id).await.unwrap().is_none());
        assert!(
            repo.credentials()
                .get(ctx.tenant_id(), connector.id, CredentialKind::Password)
                .unwrap()
                .is_none()
        );
    }
}
