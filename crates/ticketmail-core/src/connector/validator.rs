//! Connector validation job.
//!
//! Drives `pending → validating → validated | failed`: static checks first,
//! then an authenticated handshake through the protocol adapter, bounded by
//! the per-operation timeout.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::model::{ConnectorKind, ValidationStatus};
use super::repository::ConnectorRepository;
use super::validation::{describe, validate_config, validate_secrets};
use crate::tenant::TenantContext;
use crate::transport::{InboundProtocol, OutboundProtocol, with_timeout};
use crate::{ConnectorId, Error, Result};

/// Runs validation attempts against live servers.
#[derive(Clone)]
pub struct ConnectorValidator {
    connectors: ConnectorRepository,
    inbound: Arc<dyn InboundProtocol>,
    outbound: Arc<dyn OutboundProtocol>,
    timeout: Duration,
}

impl ConnectorValidator {
    /// Create a validator.
    #[must_use]
    pub fn new(
        connectors: ConnectorRepository,
        inbound: Arc<dyn InboundProtocol>,
        outbound: Arc<dyn OutboundProtocol>,
        timeout: Duration,
    ) -> Self {
        Self {
            connectors,
            inbound,
            outbound,
            timeout,
        }
    }

    /// Validate one connector and return its resulting status.
    ///
    /// If another validator already holds the connector, its current
    /// status (`validating`) is returned without running a handshake.
    ///
    /// # Errors
    ///
    /// Returns an error for storage failures; handshake failures are
    /// recorded on the connector instead.
    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id()))]
    pub async fn validate(&self, ctx: &TenantContext, id: ConnectorId) -> Result<ValidationStatus> {
        let connector = self
            .connectors
            .get(ctx, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("connector {id}")))?;

        if !self.connectors.begin_validation(ctx, id).await? {
            debug!("Connector {id} is already being validated");
            return Ok(ValidationStatus::Validating);
        }

        let static_check = validate_config(&connector.name, &connector.kind).and_then(|()| {
            validate_secrets(
                ctx.tenant_id(),
                id,
                &connector.kind,
                self.connectors.credentials(),
            )
        });
        if let Err(errors) = static_check {
            return self
                .connectors
                .finish_validation(ctx, id, Err(describe(&errors)))
                .await;
        }

        let outcome = self.handshake(&connector.kind, &connector).await;
        self.connectors.finish_validation(ctx, id, outcome).await
    }

    /// Validate every `pending` connector of the tenant.
    ///
    /// A connector whose attempt errors is marked `failed` with the error
    /// and the remaining connectors are still attempted.
    ///
    /// # Errors
    ///
    /// Returns an error if listing connectors fails.
    pub async fn validate_pending(
        &self,
        ctx: &TenantContext,
    ) -> Result<Vec<(ConnectorId, ValidationStatus)>> {
        let mut results = Vec::new();
        for connector in self.connectors.list_pending(ctx).await? {
            let status = match self.validate(ctx, connector.id).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(connector_id = %connector.id, error = %e, "Validation attempt failed");
                    self.connectors
                        .finish_validation(ctx, connector.id, Err(e.to_string()))
                        .await
                        .unwrap_or(ValidationStatus::Failed)
                }
            };
            results.push((connector.id, status));
        }
        Ok(results)
    }

    /// Validate the `pending` connectors of every tenant.
    ///
    /// Connectors demoted after repeated health failures come back through
    /// here; a tenant whose pass fails is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the tenant discovery query fails.
    pub async fn validate_all_pending(&self) -> Result<Vec<(ConnectorId, ValidationStatus)>> {
        let mut results = Vec::new();
        for tenant_id in self.connectors.pending_tenants().await? {
            let ctx = TenantContext::new(tenant_id);
            match self.validate_pending(&ctx).await {
                Ok(statuses) => results.extend(statuses),
                Err(e) => warn!(%tenant_id, error = %e, "Tenant validation pass failed"),
            }
        }
        if !results.is_empty() {
            info!(count = results.len(), "Validated pending connectors");
        }
        Ok(results)
    }

    async fn handshake(
        &self,
        kind: &ConnectorKind,
        connector: &super::Connector,
    ) -> std::result::Result<(), String> {
        match kind {
            ConnectorKind::InboundImap(settings) => {
                let target = self
                    .connectors
                    .imap_target(connector, &settings.folder)
                    .map_err(|e| e.to_string())?;
                with_timeout(self.timeout, self.inbound.probe(&target))
                    .await
                    .map_err(|e| e.to_string())
            }
            ConnectorKind::OutboundSmtp(_) | ConnectorKind::OutboundProvider(_) => {
                let target = self
                    .connectors
                    .smtp_target(connector)
                    .map_err(|e| e.to_string())?;
                with_timeout(self.timeout, self.outbound.probe(&target))
                    .await
                    .map_err(|e| e.to_string())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::result::Result;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::TransportError;
    use crate::connector::credentials::{CredentialKind, MemoryCredentialStore};
    use crate::connector::model::NewConnector;
    use crate::connector::repository::tests::imap_kind;
    use crate::store::Store;
    use crate::TenantId;
    use crate::transport::{ImapTarget, MailSource, OutgoingMail, SmtpTarget};

    struct Probe {
        result: Result<(), TransportError>,
        calls: AtomicU32,
        delay: Duration,
    }

    impl Probe {
        fn new(result: Result<(), TransportError>) -> Arc<Self> {
            Arc::new(Self {
                result,
                calls: AtomicU32::new(0),
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl InboundProtocol for Probe {
        async fn connect(&self, _: &ImapTarget) -> Result<Box<dyn MailSource>, TransportError> {
            Err(TransportError::Unsupported("probe only".into()))
        }

        async fn probe(&self, target: &ImapTarget) -> Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(target.secret.expose(), "pw");
            tokio::time::sleep(self.delay).await;
            self.result.clone()
        }
    }

    #[async_trait]
    impl OutboundProtocol for Probe {
        async fn send(&self, _: &SmtpTarget, _: &OutgoingMail) -> Result<(), TransportError> {
            unreachable!("validation never sends")
        }

        async fn probe(&self, _: &SmtpTarget) -> Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    async fn setup(probe: Arc<Probe>) -> (ConnectorValidator, ConnectorRepository) {
        setup_with_timeout(probe, Duration::from_secs(5)).await
    }

    async fn setup_with_timeout(
        probe: Arc<Probe>,
        timeout: Duration,
    ) -> (ConnectorValidator, ConnectorRepository) {
        let store = Store::in_memory().await.unwrap();
        let repo = ConnectorRepository::new(store, Arc::new(MemoryCredentialStore::new()));
        let validator = ConnectorValidator::new(repo.clone(), probe.clone(), probe, timeout);
        (validator, repo)
    }

    fn new_imap() -> NewConnector {
        NewConnector {
            project_id: None,
            name: "Support".into(),
            kind: imap_kind(),
        }
    }

    #[tokio::test]
    async fn successful_handshake_validates() {
        let probe = Probe::new(Ok(()));
        let (validator, repo) = setup(probe.clone()).await;
        let ctx = TenantContext::new(TenantId::new());
        let connector = repo
            .create(&ctx, new_imap(), &[(CredentialKind::Password, "pw")])
            .await
            .unwrap();

        let status = validator.validate(&ctx, connector.id).await.unwrap();
        assert_eq!(status, ValidationStatus::Validated);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_secret_fails_without_handshake() {
        let probe = Probe::new(Ok(()));
        let (validator, repo) = setup(probe.clone()).await;
        let ctx = TenantContext::new(TenantId::new());
        let connector = repo.create(&ctx, new_imap(), &[]).await.unwrap();

        let status = validator.validate(&ctx, connector.id).await.unwrap();
        assert_eq!(status, ValidationStatus::Failed);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
        let stored = repo.get(&ctx, connector.id).await.unwrap().unwrap();
        assert!(stored.validation_error.unwrap().contains("secret"));
    }

    #[tokio::test]
    async fn rejected_login_fails_with_message() {
        let probe = Probe::new(Err(TransportError::Auth("invalid credentials".into())));
        let (validator, repo) = setup(probe).await;
        let ctx = TenantContext::new(TenantId::new());
        let connector = repo
            .create(&ctx, new_imap(), &[(CredentialKind::Password, "pw")])
            .await
            .unwrap();

        assert_eq!(
            validator.validate(&ctx, connector.id).await.unwrap(),
            ValidationStatus::Failed
        );
        let stored = repo.get(&ctx, connector.id).await.unwrap().unwrap();
        assert!(stored.validation_error.unwrap().contains("invalid credentials"));
    }

    #[tokio::test]
    async fn slow_handshake_times_out() {
        let probe = Arc::new(Probe {
            result: Ok(()),
            calls: AtomicU32::new(0),
            delay: Duration::from_secs(30),
        });
        let (validator, repo) = setup_with_timeout(probe, Duration::from_millis(50)).await;
        let ctx = TenantContext::new(TenantId::new());
        let connector = repo
            .create(&ctx, new_imap(), &[(CredentialKind::Password, "pw")])
            .await
            .unwrap();

        assert_eq!(
            validator.validate(&ctx, connector.id).await.unwrap(),
            ValidationStatus::Failed
        );
        let stored = repo.get(&ctx, connector.id).await.unwrap().unwrap();
        assert!(stored.validation_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn validate_pending_covers_every_pending_connector() {
        let probe = Probe::new(Ok(()));
        let (validator, repo) = setup(probe).await;
        let ctx = TenantContext::new(TenantId::new());
        for _ in 0..3 {
            repo.create(&ctx, new_imap(), &[(CredentialKind::Password, "pw")])
                .await
                .unwrap();
        }

        let results = validator.validate_pending(&ctx).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|(_, s)| *s == ValidationStatus::Validated));
        assert!(repo.list_pending(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn validate_pending_keeps_going_after_an_error() {
        let store = Store::in_memory().await.unwrap();
        let repo = ConnectorRepository::new(store.clone(), Arc::new(MemoryCredentialStore::new()));
        let probe = Probe::new(Ok(()));
        let validator =
            ConnectorValidator::new(repo.clone(), probe.clone(), probe, Duration::from_secs(5));
        let ctx = TenantContext::new(TenantId::new());
        let stuck = repo
            .create(&ctx, new_imap(), &[(CredentialKind::Password, "pw")])
            .await
            .unwrap();
        let healthy = repo
            .create(&ctx, new_imap(), &[(CredentialKind::Password, "pw")])
            .await
            .unwrap();
        sqlx::query(&format!(
            "CREATE TEMP TRIGGER refuse_validating BEFORE UPDATE ON main.connectors \
             WHEN NEW.id = '{}' AND NEW.validation_status = 'validating' \
             BEGIN SELECT RAISE(ABORT, 'row is locked'); END",
            stuck.id
        ))
        .execute(store.pool())
        .await
        .unwrap();

        let results = validator.validate_pending(&ctx).await.unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.contains(&(stuck.id, ValidationStatus::Failed)));
        assert!(results.contains(&(healthy.id, ValidationStatus::Validated)));
        let stored = repo.get(&ctx, stuck.id).await.unwrap().unwrap();
        assert!(stored.validation_error.unwrap().contains("row is locked"));
    }

    #[tokio::test]
    async fn demoted_connectors_are_revalidated_across_tenants() {
        let probe = Probe::new(Ok(()));
        let (validator, repo) = setup(probe).await;
        let first = TenantContext::new(TenantId::new());
        let second = TenantContext::new(TenantId::new());
        let demoted = repo
            .create(&first, new_imap(), &[(CredentialKind::Password, "pw")])
            .await
            .unwrap();
        let fresh = repo
            .create(&second, new_imap(), &[(CredentialKind::Password, "pw")])
            .await
            .unwrap();
        validator.validate(&first, demoted.id).await.unwrap();
        for _ in 0..2 {
            repo.record_health(&first, demoted.id, Some("timeout"), 2)
                .await
                .unwrap();
        }
        assert_eq!(
            repo.get(&first, demoted.id).await.unwrap().unwrap().validation_status,
            ValidationStatus::Pending
        );

        let results = validator.validate_all_pending().await.unwrap();

        assert_eq!(results.len(), 2);
        for (ctx, id) in [(&first, demoted.id), (&second, fresh.id)] {
            let stored = repo.get(ctx, id).await.unwrap().unwrap();
            assert_eq!(stored.validation_status, ValidationStatus::Validated);
            assert!(stored.is_eligible());
        }
        assert!(repo.pending_tenants().await.unwrap().is_empty());
    }
}
