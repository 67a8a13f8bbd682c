//! Per-tenant connector secret storage.
//!
//! Passwords, OAuth access tokens and DKIM private keys never touch the
//! connector table. They are stored under a key derived from
//! (tenant, connector, credential kind), so one tenant's lookup can never
//! reach another tenant's secret.
//!
//! [`KeyringCredentialStore`] uses the platform's native credential storage:
//! - Linux: Secret Service (GNOME Keyring, `KWallet`)
//! - macOS: Keychain
//! - Windows: Credential Manager

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use keyring::Entry;
use tracing::{debug, warn};

use crate::{ConnectorId, TenantId};

/// Service name used for keyring entries.
pub const SERVICE_NAME: &str = "ticketmail";

/// Error type for credential operations.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// Failed to access keyring.
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    /// A required secret has not been stored.
    #[error("No {kind} stored for connector {connector}")]
    Missing {
        /// Connector the secret belongs to.
        connector: ConnectorId,
        /// Which secret.
        kind: CredentialKind,
    },
}

/// Result type for credential operations.
pub type CredentialResult<T> = std::result::Result<T, CredentialError>;

/// Which secret of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    /// Account password.
    Password,
    /// `OAuth2` access token.
    OAuthToken,
    /// PEM-encoded DKIM private key.
    DkimKey,
}

impl CredentialKind {
    /// All kinds, for bulk deletion.
    pub const ALL: [Self; 3] = [Self::Password, Self::OAuthToken, Self::DkimKey];

    /// Key fragment for this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::OAuthToken => "oauth_token",
            Self::DkimKey => "dkim_key",
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A secret value whose `Debug` output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The secret text.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Storage for connector secrets.
pub trait CredentialStore: Send + Sync {
    /// Store or replace a secret.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails.
    fn store(
        &self,
        tenant: TenantId,
        connector: ConnectorId,
        kind: CredentialKind,
        secret: &str,
    ) -> CredentialResult<()>;

    /// Fetch a secret, `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails.
    fn get(
        &self,
        tenant: TenantId,
        connector: ConnectorId,
        kind: CredentialKind,
    ) -> CredentialResult<Option<Secret>>;

    /// Remove a secret; removing an absent secret succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails.
    fn delete(
        &self,
        tenant: TenantId,
        connector: ConnectorId,
        kind: CredentialKind,
    ) -> CredentialResult<()>;

    /// Fetch a secret that must exist.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Missing`] if absent.
    fn require(
        &self,
        tenant: TenantId,
        connector: ConnectorId,
        kind: CredentialKind,
    ) -> CredentialResult<Secret> {
        self.get(tenant, connector, kind)?
            .ok_or(CredentialError::Missing { connector, kind })
    }

    /// Remove every secret of a connector.
    ///
    /// # Errors
    ///
    /// Returns the first backing store failure.
    fn delete_all(&self, tenant: TenantId, connector: ConnectorId) -> CredentialResult<()> {
        for kind in CredentialKind::ALL {
            self.delete(tenant, connector, kind)?;
        }
        Ok(())
    }
}

/// Generates the keyring entry key for a credential.
fn credential_key(tenant: TenantId, connector: ConnectorId, kind: CredentialKind) -> String {
    format!("{SERVICE_NAME}_{tenant}_{connector}_{kind}")
}

/// Secrets in the system keyring.
#[derive(Debug, Clone)]
pub struct KeyringCredentialStore {
    service: String,
}

impl KeyringCredentialStore {
    /// Store using the default service name.
    #[must_use]
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    /// Store using a custom service name.
    #[must_use]
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(
        &self,
        tenant: TenantId,
        connector: ConnectorId,
        kind: CredentialKind,
    ) -> CredentialResult<Entry> {
        Ok(Entry::new(
            &self.service,
            &credential_key(tenant, connector, kind),
        )?)
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn store(
        &self,
        tenant: TenantId,
        connector: ConnectorId,
        kind: CredentialKind,
        secret: &str,
    ) -> CredentialResult<()> {
        self.entry(tenant, connector, kind)?.set_password(secret)?;
        debug!("Stored {kind} for connector {connector}");
        Ok(())
    }

    fn get(
        &self,
        tenant: TenantId,
        connector: ConnectorId,
        kind: CredentialKind,
    ) -> CredentialResult<Option<Secret>> {
        match self.entry(tenant, connector, kind)?.get_password() {
            Ok(secret) => Ok(Some(Secret::new(secret))),
            Err(keyring::Error::NoEntry) => {
                debug!("No {kind} found for connector {connector}");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn delete(
        &self,
        tenant: TenantId,
        connector: ConnectorId,
        kind: CredentialKind,
    ) -> CredentialResult<()> {
        match self.entry(tenant, connector, kind)?.delete_credential() {
            Ok(()) => debug!("Deleted {kind} for connector {connector}"),
            Err(keyring::Error::NoEntry) => {}
            Err(e) => {
                warn!("Failed to delete {kind} for connector {connector}: {e}");
                return Err(e.into());
            }
        }
        Ok(())
    }
}

type MemoryKey = (TenantId, ConnectorId, CredentialKind);

/// Process-local secret store for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<MemoryKey, String>>,
}

impl MemoryCredentialStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn store(
        &self,
        tenant: TenantId,
        connector: ConnectorId,
        kind: CredentialKind,
        secret: &str,
    ) -> CredentialResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((tenant, connector, kind), secret.to_string());
        Ok(())
    }

    fn get(
        &self,
        tenant: TenantId,
        connector: ConnectorId,
        kind: CredentialKind,
    ) -> CredentialResult<Option<Secret>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(tenant, connector, kind))
            .map(|s| Secret::new(s.clone())))
    }

    fn delete(
        &self,
        tenant: TenantId,
        connector: ConnectorId,
        kind: CredentialKind,
    ) -> CredentialResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(tenant, connector, kind));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn key_includes_tenant_connector_and_kind() {
        let tenant = TenantId::new();
        let connector = ConnectorId::new();
        let key = credential_key(tenant, connector, CredentialKind::DkimKey);
        assert!(key.starts_with("ticketmail_"));
        assert!(key.contains(&tenant.to_string()));
        assert!(key.contains(&connector.to_string()));
        assert!(key.ends_with("_dkim_key"));
    }

    #[test]
    fn memory_store_is_tenant_scoped() {
        let store = MemoryCredentialStore::new();
        let connector = ConnectorId::new();
        let (a, b) = (TenantId::new(), TenantId::new());

        store
            .store(a, connector, CredentialKind::Password, "hunter2")
            .unwrap();

        assert_eq!(
            store
                .get(a, connector, CredentialKind::Password)
                .unwrap()
                .unwrap()
                .expose(),
            "hunter2"
        );
        assert!(store.get(b, connector, CredentialKind::Password).unwrap().is_none());
        assert!(matches!(
            store.require(b, connector, CredentialKind::Password),
            Err(CredentialError::Missing { .. })
        ));
    }

    #[test]
    fn delete_all_removes_every_kind() {
        let store = MemoryCredentialStore::new();
        let (tenant, connector) = (TenantId::new(), ConnectorId::new());
        for kind in CredentialKind::ALL {
            store.store(tenant, connector, kind, "x").unwrap();
        }
        store.delete_all(tenant, connector).unwrap();
        for kind in CredentialKind::ALL {
            assert!(store.get(tenant, connector, kind).unwrap().is_none());
        }
    }

    #[test]
    fn secret_debug_is_redacted() {
        assert_eq!(format!("{:?}", Secret::new("hunter2")), "Secret(***)");
    }
}
