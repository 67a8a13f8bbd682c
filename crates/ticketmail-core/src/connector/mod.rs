//! Connector registry.
//!
//! Provides connector configuration, secret storage, static validation and
//! the validation state machine that gates sync and send eligibility.

pub mod credentials;
mod model;
mod repository;
mod validation;
mod validator;

pub use credentials::{
    CredentialError, CredentialKind, CredentialResult, CredentialStore, KeyringCredentialStore,
    MemoryCredentialStore, Secret,
};
pub use model::{
    AuthMethod, Connector, ConnectorHealth, ConnectorKind, Direction, DkimSettings, ImapSettings,
    NewConnector, OAuthProvider, ProviderSettings, Security, SeenStrategy, ServerEndpoint,
    SmtpSettings, ValidationStatus,
};
pub use repository::{ConnectorRepository, HealthChange};
pub(crate) use repository::fetch as fetch_connector;
pub(crate) use validation::is_valid_email;
pub use validation::{ValidationError, ValidationResult, describe, validate_config, validate_secrets};
pub use validator::ConnectorValidator;

#[cfg(test)]
pub(crate) use repository::tests::imap_kind;
