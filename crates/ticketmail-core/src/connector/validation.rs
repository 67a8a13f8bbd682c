//! Static connector validation.
//!
//! These checks run before any network handshake; a connector that fails
//! them goes straight to `failed` without contacting its server.

use tracing::debug;

use super::credentials::{CredentialKind, CredentialStore};
use super::model::{ConnectorKind, DkimSettings, ServerEndpoint};
use crate::{ConnectorId, TenantId};

/// Validation error for connector configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Connector name is empty.
    EmptyName,
    /// Server host is empty.
    EmptyHost,
    /// Server port is zero.
    InvalidPort,
    /// Login name is empty.
    EmptyUsername,
    /// IMAP folder is empty.
    EmptyFolder,
    /// Provider account address is malformed.
    InvalidAccountEmail,
    /// DKIM domain or selector is empty.
    IncompleteDkim,
    /// Password or token has not been stored.
    MissingSecret,
    /// DKIM is configured but the private key has not been stored.
    MissingDkimKey,
}

impl ValidationError {
    /// Get human-readable error message.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::EmptyName => "Connector name is required",
            Self::EmptyHost => "Server host is required",
            Self::InvalidPort => "Server port must be 1-65535",
            Self::EmptyUsername => "Username is required",
            Self::EmptyFolder => "IMAP folder is required",
            Self::InvalidAccountEmail => "Provider account email is invalid",
            Self::IncompleteDkim => "DKIM domain and selector are both required",
            Self::MissingSecret => "Password or OAuth token has not been stored",
            Self::MissingDkimKey => "DKIM private key has not been stored",
        }
    }

    /// Get the field name this error relates to.
    #[must_use]
    pub const fn field(&self) -> &'static str {
        match self {
            Self::EmptyName => "name",
            Self::EmptyHost => "host",
            Self::InvalidPort => "port",
            Self::EmptyUsername => "username",
            Self::EmptyFolder => "folder",
            Self::InvalidAccountEmail => "account_email",
            Self::IncompleteDkim => "dkim",
            Self::MissingSecret => "secret",
            Self::MissingDkimKey => "dkim_key",
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for ValidationError {}

/// Result of validating a connector.
pub type ValidationResult = Result<(), Vec<ValidationError>>;

/// Joins validation errors into the text stored in `validation_error`.
#[must_use]
pub fn describe(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field(), e.message()))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Validate a connector's configuration.
///
/// # Errors
///
/// Returns a vector of `ValidationError` if any fields are invalid.
pub fn validate_config(name: &str, kind: &ConnectorKind) -> ValidationResult {
    let mut errors = Vec::new();

    if name.trim().is_empty() {
        errors.push(ValidationError::EmptyName);
    }

    match kind {
        ConnectorKind::InboundImap(settings) => {
            check_endpoint(&settings.server, &mut errors);
            if settings.auth.username().trim().is_empty() {
                errors.push(ValidationError::EmptyUsername);
            }
            if settings.folder.trim().is_empty() {
                errors.push(ValidationError::EmptyFolder);
            }
            if !is_standard_imap_port(settings.server.port) {
                debug!("IMAP connector uses non-standard port {}", settings.server.port);
            }
        }
        ConnectorKind::OutboundSmtp(settings) => {
            check_endpoint(&settings.server, &mut errors);
            if settings.auth.username().trim().is_empty() {
                errors.push(ValidationError::EmptyUsername);
            }
            check_dkim(settings.dkim.as_ref(), &mut errors);
            if !is_standard_smtp_port(settings.server.port) {
                debug!("SMTP connector uses non-standard port {}", settings.server.port);
            }
        }
        ConnectorKind::OutboundProvider(settings) => {
            if !is_valid_email(&settings.account_email) {
                errors.push(ValidationError::InvalidAccountEmail);
            }
            check_dkim(settings.dkim.as_ref(), &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Check that every secret the connector needs is present.
///
/// A credential store failure is reported as a missing secret; the
/// validator records the store error separately.
///
/// # Errors
///
/// Returns the missing secrets.
pub fn validate_secrets(
    tenant: TenantId,
    connector: ConnectorId,
    kind: &ConnectorKind,
    credentials: &dyn CredentialStore,
) -> ValidationResult {
    let mut errors = Vec::new();
    let present = |k| matches!(credentials.get(tenant, connector, k), Ok(Some(_)));

    if !present(kind.auth().credential_kind()) {
        errors.push(ValidationError::MissingSecret);
    }
    if kind.dkim().is_some() && !present(CredentialKind::DkimKey) {
        errors.push(ValidationError::MissingDkimKey);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_endpoint(server: &ServerEndpoint, errors: &mut Vec<ValidationError>) {
    if server.host.trim().is_empty() {
        errors.push(ValidationError::EmptyHost);
    }
    if server.port == 0 {
        errors.push(ValidationError::InvalidPort);
    }
}

fn check_dkim(dkim: Option<&DkimSettings>, errors: &mut Vec<ValidationError>) {
    if let Some(dkim) = dkim
        && (dkim.domain.trim().is_empty() || dkim.selector.trim().is_empty())
    {
        errors.push(ValidationError::IncompleteDkim);
    }
}

const fn is_standard_imap_port(port: u16) -> bool {
    matches!(port, 143 | 993)
}

const fn is_standard_smtp_port(port: u16) -> bool {
    matches!(port, 25 | 465 | 587 | 2525)
}

/// Basic email validation.
pub(crate) fn is_valid_email(email: &str) -> bool {
    let email = email.trim();

    // Must contain exactly one @
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }

    // Domain must contain at least one dot and no empty labels
    domain.contains('.') && domain.split('.').all(|p| !p.is_empty())
}
