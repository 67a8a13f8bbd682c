//! Connector model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ConnectorId, ProjectId, TenantId};

/// Security/encryption mode for connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    /// No encryption (not recommended).
    None,
    /// Implicit TLS (connect directly with TLS).
    #[default]
    Tls,
    /// STARTTLS upgrade after plaintext connect.
    StartTls,
}

impl Security {
    /// Get display name for the security mode.
    #[must_use]
    pub const fn display_name(&self) -> &'static str {
        match self {
            Self::None => "None (insecure)",
            Self::Tls => "SSL/TLS",
            Self::StartTls => "STARTTLS",
        }
    }
}

/// Host, port and transport security of a mail server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Security mode.
    #[serde(default)]
    pub security: Security,
}

impl ServerEndpoint {
    /// Endpoint with the given values.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, security: Security) -> Self {
        Self {
            host: host.into(),
            port,
            security,
        }
    }
}

/// How a connector authenticates. Secrets live in the credential store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Username and password (`LOGIN`/`AUTH PLAIN`).
    Password {
        /// Login name.
        username: String,
    },
    /// `XOAUTH2` bearer token.
    #[serde(rename = "oauth2")]
    OAuth2 {
        /// Account the token was issued for.
        username: String,
    },
}

impl AuthMethod {
    /// Login name regardless of method.
    #[must_use]
    pub fn username(&self) -> &str {
        match self {
            Self::Password { username } | Self::OAuth2 { username } => username,
        }
    }

    /// Which stored secret this method needs.
    #[must_use]
    pub const fn credential_kind(&self) -> super::CredentialKind {
        match self {
            Self::Password { .. } => super::CredentialKind::Password,
            Self::OAuth2 { .. } => super::CredentialKind::OAuthToken,
        }
    }
}

/// When fetched messages get the `\Seen` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeenStrategy {
    /// Peek while fetching, flag once the message is committed.
    #[default]
    MarkSeenAfterParse,
    /// Never touch flags.
    Never,
    /// Let the fetch itself set the flag.
    Immediate,
}

/// DKIM signing identity. The private key lives in the credential store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkimSettings {
    /// Signing domain (`d=`).
    pub domain: String,
    /// Selector (`s=`).
    pub selector: String,
}

fn default_folder() -> String {
    "INBOX".to_string()
}

/// IMAP polling connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImapSettings {
    /// IMAP server.
    pub server: ServerEndpoint,
    /// Authentication.
    pub auth: AuthMethod,
    /// Default folder for mailboxes on this connector.
    #[serde(default = "default_folder")]
    pub folder: String,
    /// Flag handling.
    #[serde(default)]
    pub seen_strategy: SeenStrategy,
}

/// SMTP submission connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpSettings {
    /// SMTP server.
    pub server: ServerEndpoint,
    /// Authentication.
    pub auth: AuthMethod,
    /// Optional DKIM signing.
    #[serde(default)]
    pub dkim: Option<DkimSettings>,
}

/// Hosted mail providers reachable with an OAuth token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OAuthProvider {
    /// Google Workspace / Gmail.
    Google,
    /// Microsoft 365 / Outlook.
    Microsoft,
}

impl OAuthProvider {
    /// Submission endpoint of the provider.
    #[must_use]
    pub fn smtp_endpoint(self) -> ServerEndpoint {
        match self {
            Self::Google => ServerEndpoint::new("smtp.gmail.com", 465, Security::Tls),
            Self::Microsoft => ServerEndpoint::new("smtp.office365.com", 587, Security::StartTls),
        }
    }
}

/// OAuth provider connector for outbound mail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Provider.
    pub provider: OAuthProvider,
    /// Mailbox the token belongs to.
    pub account_email: String,
    /// Optional DKIM signing.
    #[serde(default)]
    pub dkim: Option<DkimSettings>,
}

/// Connector configuration, one payload shape per connector type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectorKind {
    /// Inbound IMAP polling.
    InboundImap(ImapSettings),
    /// Outbound SMTP submission.
    OutboundSmtp(SmtpSettings),
    /// Outbound through an OAuth mail provider.
    OutboundProvider(ProviderSettings),
}

/// Traffic direction a connector serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Fetches mail.
    Inbound,
    /// Sends mail.
    Outbound,
}

impl ConnectorKind {
    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InboundImap(_) => "inbound_imap",
            Self::OutboundSmtp(_) => "outbound_smtp",
            Self::OutboundProvider(_) => "outbound_provider",
        }
    }

    /// Direction this connector serves.
    #[must_use]
    pub const fn direction(&self) -> Direction {
        match self {
            Self::InboundImap(_) => Direction::Inbound,
            Self::OutboundSmtp(_) | Self::OutboundProvider(_) => Direction::Outbound,
        }
    }

    /// Authentication method, synthesised for provider connectors.
    #[must_use]
    pub fn auth(&self) -> AuthMethod {
        match self {
            Self::InboundImap(s) => s.auth.clone(),
            Self::OutboundSmtp(s) => s.auth.clone(),
            Self::OutboundProvider(s) => AuthMethod::OAuth2 {
                username: s.account_email.clone(),
            },
        }
    }

    /// DKIM identity, if configured.
    #[must_use]
    pub const fn dkim(&self) -> Option<&DkimSettings> {
        match self {
            Self::InboundImap(_) => None,
            Self::OutboundSmtp(s) => s.dkim.as_ref(),
            Self::OutboundProvider(s) => s.dkim.as_ref(),
        }
    }
}

/// Validation lifecycle of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    /// Configuration changed; not yet checked.
    #[default]
    Pending,
    /// A validator is running the handshake.
    Validating,
    /// Handshake succeeded.
    Validated,
    /// Static checks or handshake failed.
    Failed,
}

impl ValidationStatus {
    /// Parse from database string representation.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "validating" => Self::Validating,
            "validated" => Self::Validated,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::Validated => "validated",
            Self::Failed => "failed",
        }
    }
}

/// Last observed health of a connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorHealth {
    /// Whether the last operation succeeded.
    pub ok: bool,
    /// When it was observed.
    pub checked_at: DateTime<Utc>,
    /// Failure description.
    pub message: Option<String>,
}

/// Stored connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connector {
    /// Identifier.
    pub id: ConnectorId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Owning project, if project scoped.
    pub project_id: Option<ProjectId>,
    /// Display name.
    pub name: String,
    /// Type-specific configuration.
    pub kind: ConnectorKind,
    /// Operator switch.
    pub is_active: bool,
    /// Validation lifecycle state.
    pub validation_status: ValidationStatus,
    /// Why validation failed or was reset.
    pub validation_error: Option<String>,
    /// When validation last finished.
    pub last_validation_at: Option<DateTime<Utc>>,
    /// Last observed health.
    pub last_health: Option<ConnectorHealth>,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last configuration or status change.
    pub updated_at: DateTime<Utc>,
}

impl Connector {
    /// Whether the connector may be used for sync or send.
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        self.is_active && self.validation_status == ValidationStatus::Validated
    }

    /// Eligible and serving the given direction.
    #[must_use]
    pub fn is_eligible_for(&self, direction: Direction) -> bool {
        self.is_eligible() && self.kind.direction() == direction
    }

    /// Human-readable reason the connector cannot be used, if any.
    #[must_use]
    pub fn ineligibility(&self, direction: Direction) -> Option<String> {
        if self.kind.direction() != direction {
            return Some(format!(
                "connector {} is {} and cannot be used for {direction:?} mail",
                self.id,
                self.kind.as_str()
            ));
        }
        if !self.is_active {
            return Some(format!("connector {} is inactive", self.id));
        }
        match self.validation_status {
            ValidationStatus::Validated => None,
            ValidationStatus::Failed => Some(format!(
                "connector {} failed validation: {}",
                self.id,
                self.validation_error.as_deref().unwrap_or("unknown error")
            )),
            status => Some(format!(
                "connector {} is {} validation",
                self.id,
                status.as_str()
            )),
        }
    }
}

/// Input for creating a connector.
#[derive(Debug, Clone)]
pub struct NewConnector {
    /// Owning project, if project scoped.
    pub project_id: Option<ProjectId>,
    /// Display name.
    pub name: String,
    /// Type-specific configuration.
    pub kind: ConnectorKind,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_tagged_by_type() {
        let kind = ConnectorKind::OutboundProvider(ProviderSettings {
            provider: OAuthProvider::Google,
            account_email: "support@acme.com".into(),
            dkim: None,
        });
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "outbound_provider");
        assert_eq!(json["provider"], "google");

        let back: ConnectorKind = serde_json::from_value(json).unwrap();
        assert_eq!(back, kind);
    }

    #[test]
    fn imap_settings_default_folder_and_strategy() {
        let kind: ConnectorKind = serde_json::from_str(
            r#"{"type":"inbound_imap","server":{"host":"imap.acme.com","port":993},
                "auth":{"method":"password","username":"support"}}"#,
        )
        .unwrap();
        let ConnectorKind::InboundImap(settings) = kind else {
            panic!("expected imap settings");
        };
        assert_eq!(settings.folder, "INBOX");
        assert_eq!(settings.seen_strategy, SeenStrategy::MarkSeenAfterParse);
        assert_eq!(settings.server.security, Security::Tls);
    }

    #[test]
    fn provider_auth_is_oauth() {
        let kind = ConnectorKind::OutboundProvider(ProviderSettings {
            provider: OAuthProvider::Microsoft,
            account_email: "help@acme.com".into(),
            dkim: None,
        });
        assert_eq!(
            kind.auth(),
            AuthMethod::OAuth2 {
                username: "help@acme.com".into()
            }
        );
        assert_eq!(kind.direction(), Direction::Outbound);
        assert_eq!(OAuthProvider::Microsoft.smtp_endpoint().port, 587);
    }

    #[test]
    fn validation_status_round_trip() {
        for status in [
            ValidationStatus::Pending,
            ValidationStatus::Validating,
            ValidationStatus::Validated,
            ValidationStatus::Failed,
        ] {
            assert_eq!(ValidationStatus::parse(status.as_str()), status);
        }
        assert_eq!(ValidationStatus::parse("garbage"), ValidationStatus::Pending);
    }
}
