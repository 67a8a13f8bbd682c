//! Error types for the core library.

use std::time::Duration;

use thiserror::Error;

/// Marker raised by the storage-layer tenant guard triggers.
pub(crate) const SCOPE_VIOLATION: &str = "tenant scope violation";

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Requested record does not exist in the caller's tenant.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credential storage error.
    #[error("Credential error: {0}")]
    Credential(#[from] crate::connector::CredentialError),

    /// Mail protocol failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A single message could not be understood.
    #[error("Message error: {0}")]
    Message(#[from] crate::inbox::MessageError),

    /// Connector is not validated, inactive, or of the wrong direction.
    #[error("Connector not eligible: {0}")]
    Ineligible(String),

    /// No send slot became free within the permit timeout.
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// The mailbox lease was reclaimed or paused while this worker held it.
    #[error("Lease lost: {0}")]
    LeaseLost(String),

    /// A stored value could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl Error {
    /// Whether this error was raised by the tenant guard because a write
    /// targeted a row outside the bound tenant scope.
    #[must_use]
    pub fn is_scope_violation(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db)) => db.message().contains(SCOPE_VIOLATION),
            _ => false,
        }
    }

    /// Whether this error is a uniqueness constraint violation.
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::Database(sqlx::Error::Database(db)) if db.is_unique_violation())
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by an IMAP or SMTP adapter.
///
/// Retry policy is decided from the variant: [`is_retryable`](Self::is_retryable)
/// covers 4xx replies, dropped connections and timeouts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Server answered with a temporary (4xx) failure.
    #[error("temporary failure ({code}): {message}")]
    Transient {
        /// Reply code.
        code: u16,
        /// Server text.
        message: String,
    },

    /// Server answered with a permanent (5xx) failure.
    #[error("permanent failure ({code}): {message}")]
    Permanent {
        /// Reply code.
        code: u16,
        /// Server text.
        message: String,
    },

    /// Credentials were rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// TCP or TLS level failure.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Operation exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Connector asks for something the adapter cannot do.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Malformed or unexpected server response.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether the same operation may succeed if retried later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::Connection(_) | Self::Timeout(_)
        )
    }

    /// Whether this is a permanent rejection of the message or recipient.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }

    /// A permanent rejection of a recipient address (550/551/553 or an
    /// enhanced `5.1.x` status), as opposed to a rejection of the message.
    #[must_use]
    pub fn is_recipient_rejection(&self) -> bool {
        match self {
            Self::Permanent { code, message } => {
                matches!(code, 550 | 551 | 553) || message.trim_start().starts_with("5.1.")
            }
            _ => false,
        }
    }

    /// Classify an SMTP reply code.
    ///
    /// 530/534/535 are authentication rejections rather than recipient
    /// failures, so they never feed the bounce manager.
    #[must_use]
    pub fn from_reply(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            530 | 534 | 535 => Self::Auth(format!("{code} {message}")),
            400..=499 => Self::Transient { code, message },
            500..=599 => Self::Permanent { code, message },
            _ => Self::Protocol(format!("unexpected reply {code}: {message}")),
        }
    }
}
