//! Protocol adapter seams.
//!
//! The engine never speaks IMAP or SMTP itself. It drives a
//! [`MailSource`] opened by an [`InboundProtocol`] and hands finished
//! messages to an [`OutboundProtocol`]. Production adapters live in
//! [`crate::ingest::imap`] and [`crate::outbound::smtp`]; tests script their own.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::TransportError;
use crate::connector::{AuthMethod, DkimSettings, ImapSettings, Secret, ServerEndpoint};

/// Everything needed to log in to an IMAP server.
#[derive(Debug, Clone)]
pub struct ImapTarget {
    /// Connector settings.
    pub settings: ImapSettings,
    /// Folder to poll.
    pub folder: String,
    /// Password or access token.
    pub secret: Secret,
}

/// DKIM identity with its key.
#[derive(Debug, Clone)]
pub struct DkimKey {
    /// Signing domain and selector.
    pub settings: DkimSettings,
    /// PEM-encoded private key.
    pub private_key: Secret,
}

/// Everything needed to submit mail.
#[derive(Debug, Clone)]
pub struct SmtpTarget {
    /// Submission server.
    pub server: ServerEndpoint,
    /// Authentication method.
    pub auth: AuthMethod,
    /// Password or access token.
    pub secret: Secret,
    /// Signing identity, when configured.
    pub dkim: Option<DkimKey>,
}

/// A fully addressed outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    /// Message-ID including angle brackets.
    pub message_id: String,
    /// Sender address.
    pub from: String,
    /// Sender display name.
    pub from_name: Option<String>,
    /// Reply-To address (the ticket's routing address).
    pub reply_to: Option<String>,
    /// Primary recipients.
    pub to: Vec<String>,
    /// Copy recipients.
    pub cc: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub text: String,
    /// Optional HTML alternative.
    pub html: Option<String>,
    /// In-Reply-To header.
    pub in_reply_to: Option<String>,
    /// References header entries.
    pub references: Vec<String>,
}

/// An authenticated IMAP session.
#[async_trait]
pub trait MailSource: Send {
    /// Select the folder to work on.
    async fn select(&mut self, folder: &str) -> Result<(), TransportError>;

    /// UIDs strictly greater than `after` in the selected folder, ascending.
    async fn uids_after(&mut self, after: u32) -> Result<Vec<u32>, TransportError>;

    /// Raw RFC 5322 bytes of one message, `None` if it vanished.
    ///
    /// With `peek` the fetch must not set `\Seen`.
    async fn fetch(&mut self, uid: u32, peek: bool) -> Result<Option<Vec<u8>>, TransportError>;

    /// Set `\Seen` on a message.
    async fn mark_seen(&mut self, uid: u32) -> Result<(), TransportError>;

    /// Close the session; errors are ignored.
    async fn logout(self: Box<Self>);
}

/// Opens IMAP sessions.
#[async_trait]
pub trait InboundProtocol: Send + Sync {
    /// Connect and authenticate.
    async fn connect(&self, target: &ImapTarget) -> Result<Box<dyn MailSource>, TransportError>;

    /// Validation handshake: log in and select the folder.
    async fn probe(&self, target: &ImapTarget) -> Result<(), TransportError> {
        let mut session = self.connect(target).await?;
        let selected = session.select(&target.folder).await;
        session.logout().await;
        selected
    }
}

/// Submits mail.
#[async_trait]
pub trait OutboundProtocol: Send + Sync {
    /// Send one message to every `to` and `cc` recipient.
    async fn send(&self, target: &SmtpTarget, mail: &OutgoingMail) -> Result<(), TransportError>;

    /// Validation handshake: connect and authenticate without sending.
    async fn probe(&self, target: &SmtpTarget) -> Result<(), TransportError>;
}

/// Runs a network operation under a deadline.
///
/// # Errors
///
/// Returns [`TransportError::Timeout`] if the deadline passes, otherwise
/// the operation's own result.
pub async fn with_timeout<T, F>(limit: Duration, operation: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    tokio::time::timeout(limit, operation)
        .await
        .map_err(|_| TransportError::Timeout(limit))?
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn slow_operation_times_out() {
        let result: Result<(), _> = with_timeout(Duration::from_secs(5), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(TransportError::Timeout(Duration::from_secs(5))));
    }

    #[tokio::test]
    async fn fast_operation_passes_through() {
        let value = with_timeout(Duration::from_secs(5), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
