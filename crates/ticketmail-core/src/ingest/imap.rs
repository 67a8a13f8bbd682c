//! IMAP adapter over `async-imap` with implicit TLS.

use async_native_tls::{TlsConnector, TlsStream};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, warn};

use crate::TransportError;
use crate::connector::{AuthMethod, Security};
use crate::transport::{ImapTarget, InboundProtocol, MailSource};

type ImapSession = async_imap::Session<TlsStream<Compat<TcpStream>>>;

/// XOAUTH2 SASL response for OAuth connectors.
struct XOAuth2Authenticator {
    user: String,
    access_token: String,
}

impl async_imap::Authenticator for XOAuth2Authenticator {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

/// Production [`InboundProtocol`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ImapProtocol;

impl ImapProtocol {
    /// Create the adapter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl InboundProtocol for ImapProtocol {
    async fn connect(&self, target: &ImapTarget) -> Result<Box<dyn MailSource>, TransportError> {
        let server = &target.settings.server;
        if server.security != Security::Tls {
            return Err(TransportError::Unsupported(format!(
                "IMAP over {} (only implicit TLS is supported)",
                server.security.display_name()
            )));
        }

        let addr = format!("{}:{}", server.host, server.port);
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| TransportError::Connection(format!("{addr}: {e}")))?;
        let tls_stream = TlsConnector::new()
            .connect(&server.host, tcp.compat())
            .await
            .map_err(|e| TransportError::Connection(format!("TLS handshake with {addr}: {e}")))?;

        let client = async_imap::Client::new(tls_stream);
        let session = match &target.settings.auth {
            AuthMethod::Password { username } => client
                .login(username, target.secret.expose())
                .await
                .map_err(|e| TransportError::Auth(format!("{:?}", e.0)))?,
            AuthMethod::OAuth2 { username } => {
                let authenticator = XOAuth2Authenticator {
                    user: username.clone(),
                    access_token: target.secret.expose().to_string(),
                };
                client
                    .authenticate("XOAUTH2", authenticator)
                    .await
                    .map_err(|e| TransportError::Auth(format!("XOAUTH2: {:?}", e.0)))?
            }
        };

        debug!(host = %server.host, "Connected to IMAP server");
        Ok(Box::new(ImapSource { session }))
    }
}

struct ImapSource {
    session: ImapSession,
}

fn protocol(context: &str, e: &async_imap::error::Error) -> TransportError {
    match e {
        async_imap::error::Error::Io(io) => TransportError::Connection(format!("{context}: {io}")),
        other => TransportError::Protocol(format!("{context}: {other}")),
    }
}

#[async_trait]
impl MailSource for ImapSource {
    async fn select(&mut self, folder: &str) -> Result<(), TransportError> {
        self.session
            .select(folder)
            .await
            .map_err(|e| protocol(&format!("select {folder}"), &e))?;
        Ok(())
    }

    async fn uids_after(&mut self, after: u32) -> Result<Vec<u32>, TransportError> {
        let start = after.saturating_add(1);
        let found = self
            .session
            .uid_search(format!("UID {start}:*"))
            .await
            .map_err(|e| protocol("uid search", &e))?;
        // `n:*` always includes the highest UID, even when it is below `n`.
        let mut uids: Vec<u32> = found.into_iter().filter(|uid| *uid > after).collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch(&mut self, uid: u32, peek: bool) -> Result<Option<Vec<u8>>, TransportError> {
        let query = if peek { "(UID BODY.PEEK[])" } else { "(UID BODY[])" };
        let mut messages = self
            .session
            .uid_fetch(uid.to_string(), query)
            .await
            .map_err(|e| protocol("uid fetch", &e))?;

        let mut body = None;
        while let Some(result) = messages.next().await {
            let fetch = result.map_err(|e| protocol("uid fetch", &e))?;
            if body.is_none() {
                body = fetch.body().map(<[u8]>::to_vec);
            }
        }
        Ok(body)
    }

    async fn mark_seen(&mut self, uid: u32) -> Result<(), TransportError> {
        let responses: Vec<_> = self
            .session
            .uid_store(uid.to_string(), "+FLAGS (\\Seen)")
            .await
            .map_err(|e| protocol("uid store", &e))?
            .collect()
            .await;
        for response in responses {
            if let Err(e) = response {
                warn!(uid, "Error in store response: {e:?}");
            }
        }
        Ok(())
    }

    async fn logout(mut self: Box<Self>) {
        self.session.logout().await.ok();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::connector::{ImapSettings, Secret, SeenStrategy, ServerEndpoint};

    fn target(security: Security) -> ImapTarget {
        ImapTarget {
            settings: ImapSettings {
                server: ServerEndpoint::new("127.0.0.1", 1, security),
                auth: AuthMethod::Password {
                    username: "support".into(),
                },
                folder: "INBOX".into(),
                seen_strategy: SeenStrategy::Never,
            },
            folder: "INBOX".into(),
            secret: Secret::new("pw"),
        }
    }

    #[test]
    fn xoauth2_response_format() {
        let mut auth = XOAuth2Authenticator {
            user: "a@b.com".into(),
            access_token: "tok".into(),
        };
        assert_eq!(
            async_imap::Authenticator::process(&mut auth, b""),
            "user=a@b.com\x01auth=Bearer tok\x01\x01"
        );
    }

    #[tokio::test]
    async fn test_plaintext_is_unsupported() {
        let result = ImapProtocol::new().connect(&target(Security::StartTls)).await;
        assert!(matches!(result, Err(TransportError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_refused_connection_is_retryable() {
        let Err(err) = ImapProtocol::new().connect(&target(Security::Tls)).await else {
            panic!("connect to port 1 should fail");
        };
        assert!(err.is_retryable());
    }
}
