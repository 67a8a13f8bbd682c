//! SMTP adapter over `lettre`, with optional DKIM signing.

use async_trait::async_trait;
use lettre::message::dkim::{DkimConfig, DkimSigningAlgorithm, DkimSigningKey};
use lettre::message::header::{Header, HeaderName, HeaderValue};
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;

use crate::TransportError;
use crate::connector::{AuthMethod, Security};
use crate::transport::{DkimKey, OutboundProtocol, OutgoingMail, SmtpTarget};

/// `Auto-Submitted` header (RFC 3834); keeps agent replies out of
/// autoresponder loops.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AutoSubmitted(String);

impl Header for AutoSubmitted {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("Auto-Submitted")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

/// Outbound adapter that submits over SMTP.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmtpProtocol;

impl SmtpProtocol {
    /// Create the adapter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn transport(target: &SmtpTarget) -> Result<AsyncSmtpTransport<Tokio1Executor>, TransportError> {
    let server = &target.server;
    let builder = match server.security {
        Security::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&server.host)
            .map_err(|e| map_error(&e))?,
        Security::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&server.host)
            .map_err(|e| map_error(&e))?,
        Security::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&server.host),
    };

    let mechanisms = match &target.auth {
        AuthMethod::Password { .. } => vec![Mechanism::Plain, Mechanism::Login],
        AuthMethod::OAuth2 { .. } => vec![Mechanism::Xoauth2],
    };
    let credentials = Credentials::new(
        target.auth.username().to_string(),
        target.secret.expose().to_string(),
    );

    Ok(builder
        .port(server.port)
        .credentials(credentials)
        .authentication(mechanisms)
        .build())
}

/// Translate a `lettre` failure into the engine's retry classification.
fn map_error(e: &lettre::transport::smtp::Error) -> TransportError {
    if let Some(code) = e.status() {
        if let Ok(code) = code.to_string().parse::<u16>() {
            return TransportError::from_reply(code, e.to_string());
        }
    }
    if e.is_timeout() {
        return TransportError::Connection(format!("timed out: {e}"));
    }
    if e.is_client() {
        return TransportError::Protocol(e.to_string());
    }
    TransportError::Connection(e.to_string())
}

fn mailbox(address: &str, name: Option<&str>) -> Result<Mailbox, TransportError> {
    let mailbox: Mailbox = address
        .parse()
        .map_err(|e| TransportError::Protocol(format!("invalid address {address:?}: {e}")))?;
    Ok(match name {
        Some(name) => Mailbox::new(Some(name.to_string()), mailbox.email),
        None => mailbox,
    })
}

/// Build the MIME message for `mail`.
fn build(mail: &OutgoingMail) -> Result<Message, TransportError> {
    let mut builder = Message::builder()
        .message_id(Some(mail.message_id.clone()))
        .from(mailbox(&mail.from, mail.from_name.as_deref())?)
        .subject(mail.subject.clone())
        .header(AutoSubmitted("auto-replied".to_string()));

    if let Some(reply_to) = &mail.reply_to {
        builder = builder.reply_to(mailbox(reply_to, None)?);
    }
    for to in &mail.to {
        builder = builder.to(mailbox(to, None)?);
    }
    for cc in &mail.cc {
        builder = builder.cc(mailbox(cc, None)?);
    }
    if let Some(parent) = &mail.in_reply_to {
        builder = builder.in_reply_to(parent.clone());
    }
    if !mail.references.is_empty() {
        builder = builder.references(mail.references.join(" "));
    }

    let built = match &mail.html {
        Some(html) => builder.multipart(MultiPart::alternative_plain_html(
            mail.text.clone(),
            html.clone(),
        )),
        None => builder.singlepart(SinglePart::plain(mail.text.clone())),
    };
    built.map_err(|e| TransportError::Protocol(format!("building message: {e}")))
}

fn sign(message: &mut Message, key: &DkimKey) -> Result<(), TransportError> {
    let signing_key = DkimSigningKey::new(key.private_key.expose(), DkimSigningAlgorithm::Rsa)
        .map_err(|e| TransportError::Unsupported(format!("DKIM key: {e}")))?;
    let config = DkimConfig::default_config(
        key.settings.selector.clone(),
        key.settings.domain.clone(),
        signing_key,
    );
    message.sign(&config);
    Ok(())
}

#[async_trait]
impl OutboundProtocol for SmtpProtocol {
    async fn send(&self, target: &SmtpTarget, mail: &OutgoingMail) -> Result<(), TransportError> {
        let mut message = build(mail)?;
        if let Some(key) = &target.dkim {
            sign(&mut message, key)?;
        }

        let response = transport(target)?
            .send(message)
            .await
            .map_err(|e| map_error(&e))?;
        debug!(
            message_id = %mail.message_id,
            code = %response.code(),
            "SMTP accepted message"
        );
        Ok(())
    }

    async fn probe(&self, target: &SmtpTarget) -> Result<(), TransportError> {
        let reachable = transport(target)?
            .test_connection()
            .await
            .map_err(|e| map_error(&e))?;
        if reachable {
            Ok(())
        } else {
            Err(TransportError::Connection(format!(
                "{}:{} did not answer",
                target.server.host, target.server.port
            )))
        }
    }
}
