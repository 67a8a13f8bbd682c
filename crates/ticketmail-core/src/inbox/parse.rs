//! MIME parsing of fetched messages.

use chrono::{DateTime, Utc};
use mail_parser::{Message, MessageParser, MimeHeaders, PartType};
use thiserror::Error;

use crate::address;
use crate::routing::ThreadSignals;

const SNIPPET_LEN: usize = 200;

const AUTO_REPLY_SUBJECTS: &[&str] = &[
    "out of office",
    "automatic reply",
    "auto-reply",
    "autoreply",
    "vacation",
    "away message",
    "delivery status notification",
    "undelivered mail returned",
    "mail delivery failed",
];

/// Per-message failures; the cycle logs them and moves on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MessageError {
    /// The bytes are not a parsable RFC 5322 message.
    #[error("unparsable message")]
    Parse,

    /// The message has no usable Message-ID header.
    #[error("missing Message-ID")]
    MissingMessageId,
}

/// One attachment as found in the MIME tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAttachment {
    /// File name, or a generated one.
    pub filename: String,
    /// `type/subtype`.
    pub content_type: String,
    /// `Content-ID` without brackets.
    pub content_id: Option<String>,
    /// Whether the part is displayed inline.
    pub inline: bool,
    /// Decoded contents.
    pub bytes: Vec<u8>,
}

/// The fields the engine needs from an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEmail {
    /// Normalised `<id@domain>`.
    pub message_id: String,
    /// Normalised `In-Reply-To`.
    pub in_reply_to: Option<String>,
    /// Normalised `References`, in header order.
    pub references: Vec<String>,
    /// Sender address.
    pub from_address: Option<String>,
    /// Sender display name.
    pub from_name: Option<String>,
    /// `To` recipients.
    pub to: Vec<String>,
    /// `Cc` recipients.
    pub cc: Vec<String>,
    /// `Delivered-To` and `X-Original-To` recipients.
    pub envelope_to: Vec<String>,
    /// Subject, possibly empty.
    pub subject: String,
    /// Plain text body.
    pub text: Option<String>,
    /// HTML body.
    pub html: Option<String>,
    /// Whitespace-collapsed preview.
    pub snippet: String,
    /// `Date` header.
    pub sent_at: Option<DateTime<Utc>>,
    /// Whether the headers or subject mark this as machine generated.
    pub auto_reply: bool,
    /// Attachments with their bytes.
    pub attachments: Vec<ParsedAttachment>,
    /// Raw size.
    pub size_bytes: usize,
}

impl ParsedEmail {
    /// Parse raw RFC 5322 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Parse`] if the bytes are not a message and
    /// [`MessageError::MissingMessageId`] if it has no Message-ID.
    pub fn parse(raw: &[u8]) -> Result<Self, MessageError> {
        let message = MessageParser::default()
            .parse(raw)
            .filter(|m| !m.headers().is_empty())
            .ok_or(MessageError::Parse)?;

        let message_id = message
            .message_id()
            .and_then(address::normalize_message_id)
            .ok_or(MessageError::MissingMessageId)?;

        let in_reply_to = message
            .in_reply_to()
            .as_text_list()
            .and_then(|ids| ids.first().and_then(|id| address::normalize_message_id(id)));
        let references = message
            .references()
            .as_text_list()
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| address::normalize_message_id(id))
                    .collect()
            })
            .unwrap_or_default();

        let from = message.from().and_then(|from| from.first());
        let subject = message.subject().unwrap_or_default().trim().to_string();
        let text = text_body(&message);
        let html = html_body(&message);
        let snippet = match (&text, &html) {
            (Some(text), _) => preview(text, false),
            (None, Some(html)) => preview(html, true),
            (None, None) => String::new(),
        };

        let mut envelope_to = Vec::new();
        for header in ["Delivered-To", "X-Original-To"] {
            if let Some(raw) = message.header_raw(header) {
                envelope_to.extend(address::extract_all(raw));
            }
        }

        Ok(Self {
            message_id,
            in_reply_to,
            references,
            from_address: from.and_then(|a| a.address()).map(address::normalize),
            from_name: from.and_then(|a| a.name()).map(ToString::to_string),
            to: addresses(message.to()),
            cc: addresses(message.cc()),
            envelope_to,
            auto_reply: is_auto_reply(&message, &subject),
            subject,
            text,
            html,
            snippet,
            sent_at: message
                .date()
                .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0)),
            attachments: attachments(&message),
            size_bytes: raw.len(),
        })
    }

    /// Whether the message claims to answer an earlier one.
    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.in_reply_to.is_some() || !self.references.is_empty()
    }

    /// Every recipient, header and envelope, deduplicated.
    #[must_use]
    pub fn recipients(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .to
            .iter()
            .chain(&self.cc)
            .chain(&self.envelope_to)
            .cloned()
            .collect();
        all.sort();
        all.dedup();
        all
    }

    /// Evidence for the thread router.
    #[must_use]
    pub fn thread_signals(&self) -> ThreadSignals {
        ThreadSignals {
            message_id: Some(self.message_id.clone()),
            in_reply_to: self.in_reply_to.clone(),
            references: self.references.clone(),
            recipients: self.recipients(),
        }
    }

    /// Oldest known ancestor: first `References` entry, else `In-Reply-To`.
    #[must_use]
    pub fn thread_ref(&self) -> Option<&str> {
        self.references
            .first()
            .or(self.in_reply_to.as_ref())
            .map(String::as_str)
    }

    /// Body to copy into the ticket conversation.
    #[must_use]
    pub fn conversation_body(&self) -> String {
        match (&self.text, &self.html) {
            (Some(text), _) => text.trim().to_string(),
            (None, Some(html)) => strip_tags(html).trim().to_string(),
            (None, None) => String::new(),
        }
    }
}

/// Subject without leading reply and forward prefixes.
#[must_use]
pub fn clean_subject(subject: &str) -> &str {
    let mut rest = subject.trim();
    loop {
        let lowered = rest.to_ascii_lowercase();
        let Some(prefix) = ["re:", "fw:", "fwd:", "aw:", "sv:"]
            .iter()
            .find(|p| lowered.starts_with(*p))
        else {
            return rest;
        };
        rest = rest[prefix.len()..].trim_start();
    }
}

/// Whether a subject line looks machine generated.
#[must_use]
pub fn is_auto_reply_subject(subject: &str) -> bool {
    let lowered = subject.to_lowercase();
    AUTO_REPLY_SUBJECTS.iter().any(|s| lowered.contains(s))
}

fn is_auto_reply(message: &Message<'_>, subject: &str) -> bool {
    let header = |name: &'static str| message.header_raw(name).map(|v| v.trim().to_ascii_lowercase());

    if header("Auto-Submitted").is_some_and(|v| !v.is_empty() && v != "no") {
        return true;
    }
    if ["X-Autoreply", "X-Autorespond", "X-Auto-Response-Suppress"]
        .into_iter()
        .any(|name| header(name).is_some())
    {
        return true;
    }
    if header("Precedence").is_some_and(|v| matches!(v.as_str(), "bulk" | "list" | "junk")) {
        return true;
    }
    is_auto_reply_subject(subject)
}

fn addresses(list: Option<&mail_parser::Address<'_>>) -> Vec<String> {
    list.map(|list| {
        list.iter()
            .filter_map(|addr| addr.address())
            .map(address::normalize)
            .collect()
    })
    .unwrap_or_default()
}

fn text_body(message: &Message<'_>) -> Option<String> {
    message.text_bodies().find_map(|part| match &part.body {
        PartType::Text(text) => Some(text.to_string()),
        _ => None,
    })
}

fn html_body(message: &Message<'_>) -> Option<String> {
    message.html_bodies().find_map(|part| match &part.body {
        PartType::Html(html) => Some(html.to_string()),
        _ => None,
    })
}

fn attachments(message: &Message<'_>) -> Vec<ParsedAttachment> {
    message
        .attachments()
        .enumerate()
        .map(|(index, part)| {
            let content_type = part.content_type().map_or_else(
                || "application/octet-stream".to_string(),
                |ct| match ct.subtype() {
                    Some(sub) => format!("{}/{sub}", ct.ctype()),
                    None => ct.ctype().to_string(),
                },
            );
            ParsedAttachment {
                filename: part
                    .attachment_name()
                    .map_or_else(|| format!("attachment-{}", index + 1), ToString::to_string),
                content_type: content_type.to_lowercase(),
                content_id: part
                    .content_id()
                    .map(|id| id.trim_matches(|c| c == '<' || c == '>').to_string()),
                inline: part
                    .content_disposition()
                    .is_some_and(|d| d.ctype().eq_ignore_ascii_case("inline")),
                bytes: part.contents().to_vec(),
            }
        })
        .collect()
}

fn preview(body: &str, is_html: bool) -> String {
    let plain = if is_html { strip_tags(body) } else { body.to_string() };
    plain
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(SNIPPET_LEN)
        .collect()
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SIMPLE: &[u8] = b"From: \"Jane Customer\" <Jane@Customer.com>\r\n\
        To: support@acme.com\r\n\
        Cc: Boss@Customer.com\r\n\
        Delivered-To: support+0123456789abcdef0123456789abcdef@acme.com\r\n\
        Subject: Printer is on fire\r\n\
        Date: Mon, 1 Jan 2024 12:00:00 +0000\r\n\
        Message-ID: <abc123@Customer.COM>\r\n\
        \r\n\
        Hello,\r\n\r\n   it is   burning.\r\n";

    #[test]
    fn parses_core_fields() {
        let email = ParsedEmail::parse(SIMPLE).unwrap();
        assert_eq!(email.message_id, "<abc123@customer.com>");
        assert_eq!(email.from_address.as_deref(), Some("jane@customer.com"));
        assert_eq!(email.from_name.as_deref(), Some("Jane Customer"));
        assert_eq!(email.to, vec!["support@acme.com"]);
        assert_eq!(email.cc, vec!["boss@customer.com"]);
        assert_eq!(email.subject, "Printer is on fire");
        assert_eq!(email.snippet, "Hello, it is burning.");
        assert!(email.sent_at.is_some());
        assert!(!email.is_reply());
        assert!(!email.auto_reply);
        assert_eq!(email.size_bytes, SIMPLE.len());
        assert!(
            email
                .recipients()
                .contains(&"support+0123456789abcdef0123456789abcdef@acme.com".to_string())
        );
    }

    #[test]
    fn parses_threading_headers() {
        let raw = b"From: a@b.com\r\n\
            Message-ID: <r2@b.com>\r\n\
            In-Reply-To: <Root@ACME.com>\r\n\
            References: <first@acme.com> <root@acme.com>\r\n\
            Subject: Re: Re: help\r\n\
            \r\n\
            thanks\r\n";
        let email = ParsedEmail::parse(raw).unwrap();
        assert!(email.is_reply());
        assert_eq!(email.in_reply_to.as_deref(), Some("<Root@acme.com>"));
        assert_eq!(email.references, vec!["<first@acme.com>", "<root@acme.com>"]);
        assert_eq!(email.thread_ref(), Some("<first@acme.com>"));
        assert_eq!(clean_subject(&email.subject), "help");
    }

    #[test]
    fn missing_message_id_is_rejected() {
        let raw = b"From: a@b.com\r\nSubject: hi\r\n\r\nbody\r\n";
        assert_eq!(ParsedEmail::parse(raw), Err(MessageError::MissingMessageId));
    }

    #[test]
    fn auto_reply_headers_and_subjects() {
        let auto = b"From: a@b.com\r\nMessage-ID: <x@b.com>\r\nAuto-Submitted: auto-replied\r\nSubject: hi\r\n\r\nbody\r\n";
        assert!(ParsedEmail::parse(auto).unwrap().auto_reply);

        let human = b"From: a@b.com\r\nMessage-ID: <x@b.com>\r\nAuto-Submitted: no\r\nSubject: hi\r\n\r\nbody\r\n";
        assert!(!ParsedEmail::parse(human).unwrap().auto_reply);

        let bulk = b"From: a@b.com\r\nMessage-ID: <x@b.com>\r\nPrecedence: Bulk\r\nSubject: hi\r\n\r\nbody\r\n";
        assert!(ParsedEmail::parse(bulk).unwrap().auto_reply);

        let ooo = b"From: a@b.com\r\nMessage-ID: <x@b.com>\r\nSubject: Out of Office: back Monday\r\n\r\nbody\r\n";
        assert!(ParsedEmail::parse(ooo).unwrap().auto_reply);
    }

    #[test]
    fn html_only_body_and_attachments() {
        let raw = b"From: a@b.com\r\n\
            Message-ID: <m@b.com>\r\n\
            Subject: logs\r\n\
            MIME-Version: 1.0\r\n\
            Content-Type: multipart/mixed; boundary=\"XX\"\r\n\
            \r\n\
            --XX\r\n\
            Content-Type: text/html\r\n\
            \r\n\
            <p>See <b>attached</b></p>\r\n\
            --XX\r\n\
            Content-Type: text/plain; name=\"log.txt\"\r\n\
            Content-Disposition: attachment; filename=\"log.txt\"\r\n\
            \r\n\
            line one\r\n\
            --XX--\r\n";
        let email = ParsedEmail::parse(raw).unwrap();
        assert_eq!(email.snippet, "See attached");
        assert_eq!(email.conversation_body(), "See  attached");
        assert_eq!(email.attachments.len(), 1);
        let attachment = &email.attachments[0];
        assert_eq!(attachment.filename, "log.txt");
        assert_eq!(attachment.content_type, "text/plain");
        assert!(!attachment.inline);
        assert!(String::from_utf8_lossy(&attachment.bytes).contains("line one"));
    }
}
