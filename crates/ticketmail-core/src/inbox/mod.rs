//! Inbound message parsing and storage.

mod model;
mod parse;
mod repository;

pub use model::{InboundLogEntry, InboundStatus, InboxMessage, StoredAttachment};
pub use parse::{
    MessageError, ParsedAttachment, ParsedEmail, clean_subject, is_auto_reply_subject,
};
pub(crate) use repository::{NewInboxMessage, exists_in, insert_in, log_in};
pub use repository::InboxRepository;
