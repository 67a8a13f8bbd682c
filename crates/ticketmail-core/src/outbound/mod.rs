//! Outbound replies.
//!
//! The [`OutboundDispatcher`] checks the sender and connector, ensures the
//! ticket's routing row, drops suppressed recipients, and sends through an
//! [`OutboundProtocol`](crate::transport::OutboundProtocol) on a
//! per-connector pool with exponential backoff. Every attempt is recorded
//! in the [`OutboundLog`].

mod dispatcher;
mod log;
mod model;
mod retry;
pub mod smtp;

pub use dispatcher::OutboundDispatcher;
pub use log::OutboundLog;
pub use model::{OutboundRecord, OutboundRequest, OutboundStatus, SendOutcome, SendReport};
pub use retry::{Attempted, with_retry};
pub use smtp::SmtpProtocol;
