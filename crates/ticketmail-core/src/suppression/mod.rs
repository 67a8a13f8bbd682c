//! Suppression list and bounce handling.
//!
//! Hard bounces and complaints suppress the recipient for the whole tenant;
//! the outbound dispatcher consults the list before every send.

mod manager;
mod model;

pub(crate) use manager::{is_suppressed_in, record_bounce};
pub use manager::SuppressionManager;
pub use model::{Bounce, BounceEvent, BounceKind, Suppression, SuppressionSource, classify};
