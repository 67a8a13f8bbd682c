//! Thread and VERP reply routing.
//!
//! Each ticket owns at most one active routing row. The row's token is
//! embedded in the reply address (`support+<token>@acme.com`) and the
//! conversation root Message-ID is matched against `In-Reply-To` and
//! `References` of later mail.

mod model;
mod router;

pub use model::{
    MatchSource, Resolution, TOKEN_LEN, ThreadSignals, TicketRouting, is_token, mint_token,
    reply_address, token_of,
};
pub(crate) use router::{ensure_active_in, mint_in, resolve_in};
pub use router::ThreadRouter;
