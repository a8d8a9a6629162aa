//! Binding between the IMAP session verbs and the mailbox engine. Wire
//! parsing and encoding happen upstream: this layer receives decoded
//! commands and hands back typed results and mailbox events.

pub mod flow;
pub mod session;

pub use session::{Error, Session};
