pub mod incoming;
pub mod mailbox;
pub mod mime;
pub mod namespace;
pub mod query;
pub mod record;
pub mod search;
pub mod sequence;
pub mod uidindex;
