use std::num::NonZeroU32;

use crate::mail::uidindex::{Flag, ImapUid};

/// How much of a message an operation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueryScope {
    /// UID and flags, known from the index alone.
    Index,
    /// Metadata stored in the message row: dates, size, headers.
    Partial,
    /// The whole message, read from its content blob.
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    pub msn: NonZeroU32,
    pub uid: ImapUid,
    pub flags: Vec<Flag>,
    pub internal_date: u64,
    pub size: u64,
    /// Raw header block, from `QueryScope::Partial` on.
    pub headers: Option<Vec<u8>>,
    /// Raw message, with `QueryScope::Full` only.
    pub content: Option<Vec<u8>>,
}

/// One section of a message, see `mime::Section`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSection {
    pub msn: NonZeroU32,
    pub uid: ImapUid,
    pub body: Vec<u8>,
}
