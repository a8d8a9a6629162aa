use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::mail::uidindex::{Flag, ImapUid};
use crate::unique_ident::UniqueIdent;

pub const SEEN: &str = "\\Seen";
pub const ANSWERED: &str = "\\Answered";
pub const FLAGGED: &str = "\\Flagged";
pub const DELETED: &str = "\\Deleted";
pub const DRAFT: &str = "\\Draft";
pub const RECENT: &str = "\\Recent";

pub const SYSTEM_FLAGS: [&str; 6] = [SEEN, ANSWERED, FLAGGED, DELETED, DRAFT, RECENT];

/// A flag is either one of the system flags, or a keyword atom.
pub fn validate_flag(flag: &str) -> Result<()> {
    if SYSTEM_FLAGS.contains(&flag) {
        return Ok(());
    }
    let is_atom_char = |c: char| {
        c.is_ascii_graphic() && !matches!(c, '(' | ')' | '{' | '%' | '*' | '"' | '\\' | ']')
    };
    if flag.is_empty() || !flag.chars().all(is_atom_char) {
        return Err(Error::InvalidFlag(flag.to_string()));
    }
    Ok(())
}

pub fn validate_flags(flags: &[Flag]) -> Result<()> {
    flags.iter().try_for_each(|f| validate_flag(f))
}

/// One message as the engine sees it. The sequence number is not part of
/// it: it is derived from the UID order of the live messages.
///
/// Only small metadata lives in the row so flag updates never rewrite the
/// message body, which stays in the blob pointed to by `content`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub uid: ImapUid,
    pub ident: UniqueIdent,
    pub flags: Vec<Flag>,
    pub internal_date: u64,
    pub size: u64,
    pub headers: Vec<u8>,
    pub content: String,
    pub content_hash: String,
}

/// The persisted form. Every field is optional so a row written by another
/// version, or damaged, is reported as `MalformedRecord` instead of a
/// generic decoding error.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct StoredMessage {
    pub uid: Option<u32>,
    pub ident: Option<UniqueIdent>,
    pub flags: Option<Vec<Flag>>,
    pub internal_date: Option<u64>,
    pub size: Option<i64>,
    pub headers: Option<Vec<u8>>,
    pub content: Option<String>,
    pub content_hash: Option<String>,
}

impl From<&MessageRecord> for StoredMessage {
    fn from(m: &MessageRecord) -> Self {
        Self {
            uid: Some(m.uid.get()),
            ident: Some(m.ident),
            flags: Some(m.flags.clone()),
            internal_date: Some(m.internal_date),
            size: Some(m.size as i64),
            headers: Some(m.headers.clone()),
            content: Some(m.content.clone()),
            content_hash: Some(m.content_hash.clone()),
        }
    }
}

impl TryFrom<StoredMessage> for MessageRecord {
    type Error = Error;

    fn try_from(s: StoredMessage) -> Result<Self> {
        fn missing(field: &str) -> Error {
            Error::MalformedRecord(format!("message is missing field {}", field))
        }

        let uid = NonZeroU32::new(s.uid.ok_or_else(|| missing("uid"))?)
            .ok_or_else(|| Error::MalformedRecord("uid must be positive".into()))?;
        let size = s.size.ok_or_else(|| missing("size"))?;
        if size < 0 {
            return Err(Error::MalformedRecord(format!("negative size {}", size)));
        }
        let flags = s.flags.ok_or_else(|| missing("flags"))?;
        validate_flags(&flags).map_err(|e| Error::MalformedRecord(e.to_string()))?;

        Ok(Self {
            uid,
            ident: s.ident.ok_or_else(|| missing("ident"))?,
            flags,
            internal_date: s.internal_date.ok_or_else(|| missing("internal_date"))?,
            size: size as u64,
            headers: s.headers.unwrap_or_default(),
            content: s.content.ok_or_else(|| missing("content"))?,
            content_hash: s.content_hash.ok_or_else(|| missing("content_hash"))?,
        })
    }
}

impl MessageRecord {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    /// Unfolded value of every header field named `name` (case insensitive).
    pub fn header_values(&self, name: &[u8]) -> Vec<Vec<u8>> {
        header_fields(&self.headers)
            .into_iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
            .collect()
    }
}

/// Splits a raw header block into (name, unfolded value) pairs.
/// Lines without a colon that are not continuations are ignored.
pub fn header_fields(raw: &[u8]) -> Vec<(&[u8], Vec<u8>)> {
    let mut fields: Vec<(&[u8], Vec<u8>)> = vec![];
    for line in raw.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            break;
        }
        match line[0] {
            b' ' | b'\t' => {
                if let Some((_, v)) = fields.last_mut() {
                    v.push(b' ');
                    v.extend_from_slice(trim(line));
                }
            }
            _ => {
                if let Some(pos) = line.iter().position(|b| *b == b':') {
                    fields.push((trim(&line[..pos]), trim(&line[pos + 1..]).to_vec()));
                }
            }
        }
    }
    fields
}

fn trim(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(s.len());
    let end = s
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|p| p + 1)
        .unwrap_or(start);
    &s[start..end]
}

/// Raw header block of `raw`, if it parses as an RFC 5322 message with at
/// least one header field.
pub fn parse_headers(raw: &[u8]) -> Result<Vec<u8>> {
    let (_, msg) = eml_codec::parse_message(raw)
        .map_err(|_| Error::MalformedMessage("unparsable message".into()))?;
    let headers = msg.raw_headers;
    if header_fields(headers).is_empty() {
        return Err(Error::MalformedMessage("no header field".into()));
    }
    Ok(headers.to_vec())
}

/// Hex encoded SHA-256, used to recognize identical messages.
pub fn content_hash(raw: &[u8]) -> String {
    hex::encode(sodiumoxide::crypto::hash::sha256::hash(raw).as_ref())
}
