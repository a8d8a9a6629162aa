//! Parts of a stored message, as designated by a fetch section.
//!
//! ```raw
//!    HEADER     header of the message
//!    TEXT       body of the message          MULTIPART/MIXED
//!    1          TEXT/PLAIN
//!    2          MESSAGE/RFC822
//!    2.HEADER   header of the encapsulated message
//!    2.1        TEXT/PLAIN
//!    3          MULTIPART/ALTERNATIVE
//!    3.1.MIME   MIME header of the first alternative
//! ```

use std::collections::HashSet;
use std::num::NonZeroU32;

use eml_codec::header;
use eml_codec::mime::NaiveMIME;
use eml_codec::part::AnyPart;

use crate::error::{Error, Result};

pub type PartPath = Vec<NonZeroU32>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Section {
    /// The part at this path; the empty path is the whole message.
    Part(PartPath),
    /// Header of the message, or of the encapsulated message at this path.
    Header(PartPath),
    /// The header fields named in `names`, or all the others with `negate`.
    /// Names match case insensitively.
    HeaderFields {
        path: PartPath,
        names: Vec<String>,
        negate: bool,
    },
    /// Body of the message, or of the encapsulated message at this path.
    Text(PartPath),
    /// MIME header of the part at this path.
    Mime(PartPath),
}

impl Section {
    pub fn path(&self) -> &[NonZeroU32] {
        match self {
            Self::Part(p) | Self::Header(p) | Self::Text(p) | Self::Mime(p) => p,
            Self::HeaderFields { path, .. } => path,
        }
    }
}

/// Shape of a message part: its type, encoding and children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyStructure {
    pub media_type: String,
    pub subtype: String,
    pub params: Vec<(String, String)>,
    pub encoding: String,
    pub size: u32,
    /// Line count of text parts and encapsulated messages.
    pub lines: Option<u32>,
    /// Children of a multipart, or the body of an encapsulated message.
    pub parts: Vec<BodyStructure>,
}

impl BodyStructure {
    pub fn is_multipart(&self) -> bool {
        self.media_type == "multipart"
    }

    /// Child `n`, 1-based.
    pub fn sub_part(&self, n: NonZeroU32) -> Option<&BodyStructure> {
        self.parts.get(n.get() as usize - 1)
    }
}

fn parse(raw: &[u8]) -> Result<AnyPart<'_>> {
    let (_, msg) = eml_codec::parse_message(raw)
        .map_err(|_| Error::MalformedMessage("unparsable message".into()))?;
    Ok(AnyPart::Msg(msg))
}

/// Bytes of `raw` designated by `section`.
pub fn extract(raw: &[u8], section: &Section) -> Result<Vec<u8>> {
    let root = parse(raw)?;
    let part = subset(&root, section.path())?;
    let bytes = match section {
        Section::Part(_) => match part {
            AnyPart::Txt(p) => p.body.to_vec(),
            AnyPart::Bin(p) => p.body.to_vec(),
            AnyPart::Msg(p) => p.raw_part.to_vec(),
            AnyPart::Mult(p) => p.raw_part_outer.to_vec(),
        },
        Section::Header(path) => message_of(part, path)?.raw_headers.to_vec(),
        Section::Text(path) => message_of(part, path)?.raw_body.to_vec(),
        Section::HeaderFields { path, names, negate } => {
            header_fields(header_mime(message_of(part, path)?), names, *negate)
        }
        Section::Mime(path) if path.is_empty() => {
            return Err(Error::NoSuchPart("MIME needs a part number".into()))
        }
        Section::Mime(_) => part.mime().raw.to_vec(),
    };
    Ok(bytes)
}

/// Structure of the body of the message in `raw`.
pub fn body_structure(raw: &[u8]) -> Result<BodyStructure> {
    match parse(raw)? {
        AnyPart::Msg(msg) => Ok(structure(&msg.child)),
        other => Ok(structure(&other)),
    }
}

/// Walks down `path`. An encapsulated message is transparent, and part 1
/// of a single part body is that body.
fn subset<'a>(part: &'a AnyPart<'a>, path: &[NonZeroU32]) -> Result<&'a AnyPart<'a>> {
    let (first, rest) = match path.split_first() {
        None => return Ok(part),
        Some(split) => split,
    };
    match part {
        AnyPart::Mult(m) => {
            let child = m
                .children
                .get(first.get() as usize - 1)
                .ok_or_else(|| Error::NoSuchPart(display_path(path)))?;
            subset(child, rest)
        }
        AnyPart::Msg(m) => subset(&m.child, path),
        AnyPart::Txt(_) | AnyPart::Bin(_) if first.get() == 1 && rest.is_empty() => Ok(part),
        _ => Err(Error::NoSuchPart(display_path(path))),
    }
}

fn message_of<'a>(
    part: &'a AnyPart<'a>,
    path: &[NonZeroU32],
) -> Result<&'a eml_codec::part::composite::Message<'a>> {
    part.as_message().ok_or_else(|| {
        Error::NoSuchPart(format!("{} is not a message", display_path(path)))
    })
}

/// Header fields of a message live on the MIME view of its body.
fn header_mime<'a>(msg: &'a eml_codec::part::composite::Message<'a>) -> &'a NaiveMIME<'a> {
    msg.child.mime()
}

fn header_fields(mime: &NaiveMIME<'_>, names: &[String], negate: bool) -> Vec<u8> {
    let index = names
        .iter()
        .map(|n| n.as_bytes().to_ascii_lowercase())
        .collect::<HashSet<_>>();

    let mut buffer = mime
        .kv
        .iter()
        .filter_map(|field| match field {
            header::Field::Good(header::Kv2(k, v)) => Some((k, v)),
            _ => None,
        })
        .filter(|(k, _)| index.contains(&k.to_ascii_lowercase()) ^ negate)
        .fold(vec![], |mut acc, (k, v)| {
            acc.extend_from_slice(k);
            acc.extend_from_slice(b": ");
            acc.extend_from_slice(v);
            acc.extend_from_slice(b"\r\n");
            acc
        });
    buffer.extend_from_slice(b"\r\n");
    buffer
}

fn structure(part: &AnyPart<'_>) -> BodyStructure {
    let mime = part.mime();
    let (default_type, default_sub, size, lines, parts) = match part {
        AnyPart::Txt(p) => ("text", "plain", p.body.len(), Some(nol(p.body)), vec![]),
        AnyPart::Bin(p) => ("application", "octet-stream", p.body.len(), None, vec![]),
        AnyPart::Msg(p) => (
            "message",
            "rfc822",
            p.raw_part.len(),
            Some(nol(p.raw_part)),
            vec![structure(&p.child)],
        ),
        AnyPart::Mult(p) => (
            "multipart",
            "mixed",
            p.raw_part_outer.len(),
            None,
            p.children.iter().map(structure).collect(),
        ),
    };

    let (media_type, subtype, mut params) = match &mime.ctype {
        Some(ct) => (
            lossy_lower(ct.main),
            lossy_lower(ct.sub),
            ct.params
                .iter()
                .map(|p| (lossy_lower(p.name), p.value.to_string()))
                .collect::<Vec<_>>(),
        ),
        None => (default_type.to_string(), default_sub.to_string(), vec![]),
    };
    if media_type == "text" && !params.iter().any(|(k, _)| k == "charset") {
        params.push(("charset".into(), "us-ascii".into()));
    }

    BodyStructure {
        media_type,
        subtype,
        params,
        encoding: mime.transfer_encoding.to_string(),
        size: u32::try_from(size).unwrap_or(u32::MAX),
        lines,
        parts,
    }
}

fn lossy_lower(v: &[u8]) -> String {
    String::from_utf8_lossy(v).to_ascii_lowercase()
}

// Number of lines
fn nol(input: &[u8]) -> u32 {
    input
        .iter()
        .filter(|x| **x == b'\n')
        .count()
        .try_into()
        .unwrap_or(u32::MAX)
}

fn display_path(path: &[NonZeroU32]) -> String {
    path.iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(".")
}
