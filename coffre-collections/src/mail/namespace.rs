use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::docstore::Doc;
use crate::error::{Error, Result};
use crate::mail::uidindex::{Flag, ImapUid, ImapUidvalidity};
use crate::unique_ident::UniqueIdent;

/// INBOX is the only mailbox that must always exist.
/// It is created automatically when the account is opened.
/// IMAP allows the user to rename INBOX to something else,
/// in this case all messages from INBOX are moved to a mailbox
/// with the new name and the INBOX mailbox still exists and is empty.
/// We move the underlying mailbox to the new name (the new name keeps
/// the id of the previous INBOX), and create a new empty INBOX.
pub const INBOX: &str = "INBOX";

/// Stored in the account's mailbox shard, keyed by `id`. Messages are keyed
/// by mailbox id too, so renaming a mailbox only rewrites this record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MailboxRecord {
    pub id: UniqueIdent,
    pub path: String,
    pub uidvalidity: ImapUidvalidity,
    /// Lower bound of uidnext, raised before any message is removed so
    /// UIDs of removed messages are never handed out again.
    pub uid_floor: ImapUid,
    /// Flags ever used in this mailbox, system flags included.
    pub flags: Vec<Flag>,
    pub subscribed: bool,
    /// Placeholder kept for the hierarchy after its mailbox was deleted.
    pub noselect: bool,
    pub created: u64,
}

/// The account's mailboxes indexed by path, as read at one point in time.
pub struct MailboxTree {
    delimiter: char,
    entries: BTreeMap<String, Doc<MailboxRecord>>,
}

impl MailboxTree {
    pub fn new(delimiter: char, records: impl IntoIterator<Item = Doc<MailboxRecord>>) -> Self {
        let entries = records
            .into_iter()
            .map(|doc| (doc.value.path.clone(), doc))
            .collect();
        Self { delimiter, entries }
    }

    /// Canonical form of a mailbox path given by a client: a trailing
    /// delimiter is dropped and INBOX is matched case insensitively.
    pub fn normalize(&self, path: &str) -> Result<String> {
        normalize_path(path, self.delimiter)
    }

    pub fn get(&self, path: &str) -> Option<&Doc<MailboxRecord>> {
        self.entries.get(path)
    }

    pub fn get_selectable(&self, path: &str) -> Result<&Doc<MailboxRecord>> {
        match self.get(path) {
            Some(doc) if !doc.value.noselect => Ok(doc),
            _ => Err(Error::MailboxNotFound(path.to_string())),
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &MailboxRecord> {
        self.entries.values().map(|doc| &doc.value)
    }

    /// Mailboxes strictly below `path` in the hierarchy.
    pub fn inferiors<'a>(&'a self, path: &str) -> impl Iterator<Item = &'a Doc<MailboxRecord>> + 'a {
        let prefix = format!("{}{}", path, self.delimiter);
        self.entries
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v)
    }

    pub fn has_inferiors(&self, path: &str) -> bool {
        self.inferiors(path).next().is_some()
    }

    /// Every proper ancestor of `path`, shallowest first.
    pub fn ancestors(&self, path: &str) -> Vec<String> {
        let mut res = vec![];
        let mut cur = String::new();
        let segments = path.split(self.delimiter).collect::<Vec<_>>();
        for seg in segments.iter().take(segments.len().saturating_sub(1)) {
            if !cur.is_empty() {
                cur.push(self.delimiter);
            }
            cur.push_str(seg);
            res.push(cur.clone());
        }
        res
    }

    /// Mailboxes matching the LIST `reference` and `pattern`, by path.
    pub fn list(&self, reference: &str, pattern: &str) -> Vec<&MailboxRecord> {
        let wildcard = if reference.is_empty() || pattern.starts_with(self.delimiter) {
            pattern.to_string()
        } else if reference.ends_with(self.delimiter) {
            format!("{}{}", reference, pattern)
        } else {
            format!("{}{}{}", reference, self.delimiter, pattern)
        };
        self.records()
            .filter(|mb| matches_wildcard(&wildcard, &mb.path, self.delimiter))
            .collect()
    }
}

pub fn normalize_path(path: &str, delimiter: char) -> Result<String> {
    let trimmed = path.strip_suffix(delimiter).unwrap_or(path);
    if trimmed.is_empty() || trimmed.split(delimiter).any(str::is_empty) {
        return Err(Error::InvalidMailboxName(path.to_string()));
    }
    if trimmed.contains(&['%', '*'][..]) {
        return Err(Error::InvalidMailboxName(path.to_string()));
    }

    let mut segments = trimmed.splitn(2, delimiter);
    let head = segments.next().unwrap_or_default();
    let head = if head.eq_ignore_ascii_case(INBOX) { INBOX } else { head };
    Ok(match segments.next() {
        Some(tail) => format!("{}{}{}", head, delimiter, tail),
        None => head.to_string(),
    })
}

/// `*` matches anything, `%` anything but the hierarchy delimiter.
pub fn matches_wildcard(wildcard: &str, name: &str, delimiter: char) -> bool {
    let wildcard = wildcard.chars().collect::<Vec<char>>();
    let name = name.chars().collect::<Vec<char>>();

    let mut matches = vec![vec![false; wildcard.len() + 1]; name.len() + 1];

    for i in 0..=name.len() {
        for j in 0..=wildcard.len() {
            matches[i][j] = (i == 0 && j == 0)
                || (j > 0
                    && matches[i][j - 1]
                    && (wildcard[j - 1] == '%' || wildcard[j - 1] == '*'))
                || (i > 0
                    && j > 0
                    && matches[i - 1][j - 1]
                    && wildcard[j - 1] == name[i - 1]
                    && wildcard[j - 1] != '%'
                    && wildcard[j - 1] != '*')
                || (i > 0
                    && j > 0
                    && matches[i - 1][j]
                    && (wildcard[j - 1] == '*'
                        || (wildcard[j - 1] == '%' && name[i - 1] != delimiter)));
        }
    }

    matches[name.len()][wildcard.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unique_ident::gen_ident;
    use coffre_user::storage::RowRef;
    use std::num::NonZeroU32;

    fn doc(path: &str) -> Doc<MailboxRecord> {
        Doc {
            row_ref: RowRef::new("alice/mailboxes", path),
            value: MailboxRecord {
                id: gen_ident(),
                path: path.to_string(),
                uidvalidity: NonZeroU32::MIN,
                uid_floor: NonZeroU32::MIN,
                flags: vec![],
                subscribed: false,
                noselect: false,
                created: 0,
            },
        }
    }

    #[test]
    fn test_wildcard_matches() {
        assert!(matches_wildcard("INBOX", "INBOX", '.'));
        assert!(matches_wildcard("*", "INBOX", '.'));
        assert!(matches_wildcard("%", "INBOX", '.'));
        assert!(!matches_wildcard("%", "Test.Azerty", '.'));
        assert!(!matches_wildcard("INBOX.*", "INBOX", '.'));
        assert!(matches_wildcard("Sent.*", "Sent.A", '.'));
        assert!(matches_wildcard("Sent.*", "Sent.A.B", '.'));
        assert!(!matches_wildcard("Sent.%", "Sent.A.B", '.'));
        assert!(matches_wildcard("Sent/%", "Sent/A", '/'));
    }

    #[test]
    fn paths_are_normalized() {
        assert_eq!(normalize_path("inbox", '/').unwrap(), "INBOX");
        assert_eq!(normalize_path("Inbox/Sub/", '/').unwrap(), "INBOX/Sub");
        assert_eq!(normalize_path("Archive", '/').unwrap(), "Archive");
        assert!(normalize_path("", '/').is_err());
        assert!(normalize_path("a//b", '/').is_err());
        assert!(normalize_path("a/*", '/').is_err());
    }

    #[test]
    fn hierarchy() {
        let tree = MailboxTree::new(
            '/',
            vec![doc("INBOX"), doc("Work"), doc("Work/2023"), doc("Work/2023/Q1"), doc("Workshop")],
        );
        assert_eq!(
            tree.inferiors("Work").map(|d| d.value.path.as_str()).collect::<Vec<_>>(),
            vec!["Work/2023", "Work/2023/Q1"]
        );
        assert!(!tree.has_inferiors("Workshop"));
        assert_eq!(tree.ancestors("a/b/c"), vec!["a".to_string(), "a/b".to_string()]);

        let top = tree.list("", "%").into_iter().map(|m| m.path.as_str()).collect::<Vec<_>>();
        assert_eq!(top, vec!["INBOX", "Work", "Workshop"]);
        let under = tree.list("Work", "*").into_iter().map(|m| m.path.as_str()).collect::<Vec<_>>();
        assert_eq!(under, vec!["Work/2023", "Work/2023/Q1"]);
    }
}
