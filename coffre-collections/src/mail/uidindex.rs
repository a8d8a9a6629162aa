use std::num::NonZeroU32;
use std::sync::Arc;

use im::{HashMap, OrdMap, OrdSet};

use coffre_user::storage::RowRef;

use crate::error::{Error, Result};
use crate::mail::record::MessageRecord;
use crate::mail::sequence::SequenceSet;
use crate::unique_ident::UniqueIdent;

pub type ImapUid = NonZeroU32;
pub type ImapUidvalidity = NonZeroU32;
pub type Flag = String;

/// A stored message together with the revision of its row.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub row_ref: RowRef,
    pub record: MessageRecord,
}

/// Point-in-time view of the live messages of a mailbox, rebuilt from the
/// store. It is immutable once built: mutations happen in the store, and a
/// new index is built afterwards. `im` collections keep clones cheap so a
/// snapshot can be shared between a fetch and the search running on it.
#[derive(Clone)]
pub struct UidIndex {
    // Source of trust
    pub table: OrdMap<ImapUid, Arc<IndexEntry>>,

    // Indexes optimized for queries
    pub idx_by_ident: HashMap<UniqueIdent, ImapUid>,
    pub idx_by_flag: FlagIndex,

    // Counters
    pub uidvalidity: ImapUidvalidity,
    pub uidnext: ImapUid,
}

impl UidIndex {
    /// `uid_floor` is the persisted lower bound of `uidnext`; the real
    /// value also accounts for messages above it.
    pub fn new(uidvalidity: ImapUidvalidity, uid_floor: ImapUid) -> Self {
        Self {
            table: OrdMap::new(),
            idx_by_ident: HashMap::new(),
            idx_by_flag: FlagIndex::new(),
            uidvalidity,
            uidnext: uid_floor,
        }
    }

    pub fn build(
        uidvalidity: ImapUidvalidity,
        uid_floor: ImapUid,
        entries: impl IntoIterator<Item = IndexEntry>,
    ) -> Self {
        entries
            .into_iter()
            .fold(Self::new(uidvalidity, uid_floor), |mut idx, e| {
                idx.reg_message(e);
                idx
            })
    }

    fn reg_message(&mut self, entry: IndexEntry) {
        let uid = entry.record.uid;
        if let Some(next) = uid.checked_add(1) {
            if next > self.uidnext {
                self.uidnext = next;
            }
        }

        self.idx_by_ident.insert(entry.record.ident, uid);
        self.idx_by_flag.insert(uid, &entry.record.flags);
        self.table.insert(uid, Arc::new(entry));
    }

    pub fn exists(&self) -> u32 {
        self.table.len() as u32
    }

    pub fn get(&self, uid: ImapUid) -> Option<&Arc<IndexEntry>> {
        self.table.get(&uid)
    }

    pub fn uid_of(&self, ident: &UniqueIdent) -> Option<ImapUid> {
        self.idx_by_ident.get(ident).copied()
    }

    pub fn largest_uid(&self) -> Option<ImapUid> {
        self.table.get_max().map(|(uid, _)| *uid)
    }

    /// The (msn, entry) pairs designated by `sequence_set`, in ascending
    /// order. UIDs that do not exist are skipped; a message sequence number
    /// that does not exist is an error.
    pub fn fetch(&self, sequence_set: &SequenceSet, by_uid: bool) -> Result<Vec<MailIndex>> {
        let mail_vec = self.table.iter().collect::<Vec<_>>();

        let mut mails = vec![];
        if by_uid {
            let largest = match self.largest_uid() {
                Some(l) => l.get(),
                None => return Ok(vec![]),
            };

            let mut i = 0;
            for uid in sequence_set.iter(largest) {
                while mail_vec.get(i).map(|(u, _)| u.get() < uid).unwrap_or(false) {
                    i += 1;
                }
                match mail_vec.get(i) {
                    Some((u, entry)) if u.get() == uid => mails.push(MailIndex {
                        i: NonZeroU32::new(i as u32 + 1).ok_or(Error::NoSuchMessage(0))?,
                        uid: **u,
                        entry: (*entry).clone(),
                    }),
                    Some(_) => (),
                    None => break,
                }
            }
        } else {
            if mail_vec.is_empty() {
                return Err(Error::NoSuchMessage(0));
            }

            for i in sequence_set.iter(mail_vec.len() as u32) {
                let (uid, entry) = mail_vec
                    .get(i as usize - 1)
                    .ok_or(Error::NoSuchMessage(i))?;
                mails.push(MailIndex {
                    i: NonZeroU32::new(i).ok_or(Error::NoSuchMessage(i))?,
                    uid: **uid,
                    entry: (*entry).clone(),
                });
            }
        }

        Ok(mails)
    }

    /// Every live message, ascending.
    pub fn all(&self) -> Vec<MailIndex> {
        self.table
            .iter()
            .enumerate()
            .filter_map(|(i, (uid, entry))| {
                Some(MailIndex {
                    i: NonZeroU32::new(i as u32 + 1)?,
                    uid: *uid,
                    entry: Arc::clone(entry),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct MailIndex {
    pub i: NonZeroU32,
    pub uid: ImapUid,
    pub entry: Arc<IndexEntry>,
}

impl MailIndex {
    pub fn is_flag_set(&self, flag: &str) -> bool {
        self.entry.record.has_flag(flag)
    }
}

// ---- FlagIndex implementation ----

#[derive(Clone, Default)]
pub struct FlagIndex(HashMap<Flag, OrdSet<ImapUid>>);

impl FlagIndex {
    fn new() -> Self {
        Self(HashMap::new())
    }
    fn insert(&mut self, uid: ImapUid, flags: &[Flag]) {
        flags.iter().for_each(|flag| {
            self.0
                .entry(flag.clone())
                .or_insert_with(OrdSet::new)
                .insert(uid);
        });
    }

    pub fn get(&self, f: &str) -> Option<&OrdSet<ImapUid>> {
        self.0.get(f)
    }

    pub fn count(&self, f: &str) -> u32 {
        self.get(f).map(|s| s.len() as u32).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::record::{DELETED, SEEN};
    use crate::unique_ident::gen_ident;

    fn entry(uid: u32, flags: &[&str]) -> IndexEntry {
        IndexEntry {
            row_ref: RowRef::new("s", &format!("uid/{:010}", uid)),
            record: MessageRecord {
                uid: NonZeroU32::new(uid).unwrap(),
                ident: gen_ident(),
                flags: flags.iter().map(|f| f.to_string()).collect(),
                internal_date: 0,
                size: 10,
                headers: vec![],
                content: String::new(),
                content_hash: String::new(),
            },
        }
    }

    fn nz(v: u32) -> NonZeroU32 {
        NonZeroU32::new(v).unwrap()
    }

    #[test]
    fn test_uidindex() {
        let idx = UidIndex::build(
            nz(1),
            nz(1),
            vec![entry(4, &[DELETED]), entry(1, &[SEEN]), entry(2, &[SEEN, DELETED])],
        );

        assert_eq!(idx.exists(), 3);
        assert_eq!(idx.uidnext, nz(5));
        assert!(idx.get(nz(4)).is_some());
        assert!(idx.get(nz(3)).is_none());
        assert_eq!(idx.idx_by_flag.count(DELETED), 2);
        assert_eq!(idx.idx_by_flag.count("$Junk"), 0);

        // floor above every live uid wins
        let idx = UidIndex::build(nz(1), nz(9), vec![entry(4, &[])]);
        assert_eq!(idx.uidnext, nz(9));
    }

    #[test]
    fn fetch_by_uid_and_msn() {
        let idx = UidIndex::build(nz(1), nz(1), vec![entry(1, &[]), entry(4, &[]), entry(7, &[])]);

        let by_uid = idx.fetch(&"2:*".parse().unwrap(), true).unwrap();
        assert_eq!(
            by_uid.iter().map(|m| (m.i.get(), m.uid.get())).collect::<Vec<_>>(),
            vec![(2, 4), (3, 7)]
        );

        // unknown uids are skipped silently
        assert!(idx.fetch(&"5:6".parse().unwrap(), true).unwrap().is_empty());

        let by_msn = idx.fetch(&"1,3".parse().unwrap(), false).unwrap();
        assert_eq!(
            by_msn.iter().map(|m| m.uid.get()).collect::<Vec<_>>(),
            vec![1, 7]
        );
        assert_eq!(
            idx.fetch(&"4".parse().unwrap(), false).unwrap_err(),
            Error::NoSuchMessage(4)
        );

        let empty = UidIndex::new(nz(1), nz(1));
        assert!(empty.fetch(&"1:*".parse().unwrap(), true).unwrap().is_empty());
        assert!(empty.fetch(&"1".parse().unwrap(), false).is_err());
    }
}
