use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::num::NonZeroU32;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{broadcast, Mutex};

use coffre_user::storage::BlobRef;
use coffre_user::timestamp::now_msec;

use crate::docstore::{Doc, DocStore, MESSAGE_SORT_PREFIX};
use crate::error::{Error, Result};
use crate::mail::mime::{self, BodyStructure, Section};
use crate::mail::namespace::MailboxRecord;
use crate::mail::query::{FetchedMessage, FetchedSection, QueryScope};
use crate::mail::record::{self, MessageRecord, StoredMessage, RECENT, SEEN};
use crate::mail::search::{Criteria, SearchKey};
use crate::mail::sequence::SequenceSet;
use crate::mail::uidindex::{Flag, ImapUid, ImapUidvalidity, IndexEntry, MailIndex, UidIndex};
use crate::serializer::{Lane, WriteSerializer};
use crate::unique_ident::{gen_ident, UniqueIdent};

const EVENT_BUFFER: usize = 256;

/// What sessions having this mailbox selected are told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxEvent {
    /// The mailbox now holds this many messages.
    Exists(u32),
    FlagsChanged { uid: ImapUid, flags: Vec<Flag> },
    /// Sequence number the message had before the removal started.
    Expunged(NonZeroU32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagOp {
    Add,
    Remove,
    Replace,
}

impl FlagOp {
    /// `\Recent` is owned by the server: a replace keeps it as it was.
    pub fn apply(&self, current: &[Flag], flags: &[Flag]) -> Vec<Flag> {
        let mut res: Vec<Flag> = match self {
            Self::Add => current
                .iter()
                .chain(flags.iter().filter(|f| !current.contains(f)))
                .cloned()
                .collect(),
            Self::Remove => current
                .iter()
                .filter(|f| !flags.contains(f))
                .cloned()
                .collect(),
            Self::Replace => {
                let keep_recent = current.iter().any(|f| f == RECENT);
                flags
                    .iter()
                    .filter(|f| *f != RECENT || keep_recent)
                    .cloned()
                    .chain(keep_recent.then(|| RECENT.to_string()))
                    .collect()
            }
        };
        let mut seen = BTreeSet::new();
        res.retain(|f| seen.insert(f.clone()));
        res
    }
}

/// What a session learns when it selects a mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub exists: u32,
    pub recent: u32,
    pub flags: Vec<Flag>,
    pub permanent_flags: Vec<Flag>,
    pub uidvalidity: ImapUidvalidity,
    pub uidnext: ImapUid,
    pub unseen: Option<NonZeroU32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub messages: u32,
    pub recent: u32,
    pub uidnext: ImapUid,
    pub uidvalidity: ImapUidvalidity,
    pub unseen: u32,
}

/// A handle on one mailbox of the account, shared by every session that
/// selects it. Reads go straight to the store, writes are submitted to the
/// mailbox's lane of the write serializer.
pub struct Mailbox {
    core: Arc<Core>,
    serializer: Arc<WriteSerializer>,
}

struct Core {
    id: UniqueIdent,
    docs: DocStore,
    events: broadcast::Sender<MailboxEvent>,
    /// The mailbox as last announced to the sessions of this process.
    view: Mutex<View>,
}

impl Mailbox {
    pub(crate) async fn open(
        id: UniqueIdent,
        docs: DocStore,
        serializer: Arc<WriteSerializer>,
    ) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let core = Arc::new(Core {
            id,
            docs,
            events,
            view: Mutex::new(View::default()),
        });
        let (_, idx) = core.load_state().await?;
        *core.view.lock().await = View::of(&idx);
        Ok(Self { core, serializer })
    }

    pub fn id(&self) -> UniqueIdent {
        self.core.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MailboxEvent> {
        self.core.events.subscribe()
    }

    // ---- reads ----

    pub async fn record(&self) -> Result<MailboxRecord> {
        Ok(self.core.load_record().await?.value)
    }

    /// Live messages as stored right now.
    pub async fn index(&self) -> Result<UidIndex> {
        Ok(self.core.load_state().await?.1)
    }

    pub async fn summary(&self) -> Result<Summary> {
        let (rec, idx) = self.core.load_state().await?;
        let unseen = idx
            .all()
            .into_iter()
            .find(|m| !m.is_flag_set(SEEN))
            .map(|m| m.i);
        let mut permanent_flags = rec
            .value
            .flags
            .iter()
            .filter(|f| *f != RECENT)
            .cloned()
            .collect::<Vec<_>>();
        permanent_flags.push("\\*".to_string());

        Ok(Summary {
            exists: idx.exists(),
            recent: idx.idx_by_flag.count(RECENT),
            flags: rec.value.flags.clone(),
            permanent_flags,
            uidvalidity: idx.uidvalidity,
            uidnext: idx.uidnext,
            unseen,
        })
    }

    pub async fn status(&self) -> Result<Status> {
        let idx = self.index().await?;
        let seen = idx.idx_by_flag.count(SEEN);
        Ok(Status {
            messages: idx.exists(),
            recent: idx.idx_by_flag.count(RECENT),
            uidnext: idx.uidnext,
            uidvalidity: idx.uidvalidity,
            unseen: idx.exists().saturating_sub(seen),
        })
    }

    pub async fn fetch(
        &self,
        sequence_set: &SequenceSet,
        by_uid: bool,
        scope: QueryScope,
    ) -> Result<Vec<FetchedMessage>> {
        let idx = self.index().await?;
        let mails = idx.fetch(sequence_set, by_uid)?;

        let mut res = Vec::with_capacity(mails.len());
        for m in mails {
            let rec = &m.entry.record;
            let content = match scope {
                QueryScope::Full => match self.core.content_of(&m).await? {
                    Some(content) => Some(content),
                    None => continue,
                },
                _ => None,
            };
            res.push(FetchedMessage {
                msn: m.i,
                uid: m.uid,
                flags: rec.flags.clone(),
                internal_date: rec.internal_date,
                size: rec.size,
                headers: (scope >= QueryScope::Partial).then(|| rec.headers.clone()),
                content,
            });
        }
        Ok(res)
    }

    /// UIDs (or sequence numbers) of the matching messages, ascending.
    pub async fn search(&self, key: &SearchKey, by_uid: bool) -> Result<Vec<u32>> {
        let idx = self.index().await?;
        let mails = idx.all();
        let exists = idx.exists();
        let largest_uid = idx.largest_uid().map(|u| u.get()).unwrap_or(0);

        let crit = Criteria(key);
        let (mut kept, to_fetch) = crit.filter_on_idx(&mails, exists);
        for m in to_fetch {
            let content = match self.core.content_of(m).await? {
                Some(content) => content,
                None => continue,
            };
            if crit.is_keep_on_query(m, exists, largest_uid, Some(&content)) {
                kept.push(m);
            }
        }
        kept.sort_by_key(|m| m.uid);

        Ok(kept
            .into_iter()
            .map(|m| if by_uid { m.uid.get() } else { m.i.get() })
            .collect())
    }

    /// The `section` of every designated message. The header of the
    /// message itself is served from its row, anything else needs the
    /// content.
    pub async fn fetch_section(
        &self,
        sequence_set: &SequenceSet,
        by_uid: bool,
        section: &Section,
    ) -> Result<Vec<FetchedSection>> {
        let idx = self.index().await?;
        let mut res = vec![];
        for m in idx.fetch(sequence_set, by_uid)? {
            let body = match section {
                Section::Header(path) if path.is_empty() => m.entry.record.headers.clone(),
                _ => match self.core.content_of(&m).await? {
                    Some(content) => mime::extract(&content, section)?,
                    None => continue,
                },
            };
            res.push(FetchedSection {
                msn: m.i,
                uid: m.uid,
                body,
            });
        }
        Ok(res)
    }

    pub async fn body_structure(
        &self,
        sequence_set: &SequenceSet,
        by_uid: bool,
    ) -> Result<Vec<(ImapUid, BodyStructure)>> {
        let idx = self.index().await?;
        let mut res = vec![];
        for m in idx.fetch(sequence_set, by_uid)? {
            if let Some(content) = self.core.content_of(&m).await? {
                res.push((m.uid, mime::body_structure(&content)?));
            }
        }
        Ok(res)
    }

    // ---- writes ----

    /// Stores `content` as a new message and returns its UID.
    pub async fn append(
        &self,
        content: Vec<u8>,
        flags: Vec<Flag>,
        internal_date: Option<u64>,
    ) -> Result<(ImapUidvalidity, ImapUid)> {
        self.append_as(gen_ident(), content, flags, internal_date)
            .await
    }

    /// Same as `append` with a caller chosen identifier: appending the same
    /// `ident` twice stores the message once and returns the same UID.
    pub(crate) async fn append_as(
        &self,
        ident: UniqueIdent,
        content: Vec<u8>,
        flags: Vec<Flag>,
        internal_date: Option<u64>,
    ) -> Result<(ImapUidvalidity, ImapUid)> {
        record::validate_flags(&flags)?;
        let headers = record::parse_headers(&content)?;
        let content_hash = record::content_hash(&content);
        let internal_date = internal_date.unwrap_or_else(now_msec);
        let size = content.len() as u64;
        let content = Arc::new(content);

        let core = self.core.clone();
        self.serializer
            .submit(Lane::Mailbox(core.id), move || {
                let core = core.clone();
                let content = content.clone();
                let flags = flags.clone();
                let headers = headers.clone();
                let content_hash = content_hash.clone();
                async move {
                    let (rec, idx) = core.load_state().await?;
                    core.catch_up(&idx, &BTreeSet::new()).await;
                    if let Some(uid) = idx.uid_of(&ident) {
                        return Ok((idx.uidvalidity, uid));
                    }

                    let blob = core.docs.content_blob(&ident);
                    core.docs.blob_put_sealed(blob.clone(), &content).await?;
                    core.extend_flags(&rec, &flags).await?;

                    let uid = idx.uidnext;
                    let msg = MessageRecord {
                        uid,
                        ident,
                        flags,
                        internal_date,
                        size,
                        headers,
                        content: blob.0,
                        content_hash,
                    };
                    core.put_new_message(&msg).await?;
                    tracing::debug!(mailbox=%core.id, uid=uid.get(), "message appended");

                    let added = core.view.lock().await.add([(uid, msg.flags)]);
                    core.publish(added);
                    Ok((idx.uidvalidity, uid))
                }
            })
            .await
    }

    /// Applies `op` with `flags` to every designated message. Returns the
    /// resulting flags of each of them, ascending.
    pub async fn set_flags(
        &self,
        sequence_set: &SequenceSet,
        by_uid: bool,
        op: FlagOp,
        flags: Vec<Flag>,
        silent: bool,
    ) -> Result<Vec<(ImapUid, Vec<Flag>)>> {
        record::validate_flags(&flags)?;
        let sequence_set = sequence_set.clone();

        // Writes done by an interrupted run are seen as no-ops by the next.
        let changed = Arc::new(Mutex::new(BTreeSet::<ImapUid>::new()));

        let core = self.core.clone();
        let changed_log = changed.clone();
        let res = self
            .serializer
            .submit(Lane::Mailbox(core.id), move || {
                let core = core.clone();
                let sequence_set = sequence_set.clone();
                let flags = flags.clone();
                let changed = changed_log.clone();
                async move {
                    let (rec, idx) = core.load_state().await?;
                    core.catch_up(&idx, &BTreeSet::new()).await;
                    let targets = idx.fetch(&sequence_set, by_uid)?;
                    if op != FlagOp::Remove && !targets.is_empty() {
                        core.extend_flags(&rec, &flags).await?;
                    }

                    let mut res = Vec::with_capacity(targets.len());
                    for m in targets {
                        let current = &m.entry.record;
                        let new_flags = op.apply(&current.flags, &flags);
                        if !same_flags(&current.flags, &new_flags) {
                            let mut updated = current.clone();
                            updated.flags = new_flags.clone();
                            core.docs
                                .put(m.entry.row_ref.clone(), &StoredMessage::from(&updated))
                                .await?;
                            core.view.lock().await.set_flags(m.uid, &new_flags);
                            changed.lock().await.insert(m.uid);
                        }
                        res.push((m.uid, new_flags));
                    }

                    if !silent {
                        let changed = changed.lock().await;
                        for (uid, flags) in res.iter().filter(|(uid, _)| changed.contains(uid)) {
                            let _ = core.events.send(MailboxEvent::FlagsChanged {
                                uid: *uid,
                                flags: flags.clone(),
                            });
                        }
                    }
                    Ok(res)
                }
            })
            .await?;
        Ok(res)
    }

    /// Removes every message flagged `\Deleted`, returning their UIDs.
    pub async fn expunge(&self) -> Result<Vec<ImapUid>> {
        self.remove_where(Removal::Deleted).await
    }

    /// Removes the given messages whatever their flags.
    pub async fn remove(&self, uids: Vec<ImapUid>) -> Result<Vec<ImapUid>> {
        self.remove_where(Removal::Uids(uids.into_iter().collect()))
            .await
    }

    /// Drops `\Recent` from every message, without notifying anyone.
    pub async fn clear_recent(&self) -> Result<()> {
        let idx = self.index().await?;
        if idx.idx_by_flag.count(RECENT) == 0 {
            return Ok(());
        }
        self.set_flags(
            &SequenceSet::all(),
            true,
            FlagOp::Remove,
            vec![RECENT.to_string()],
            true,
        )
        .await?;
        Ok(())
    }

    /// Copies the designated messages into `dest`, flagged `\Recent` there.
    /// A message whose content is already in `dest` is not stored twice.
    /// Returns (source uid, destination uid) pairs, ascending on the source.
    pub async fn copy_to(
        &self,
        sequence_set: &SequenceSet,
        by_uid: bool,
        dest: &Mailbox,
    ) -> Result<Vec<(ImapUid, ImapUid)>> {
        let src_idx = self.index().await?;
        let planned = src_idx
            .fetch(sequence_set, by_uid)?
            .into_iter()
            .map(|m| (m.entry.record.clone(), gen_ident()))
            .collect::<Vec<_>>();
        if planned.is_empty() {
            return Ok(vec![]);
        }

        let core = dest.core.clone();
        self.serializer
            .submit(Lane::Mailbox(core.id), move || {
                let core = core.clone();
                let planned = planned.clone();
                async move {
                    let (rec, idx) = core.load_state().await?;
                    core.catch_up(&idx, &BTreeSet::new()).await;
                    let by_hash = idx
                        .all()
                        .into_iter()
                        .map(|m| (m.entry.record.content_hash.clone(), m.uid))
                        .collect::<HashMap<_, _>>();

                    let all_flags = planned
                        .iter()
                        .flat_map(|(src, _)| src.flags.iter().cloned())
                        .collect::<Vec<_>>();
                    core.extend_flags(&rec, &all_flags).await?;

                    let mut uidnext = idx.uidnext;
                    let mut added = vec![];
                    let mut res = Vec::with_capacity(planned.len());
                    for (src, ident) in planned {
                        if let Some(uid) = idx.uid_of(&ident) {
                            res.push((src.uid, uid));
                            continue;
                        }
                        if let Some(uid) = by_hash.get(&src.content_hash) {
                            res.push((src.uid, *uid));
                            continue;
                        }

                        let blob = core.docs.content_blob(&ident);
                        core.docs
                            .blob_copy(&BlobRef(src.content.clone()), &blob)
                            .await?;
                        let msg = MessageRecord {
                            uid: uidnext,
                            ident,
                            flags: FlagOp::Add.apply(&src.flags, &[RECENT.to_string()]),
                            content: blob.0,
                            ..src.clone()
                        };
                        core.put_new_message(&msg).await?;
                        res.push((src.uid, uidnext));
                        added.push((uidnext, msg.flags));
                        uidnext = uidnext
                            .checked_add(1)
                            .ok_or_else(|| Error::MalformedRecord("uid space exhausted".into()))?;
                    }

                    let announced = core.view.lock().await.add(added);
                    core.publish(announced);
                    Ok(res)
                }
            })
            .await
    }

    /// Copies then removes from this mailbox, emitting `Expunged` here.
    pub async fn move_to(
        &self,
        sequence_set: &SequenceSet,
        by_uid: bool,
        dest: &Mailbox,
    ) -> Result<Vec<(ImapUid, ImapUid)>> {
        if dest.id() == self.id() {
            let idx = self.index().await?;
            return Ok(idx
                .fetch(sequence_set, by_uid)?
                .into_iter()
                .map(|m| (m.uid, m.uid))
                .collect());
        }

        let pairs = self.copy_to(sequence_set, by_uid, dest).await?;
        self.remove(pairs.iter().map(|(src, _)| *src).collect())
            .await?;
        Ok(pairs)
    }

    async fn remove_where(&self, removal: Removal) -> Result<Vec<ImapUid>> {
        // UIDs deleted so far, by this run or an interrupted one. They stay
        // in the view until the removal is announced as a whole.
        let removed = Arc::new(Mutex::new(BTreeSet::<ImapUid>::new()));

        let core = self.core.clone();
        let removal = Arc::new(removal);
        let run_removed = removed.clone();
        self.serializer
            .submit(Lane::Mailbox(core.id), move || {
                let core = core.clone();
                let removal = removal.clone();
                let removed = run_removed.clone();
                async move {
                    let (rec, idx) = core.load_state().await?;
                    let mut removed = removed.lock().await;
                    core.catch_up(&idx, &removed).await;

                    let targets = idx
                        .all()
                        .into_iter()
                        .filter(|m| removal.selects(m))
                        .collect::<Vec<_>>();

                    if !targets.is_empty() && rec.value.uid_floor < idx.uidnext {
                        let mut raised = rec.value.clone();
                        raised.uid_floor = idx.uidnext;
                        core.docs.put(rec.row_ref.clone(), &raised).await?;
                    }

                    for m in targets.iter() {
                        let mut row = m.entry.row_ref.clone();
                        row.revision = None;
                        core.docs.delete(&row).await?;
                        removed.insert(m.uid);
                    }
                    for m in targets.iter() {
                        let blob = BlobRef(m.entry.record.content.clone());
                        if let Err(e) = core.docs.blob_rm(&blob).await {
                            tracing::warn!(mailbox=%core.id, uid=m.uid.get(), err=%e, "content blob left behind");
                        }
                    }

                    let uids = removed.iter().copied().collect::<Vec<_>>();
                    let events = core.view.lock().await.expunge(&uids);
                    tracing::debug!(mailbox=%core.id, count=uids.len(), "messages removed");
                    core.publish(events);
                    Ok(uids)
                }
            })
            .await
    }

    /// Destroys every message row and content blob of this mailbox. Used
    /// once its record is gone or turned into a placeholder.
    pub(crate) async fn purge(
        id: UniqueIdent,
        docs: DocStore,
        serializer: &WriteSerializer,
    ) -> Result<()> {
        serializer
            .submit(Lane::Mailbox(id), move || {
                let docs = docs.clone();
                async move {
                    let shard = docs.messages_shard(&id);
                    let mut rows = docs.query::<StoredMessage>(shard.clone(), MESSAGE_SORT_PREFIX.into());
                    while let Some(row) = rows.next().await {
                        let content = match row {
                            Ok(doc) => doc.value.content,
                            Err(Error::MalformedRecord(_)) => None,
                            Err(e) => return Err(e),
                        };
                        if let Some(content) = content {
                            docs.blob_rm(&BlobRef(content)).await?;
                        }
                    }
                    docs.delete_shard(&shard).await?;
                    tracing::info!(mailbox=%id, "mailbox content destroyed");
                    Ok(())
                }
            })
            .await
    }

    /// Compares the store with what the sessions were last told, and
    /// tells them the difference. Runs on the mailbox lane so it never
    /// interleaves with a local write.
    pub(crate) async fn refresh(&self) -> Result<()> {
        let core = self.core.clone();
        self.serializer
            .submit(Lane::Mailbox(core.id), move || {
                let core = core.clone();
                async move {
                    let (_, idx) = core.load_state().await?;
                    core.catch_up(&idx, &BTreeSet::new()).await;
                    Ok(())
                }
            })
            .await
    }
}

impl Core {
    async fn load_record(&self) -> Result<Doc<MailboxRecord>> {
        match self.docs.get::<MailboxRecord>(&self.docs.mailbox_row(&self.id)).await {
            Ok(doc) if doc.value.noselect => Err(Error::MailboxNotFound(doc.value.path)),
            Ok(doc) => Ok(doc),
            Err(Error::NotFound) => Err(Error::MailboxNotFound(self.id.to_string())),
            Err(e) => Err(e),
        }
    }

    /// The record and the index of the mailbox. Message rows are read
    /// before the record: a removal raises `uid_floor` before deleting
    /// rows, so a removed UID is seen either as a row or in the floor.
    async fn load_state(&self) -> Result<(Doc<MailboxRecord>, UidIndex)> {
        let (entries, malformed_floor) = self.load_messages().await?;
        let rec = self.load_record().await?;
        let uid_floor = match malformed_floor {
            Some(f) => rec.value.uid_floor.max(f),
            None => rec.value.uid_floor,
        };
        let idx = UidIndex::build(rec.value.uidvalidity, uid_floor, entries);
        Ok((rec, idx))
    }

    /// Undecodable message rows are left out of the live set, but their
    /// UIDs are still never handed out again: a floor above the highest of
    /// them is returned along with the entries.
    async fn load_messages(&self) -> Result<(Vec<IndexEntry>, Option<ImapUid>)> {
        let mut entries = vec![];
        let mut uid_floor: Option<ImapUid> = None;

        let shard = self.docs.messages_shard(&self.id);
        let mut rows =
            self.docs
                .query_with_keys::<StoredMessage>(shard, MESSAGE_SORT_PREFIX.into());
        while let Some(row) = rows.next().await {
            let (row_ref, decoded) = row?;
            let row_uid = uid_from_sort(&row_ref.uid.sort);
            let record = decoded.and_then(MessageRecord::try_from).and_then(|r| {
                match row_uid {
                    Some(uid) if uid == r.uid => Ok(r),
                    _ => Err(Error::MalformedRecord(format!(
                        "uid {} stored under {}",
                        r.uid, row_ref.uid.sort
                    ))),
                }
            });
            match record {
                Ok(record) => entries.push(IndexEntry { row_ref, record }),
                Err(e) => {
                    tracing::warn!(mailbox=%self.id, row=%row_ref, err=%e, "skipping message");
                    if let Some(next) = row_uid.and_then(|u| u.checked_add(1)) {
                        uid_floor = uid_floor.max(Some(next));
                    }
                }
            }
        }
        Ok((entries, uid_floor))
    }

    /// Content of `m`, or `None` if the message was removed since the
    /// index it comes from was read.
    async fn content_of(&self, m: &MailIndex) -> Result<Option<Vec<u8>>> {
        let blob = BlobRef(m.entry.record.content.clone());
        match self.docs.blob_get_sealed(&blob).await {
            Ok(content) => Ok(Some(content)),
            Err(Error::NotFound) => {
                let mut row = m.entry.row_ref.clone();
                row.revision = None;
                match self.docs.get_opt::<StoredMessage>(&row).await? {
                    None => {
                        tracing::debug!(mailbox=%self.id, uid=m.uid.get(), "message removed while reading it");
                        Ok(None)
                    }
                    Some(_) => Err(Error::NotFound),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Records keywords seen for the first time in the mailbox flags.
    async fn extend_flags(&self, rec: &Doc<MailboxRecord>, flags: &[Flag]) -> Result<()> {
        let mut missing = flags
            .iter()
            .filter(|f| *f != RECENT && !rec.value.flags.contains(f))
            .cloned()
            .collect::<Vec<_>>();
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort();
        missing.dedup();

        let mut updated = rec.value.clone();
        updated.flags.extend(missing);
        self.docs.put(rec.row_ref.clone(), &updated).await?;
        Ok(())
    }

    /// The single write that makes a message exist. It fails with a
    /// conflict if the UID is already taken.
    async fn put_new_message(&self, msg: &MessageRecord) -> Result<()> {
        let row = self.docs.message_row(&self.id, msg.uid);
        self.docs.put(row, &StoredMessage::from(msg)).await?;
        Ok(())
    }

    /// Announces what changed in the store since the view was last
    /// updated, leaving the UIDs of `pending` alone.
    async fn catch_up(&self, idx: &UidIndex, pending: &BTreeSet<ImapUid>) {
        let events = self.view.lock().await.sync(idx, pending);
        self.publish(events);
    }

    fn publish(&self, events: Vec<MailboxEvent>) {
        for evt in events {
            // nobody listening is fine
            let _ = self.events.send(evt);
        }
    }
}

/// UIDs and flags the sessions of this process were told about, ascending.
#[derive(Default)]
struct View(BTreeMap<ImapUid, Vec<Flag>>);

impl View {
    fn of(idx: &UidIndex) -> Self {
        Self(
            idx.table
                .iter()
                .map(|(uid, entry)| (*uid, entry.record.flags.clone()))
                .collect(),
        )
    }

    fn msn(&self, uid: ImapUid) -> Option<NonZeroU32> {
        let pos = self.0.keys().position(|u| *u == uid)?;
        NonZeroU32::new(pos as u32 + 1)
    }

    fn sync(&mut self, idx: &UidIndex, pending: &BTreeSet<ImapUid>) -> Vec<MailboxEvent> {
        let gone = self
            .0
            .keys()
            .filter(|uid| idx.get(**uid).is_none() && !pending.contains(uid))
            .copied()
            .collect::<Vec<_>>();
        let mut events = self.expunge(&gone);

        let mut added = false;
        for (uid, entry) in idx.table.iter() {
            let flags = &entry.record.flags;
            match self.0.get_mut(uid) {
                Some(known) if !same_flags(known, flags) => {
                    *known = flags.clone();
                    events.push(MailboxEvent::FlagsChanged {
                        uid: *uid,
                        flags: flags.clone(),
                    });
                }
                Some(_) => (),
                None => {
                    self.0.insert(*uid, flags.clone());
                    added = true;
                }
            }
        }
        if added {
            events.push(MailboxEvent::Exists(self.0.len() as u32));
        }
        events
    }

    fn add(&mut self, messages: impl IntoIterator<Item = (ImapUid, Vec<Flag>)>) -> Vec<MailboxEvent> {
        let mut added = false;
        for (uid, flags) in messages {
            added |= self.0.insert(uid, flags).is_none();
        }
        match added {
            true => vec![MailboxEvent::Exists(self.0.len() as u32)],
            false => vec![],
        }
    }

    fn set_flags(&mut self, uid: ImapUid, flags: &[Flag]) {
        if let Some(known) = self.0.get_mut(&uid) {
            *known = flags.to_vec();
        }
    }

    /// `Expunged` with the sequence numbers the messages had before any of
    /// them was removed, ascending.
    fn expunge(&mut self, uids: &[ImapUid]) -> Vec<MailboxEvent> {
        let mut msns = uids.iter().filter_map(|u| self.msn(*u)).collect::<Vec<_>>();
        msns.sort();
        for uid in uids {
            self.0.remove(uid);
        }
        msns.into_iter().map(MailboxEvent::Expunged).collect()
    }
}

enum Removal {
    Deleted,
    Uids(BTreeSet<ImapUid>),
}

impl Removal {
    fn selects(&self, m: &MailIndex) -> bool {
        match self {
            Self::Deleted => m.is_flag_set(record::DELETED),
            Self::Uids(uids) => uids.contains(&m.uid),
        }
    }
}

fn uid_from_sort(sort: &str) -> Option<ImapUid> {
    sort.strip_prefix(MESSAGE_SORT_PREFIX)?
        .parse::<u32>()
        .ok()
        .and_then(NonZeroU32::new)
}

fn same_flags(a: &[Flag], b: &[Flag]) -> bool {
    a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
}
