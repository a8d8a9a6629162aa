use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Weak};

use anyhow::Context;
use futures::StreamExt;
use tokio::sync::watch;

use coffre_user::config::Config;
use coffre_user::cryptoblob::CryptoKeys;
use coffre_user::storage::{RowRef, Store, StoreEvent};
use coffre_user::timestamp::now_msec;

use crate::docstore::{Doc, DocStore};
use crate::error::{Error, Result};
use crate::mail::mailbox::{Mailbox, Status};
use crate::mail::namespace::{normalize_path, MailboxRecord, MailboxTree, INBOX};
use crate::mail::record::{ANSWERED, DELETED, DRAFT, FLAGGED, SEEN};
use crate::mail::uidindex::ImapUidvalidity;
use crate::serializer::{Lane, WriteSerializer};
use crate::unique_ident::{gen_ident, UniqueIdent};

/// Everything an account needs at runtime. Handed explicitly to sessions
/// and background tasks.
pub struct Account {
    pub user_id: String,
    pub keys: CryptoKeys,
    inbox: String,
    delimiter: char,
    docs: DocStore,
    serializer: Arc<WriteSerializer>,
    must_exit: watch::Receiver<bool>,
    mailboxes: std::sync::Mutex<HashMap<UniqueIdent, Weak<Mailbox>>>,
}

impl Account {
    /// Opens the account described by `config` on `store`, creating INBOX
    /// and the delivery mailbox if needed, and starts the change watcher.
    /// Fails if the store cannot be reached.
    pub async fn open(
        config: &Config,
        store: Store,
        must_exit: watch::Receiver<bool>,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        let keys = config.account.crypto_keys()?;
        let delimiter = config.account.delimiter()?;
        let inbox = normalize_path(&config.account.inbox, delimiter)
            .context("account.inbox is not a valid mailbox path")?;

        let account = Arc::new(Self {
            user_id: config.account.user_id.clone(),
            docs: DocStore::new(&config.account.user_id, store, keys.master.clone()),
            keys,
            inbox,
            delimiter,
            serializer: WriteSerializer::new(config.serializer, must_exit.clone()),
            must_exit: must_exit.clone(),
            mailboxes: std::sync::Mutex::new(HashMap::new()),
        });

        for path in [INBOX.to_string(), account.inbox.clone()] {
            match account.create(&path).await {
                Ok(_) => tracing::info!(user=%account.user_id, mailbox=%path, "mailbox created"),
                Err(Error::MailboxExists(_)) => (),
                Err(e) => return Err(e).context("unable to initialize the account mailboxes"),
            }
        }

        tokio::spawn(watch_mailboxes(
            Arc::downgrade(&account),
            account.docs.clone(),
            must_exit,
        ));
        Ok(account)
    }

    /// Where incoming mail is filed.
    pub fn inbox(&self) -> &str {
        &self.inbox
    }

    pub(crate) fn docs(&self) -> &DocStore {
        &self.docs
    }

    pub(crate) fn serializer(&self) -> &WriteSerializer {
        &self.serializer
    }

    pub fn must_exit(&self) -> watch::Receiver<bool> {
        self.must_exit.clone()
    }

    // ---- reads ----

    /// The mailbox tree as currently stored.
    pub async fn tree(&self) -> Result<MailboxTree> {
        load_tree(&self.docs, self.delimiter).await
    }

    /// Mailboxes matching a LIST reference and wildcard, by path.
    pub async fn list(&self, reference: &str, pattern: &str) -> Result<Vec<MailboxRecord>> {
        let tree = self.tree().await?;
        Ok(tree.list(reference, pattern).into_iter().cloned().collect())
    }

    /// Same as `list`, restricted to subscribed mailboxes.
    pub async fn lsub(&self, reference: &str, pattern: &str) -> Result<Vec<MailboxRecord>> {
        let tree = self.tree().await?;
        Ok(tree
            .list(reference, pattern)
            .into_iter()
            .filter(|mb| mb.subscribed)
            .cloned()
            .collect())
    }

    pub async fn status(&self, path: &str) -> Result<Status> {
        self.open_mailbox(path).await?.status().await
    }

    /// Opens an existing, selectable mailbox given its path. Every caller
    /// gets the same handle while one is alive, so they share its events.
    pub async fn open_mailbox(&self, path: &str) -> Result<Arc<Mailbox>> {
        let tree = self.tree().await?;
        let path = tree.normalize(path)?;
        let id = tree.get_selectable(&path)?.value.id;
        self.open_mailbox_by_id(id).await
    }

    pub(crate) async fn open_mailbox_by_id(&self, id: UniqueIdent) -> Result<Arc<Mailbox>> {
        if let Some(mb) = self.cached(&id) {
            return Ok(mb);
        }

        let mb = Arc::new(Mailbox::open(id, self.docs.clone(), self.serializer.clone()).await?);

        let mut cache = self.mailboxes.lock().map_err(|_| Error::Shutdown)?;
        if let Some(concurrent_mb) = cache.get(&id).and_then(Weak::upgrade) {
            drop(mb); // we worked for nothing but at least we didn't starve someone else
            Ok(concurrent_mb)
        } else {
            cache.retain(|_, handle| handle.strong_count() > 0);
            cache.insert(id, Arc::downgrade(&mb));
            Ok(mb)
        }
    }

    fn cached(&self, id: &UniqueIdent) -> Option<Arc<Mailbox>> {
        let cache = self.mailboxes.lock().ok()?;
        cache.get(id).and_then(Weak::upgrade)
    }

    // ---- tree mutations ----

    /// Creates the mailbox at `path` along with its missing parents.
    pub async fn create(&self, path: &str) -> Result<MailboxRecord> {
        let path = normalize_path(path, self.delimiter)?;
        let (docs, delimiter) = (self.docs.clone(), self.delimiter);
        self.serializer
            .submit(Lane::Tree, move || {
                let (docs, path) = (docs.clone(), path.clone());
                async move {
                    let tree = load_tree(&docs, delimiter).await?;
                    match tree.get(&path) {
                        Some(doc) if !doc.value.noselect => {
                            return Err(Error::MailboxExists(path))
                        }
                        Some(placeholder) => docs.delete(&placeholder.row_ref).await?,
                        None => (),
                    }
                    for parent in tree.ancestors(&path) {
                        if tree.get(&parent).is_none() {
                            insert_mailbox(&docs, &parent).await?;
                        }
                    }
                    insert_mailbox(&docs, &path).await
                }
            })
            .await
    }

    /// Deletes the mailbox at `path` and every message it holds. A mailbox
    /// with inferiors stays in the tree as a `\Noselect` placeholder.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let path = normalize_path(path, self.delimiter)?;
        if path == INBOX {
            return Err(Error::InvalidMailboxName(path));
        }

        let (docs, delimiter) = (self.docs.clone(), self.delimiter);
        let purge = self
            .serializer
            .submit(Lane::Tree, move || {
                let (docs, path) = (docs.clone(), path.clone());
                async move {
                    let tree = load_tree(&docs, delimiter).await?;
                    let doc = tree
                        .get(&path)
                        .ok_or_else(|| Error::MailboxNotFound(path.clone()))?;
                    let has_inferiors = tree.has_inferiors(&path);

                    if doc.value.noselect {
                        if has_inferiors {
                            return Err(Error::HasInferiors(path));
                        }
                        docs.delete(&doc.row_ref).await?;
                        return Ok(None);
                    }

                    if has_inferiors {
                        let mut placeholder = doc.value.clone();
                        placeholder.noselect = true;
                        docs.put(doc.row_ref.clone(), &placeholder).await?;
                    } else {
                        docs.delete(&doc.row_ref).await?;
                    }
                    Ok(Some(doc.value.id))
                }
            })
            .await?;

        if let Some(id) = purge {
            Mailbox::purge(id, self.docs.clone(), &self.serializer).await?;
            self.serializer.retire(Lane::Mailbox(id));
        }
        Ok(())
    }

    /// Renames `old` and its inferiors to `new`. Renaming INBOX moves its
    /// messages to `new` and leaves a fresh, empty INBOX behind.
    pub async fn rename(&self, old: &str, new: &str) -> Result<()> {
        let old = normalize_path(old, self.delimiter)?;
        let new = normalize_path(new, self.delimiter)?;
        if new == INBOX || new.starts_with(&format!("{}{}", old, self.delimiter)) {
            return Err(Error::InvalidMailboxName(new));
        }

        let (docs, delimiter) = (self.docs.clone(), self.delimiter);
        self.serializer
            .submit(Lane::Tree, move || {
                let (docs, old, new) = (docs.clone(), old.clone(), new.clone());
                async move {
                    let tree = load_tree(&docs, delimiter).await?;
                    let src = tree
                        .get(&old)
                        .ok_or_else(|| Error::MailboxNotFound(old.clone()))?;
                    if tree.get(&new).is_some() || tree.has_inferiors(&new) {
                        return Err(Error::MailboxExists(new));
                    }

                    let mut moved = vec![(src, new.clone())];
                    if old != INBOX {
                        for inferior in tree.inferiors(&old) {
                            let tail = &inferior.value.path[old.len()..];
                            moved.push((inferior, format!("{}{}", new, tail)));
                        }
                    }

                    for parent in tree.ancestors(&new) {
                        if tree.get(&parent).is_none() {
                            insert_mailbox(&docs, &parent).await?;
                        }
                    }
                    for (doc, path) in moved {
                        raise_uidvalidity(&docs, &path, doc.value.uidvalidity).await?;
                        let mut renamed = doc.value.clone();
                        renamed.path = path;
                        docs.put(doc.row_ref.clone(), &renamed).await?;
                    }
                    if old == INBOX {
                        insert_mailbox(&docs, INBOX).await?;
                    }
                    Ok(())
                }
            })
            .await
    }

    pub async fn subscribe(&self, path: &str) -> Result<()> {
        self.set_subscribed(path, true).await
    }

    pub async fn unsubscribe(&self, path: &str) -> Result<()> {
        self.set_subscribed(path, false).await
    }

    async fn set_subscribed(&self, path: &str, subscribed: bool) -> Result<()> {
        let path = normalize_path(path, self.delimiter)?;
        let (docs, delimiter) = (self.docs.clone(), self.delimiter);
        self.serializer
            .submit(Lane::Tree, move || {
                let (docs, path) = (docs.clone(), path.clone());
                async move {
                    let tree = load_tree(&docs, delimiter).await?;
                    let doc = tree.get_selectable(&path)?;
                    if doc.value.subscribed == subscribed {
                        return match subscribed {
                            true => Ok(()),
                            false => Err(Error::NotSubscribed(path)),
                        };
                    }
                    let mut updated = doc.value.clone();
                    updated.subscribed = subscribed;
                    docs.put(doc.row_ref.clone(), &updated).await?;
                    Ok(())
                }
            })
            .await
    }
}

async fn load_tree(docs: &DocStore, delimiter: char) -> Result<MailboxTree> {
    let mut records = vec![];
    let mut rows = docs.query::<MailboxRecord>(docs.mailboxes_shard(), String::new());
    while let Some(row) = rows.next().await {
        match row {
            Ok(doc) => records.push(doc),
            Err(Error::MalformedRecord(e)) => tracing::warn!(err=%e, "skipping mailbox"),
            Err(e) => return Err(e),
        }
    }
    Ok(MailboxTree::new(delimiter, records))
}

async fn insert_mailbox(docs: &DocStore, path: &str) -> Result<MailboxRecord> {
    let record = MailboxRecord {
        id: gen_ident(),
        path: path.to_string(),
        uidvalidity: next_uidvalidity(docs, path).await?,
        uid_floor: NonZeroU32::MIN,
        flags: [SEEN, ANSWERED, FLAGGED, DELETED, DRAFT]
            .iter()
            .map(|f| f.to_string())
            .collect(),
        subscribed: path == INBOX,
        noselect: false,
        created: now_msec(),
    };
    docs.put(docs.mailbox_row(&record.id), &record).await?;
    tracing::debug!(mailbox=%record.id, path=%record.path, uidvalidity=record.uidvalidity.get(), "mailbox inserted");
    Ok(record)
}

/// Consumes the next uidvalidity of `path`. The high-water mark survives
/// the mailbox so a recreated mailbox always gets a greater value.
async fn next_uidvalidity(docs: &DocStore, path: &str) -> Result<ImapUidvalidity> {
    let (row, current) = uidvalidity_of(docs, path).await?;
    let next = current
        .map(|v| v.checked_add(1))
        .unwrap_or(Some(NonZeroU32::MIN))
        .ok_or_else(|| Error::MalformedRecord(format!("uidvalidity exhausted for {}", path)))?;
    docs.put(row, &next.get()).await?;
    Ok(next)
}

async fn raise_uidvalidity(docs: &DocStore, path: &str, at_least: ImapUidvalidity) -> Result<()> {
    let (row, current) = uidvalidity_of(docs, path).await?;
    if current.map(|v| v < at_least).unwrap_or(true) {
        docs.put(row, &at_least.get()).await?;
    }
    Ok(())
}

async fn uidvalidity_of(docs: &DocStore, path: &str) -> Result<(RowRef, Option<ImapUidvalidity>)> {
    let row = RowRef::new(&docs.uidvalidity_shard(), path);
    Ok(match docs.get_opt::<u32>(&row).await? {
        Some(Doc { row_ref, value }) => (row_ref, NonZeroU32::new(value)),
        None => (row, None),
    })
}

/// Refreshes the mailbox handles currently alive on store notifications
/// about their message rows, so changes made by another process reach the
/// selected sessions.
async fn watch_mailboxes(
    account: Weak<Account>,
    docs: DocStore,
    mut must_exit: watch::Receiver<bool>,
) {
    let prefix = docs.messages_prefix();
    let mut events = docs.subscribe(&prefix);

    loop {
        let evt = tokio::select! {
            evt = events.next() => match evt {
                Some(evt) => evt,
                None => break,
            },
            res = must_exit.changed() => {
                if res.is_err() || *must_exit.borrow() {
                    break;
                }
                continue;
            }
        };

        let shard = match &evt {
            StoreEvent::RowPut(row) => &row.uid.shard,
            StoreEvent::RowDeleted(uid) => &uid.shard,
            StoreEvent::BlobPut(_) => continue,
        };
        let id = match shard.strip_prefix(&prefix).and_then(|s| s.parse::<UniqueIdent>().ok()) {
            Some(id) => id,
            None => continue,
        };

        let account = match account.upgrade() {
            Some(account) => account,
            None => break,
        };
        if let Some(mb) = account.cached(&id) {
            if let Err(e) = mb.refresh().await {
                tracing::warn!(mailbox=%id, err=%e, "unable to refresh mailbox after a store change");
            }
        }
    }
    tracing::info!("mailbox watcher exiting");
}
