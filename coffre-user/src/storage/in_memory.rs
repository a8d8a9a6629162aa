use std::collections::BTreeMap;
use std::ops::Bound::{self, Excluded, Included, Unbounded};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::storage::*;

const EVENT_BUFFER: usize = 1024;

#[derive(Clone, Debug)]
struct InternalRowVal {
    revision: u64,
    data: Vec<u8>,
}

type ArcRow = Arc<RwLock<BTreeMap<String, BTreeMap<String, InternalRowVal>>>>;
type ArcBlob = Arc<RwLock<BTreeMap<String, Vec<u8>>>>;

/// Builds handles on one shared in-memory database.
/// Every store built from the same builder sees the same data.
#[derive(Clone, Debug)]
pub struct MemBuilder {
    row: ArcRow,
    blob: ArcBlob,
    revision: Arc<AtomicU64>,
    events: broadcast::Sender<StoreEvent>,
}

impl MemBuilder {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            row: Arc::new(RwLock::new(BTreeMap::new())),
            blob: Arc::new(RwLock::new(BTreeMap::new())),
            revision: Arc::new(AtomicU64::new(0)),
            events,
        })
    }

    pub fn store(&self) -> MemStore {
        MemStore {
            row: self.row.clone(),
            blob: self.blob.clone(),
            revision: self.revision.clone(),
            events: self.events.clone(),
        }
    }
}

#[async_trait]
impl IBuilder for MemBuilder {
    async fn build(&self) -> Result<Store, StorageError> {
        Ok(Arc::new(self.store()))
    }
}

pub struct MemStore {
    row: ArcRow,
    blob: ArcBlob,
    revision: Arc<AtomicU64>,
    events: broadcast::Sender<StoreEvent>,
}

impl MemStore {
    /// A standalone store, not shared with any builder.
    pub fn new() -> Self {
        MemBuilder::new().store()
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn notify(&self, evt: StoreEvent) {
        // No receiver is not an error: nobody is watching yet.
        let _ = self.events.send(evt);
    }

    fn row_rm_single_sync(&self, entry: &RowRef) -> Result<bool, StorageError> {
        let mut store = self.row.write().or(Err(StorageError::Internal))?;
        let shard = match store.get_mut(&entry.uid.shard) {
            Some(s) => s,
            None => return Ok(false),
        };
        match (shard.get(&entry.uid.sort), entry.revision) {
            (None, _) => Ok(false),
            (Some(cur), Some(rev)) if cur.revision != rev => Err(StorageError::RevisionConflict),
            (Some(_), _) => {
                shard.remove(&entry.uid.sort);
                Ok(true)
            }
        }
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

fn prefix_last_bound(prefix: &str) -> Bound<String> {
    let mut sort_end = prefix.to_string();
    match sort_end.pop() {
        None => Unbounded,
        Some(ch) => match char::from_u32(ch as u32 + 1) {
            Some(nc) => {
                sort_end.push(nc);
                Excluded(sort_end)
            }
            None => Unbounded,
        },
    }
}

fn to_row_val(shard: &str, sort: &str, v: &InternalRowVal) -> RowVal {
    RowVal::new(
        RowRef::new(shard, sort).with_revision(v.revision),
        v.data.clone(),
    )
}

#[async_trait]
impl IStore for MemStore {
    async fn row_fetch<'a>(&self, select: &Selector<'a>) -> Result<Vec<RowVal>, StorageError> {
        tracing::trace!(select=%select, command="row_fetch");
        let store = self.row.read().or(Err(StorageError::Internal))?;

        match select {
            Selector::Range {
                shard,
                sort_begin,
                sort_end,
            } => Ok(store
                .get(*shard)
                .map(|bt| {
                    bt.range((
                        Included(sort_begin.to_string()),
                        Excluded(sort_end.to_string()),
                    ))
                    .map(|(k, v)| to_row_val(shard, k, v))
                    .collect::<Vec<_>>()
                })
                .unwrap_or_default()),
            Selector::List(rlist) => Ok(rlist
                .iter()
                .filter_map(|row_ref| {
                    store
                        .get(&row_ref.uid.shard)
                        .and_then(|bt| bt.get(&row_ref.uid.sort))
                        .map(|v| to_row_val(&row_ref.uid.shard, &row_ref.uid.sort, v))
                })
                .collect::<Vec<_>>()),
            Selector::Prefix { shard, sort_prefix } => {
                let last_bound = prefix_last_bound(sort_prefix);
                Ok(store
                    .get(*shard)
                    .map(|bt| {
                        bt.range((Included(sort_prefix.to_string()), last_bound))
                            .map(|(k, v)| to_row_val(shard, k, v))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default())
            }
            Selector::Single(row_ref) => store
                .get(&row_ref.uid.shard)
                .and_then(|bt| bt.get(&row_ref.uid.sort))
                .map(|v| vec![to_row_val(&row_ref.uid.shard, &row_ref.uid.sort, v)])
                .ok_or(StorageError::NotFound),
        }
    }

    async fn row_rm<'a>(&self, select: &Selector<'a>) -> Result<(), StorageError> {
        tracing::trace!(select=%select, command="row_rm");
        let values = match select {
            Selector::Single(row_ref) => vec![(*row_ref).clone()],
            Selector::List(rlist) => rlist.clone(),
            other => self
                .row_fetch(other)
                .await?
                .into_iter()
                .map(|v| RowRef {
                    uid: v.row_ref.uid,
                    revision: None,
                })
                .collect(),
        };

        for v in values.iter() {
            if self.row_rm_single_sync(v)? {
                self.notify(StoreEvent::RowDeleted(v.uid.clone()));
            }
        }
        Ok(())
    }

    async fn row_rm_single(&self, entry: &RowRef) -> Result<(), StorageError> {
        tracing::trace!(entry=%entry, command="row_rm_single");
        if self.row_rm_single_sync(entry)? {
            self.notify(StoreEvent::RowDeleted(entry.uid.clone()));
        }
        Ok(())
    }

    async fn row_insert(&self, value: RowVal) -> Result<RowRef, StorageError> {
        tracing::trace!(entry=%value.row_ref, command="row_insert");
        let new_ref = {
            let mut store = self.row.write().or(Err(StorageError::Internal))?;
            let shard = store
                .entry(value.row_ref.uid.shard.clone())
                .or_insert(BTreeMap::new());

            match (shard.get(&value.row_ref.uid.sort), value.row_ref.revision) {
                (None, None) => (),
                (Some(cur), Some(rev)) if cur.revision == rev => (),
                _ => return Err(StorageError::RevisionConflict),
            }

            let revision = self.next_revision();
            shard.insert(
                value.row_ref.uid.sort.clone(),
                InternalRowVal {
                    revision,
                    data: value.value,
                },
            );
            value.row_ref.with_revision(revision)
        };

        self.notify(StoreEvent::RowPut(new_ref.clone()));
        Ok(new_ref)
    }

    fn watch(&self, prefix: &str) -> BoxStream<'static, StoreEvent> {
        let prefix = prefix.to_string();
        BroadcastStream::new(self.events.subscribe())
            .filter_map(move |evt| {
                let keep = match evt {
                    Ok(e) if e.matches(&prefix) => Some(e),
                    Ok(_) => None,
                    Err(e) => {
                        tracing::debug!(err=%e, "watcher lagged behind, events dropped");
                        None
                    }
                };
                futures::future::ready(keep)
            })
            .boxed()
    }

    async fn blob_fetch(&self, blob_ref: &BlobRef) -> Result<BlobVal, StorageError> {
        tracing::trace!(entry=%blob_ref, command="blob_fetch");
        let store = self.blob.read().or(Err(StorageError::Internal))?;
        store
            .get(&blob_ref.0)
            .map(|v| BlobVal::new(blob_ref.clone(), v.clone()))
            .ok_or(StorageError::NotFound)
    }

    async fn blob_insert(&self, blob_val: BlobVal) -> Result<(), StorageError> {
        tracing::trace!(entry=%blob_val.blob_ref, command="blob_insert");
        {
            let mut store = self.blob.write().or(Err(StorageError::Internal))?;
            store.insert(blob_val.blob_ref.0.clone(), blob_val.value);
        }
        self.notify(StoreEvent::BlobPut(blob_val.blob_ref));
        Ok(())
    }

    async fn blob_copy(&self, src: &BlobRef, dst: &BlobRef) -> Result<(), StorageError> {
        tracing::trace!(src=%src, dst=%dst, command="blob_copy");
        {
            let mut store = self.blob.write().or(Err(StorageError::Internal))?;
            let blob_src = store.get(&src.0).ok_or(StorageError::NotFound)?.clone();
            store.insert(dst.0.clone(), blob_src);
        }
        self.notify(StoreEvent::BlobPut(dst.clone()));
        Ok(())
    }

    async fn blob_list(&self, prefix: &str) -> Result<Vec<BlobRef>, StorageError> {
        tracing::trace!(prefix = prefix, command = "blob_list");
        let store = self.blob.read().or(Err(StorageError::Internal))?;
        let last_bound = prefix_last_bound(prefix);
        let blist = store
            .range((Included(prefix.to_string()), last_bound))
            .map(|(k, _)| BlobRef(k.to_string()))
            .collect::<Vec<_>>();
        Ok(blist)
    }

    async fn blob_rm(&self, blob_ref: &BlobRef) -> Result<(), StorageError> {
        tracing::trace!(entry=%blob_ref, command="blob_rm");
        let mut store = self.blob.write().or(Err(StorageError::Internal))?;
        store.remove(&blob_ref.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_checks_revision() {
        let store = MemStore::new();
        let row = RowRef::new("mbox", "uid/0000000001");

        let r1 = store
            .row_insert(RowVal::new(row.clone(), b"a".to_vec()))
            .await
            .unwrap();
        // create-only insert on an existing row
        assert_eq!(
            store.row_insert(RowVal::new(row.clone(), b"b".to_vec())).await,
            Err(StorageError::RevisionConflict)
        );

        let r2 = store
            .row_insert(RowVal::new(r1.clone(), b"c".to_vec()))
            .await
            .unwrap();
        assert!(r2.revision > r1.revision);

        // stale revision
        assert_eq!(
            store.row_insert(RowVal::new(r1, b"d".to_vec())).await,
            Err(StorageError::RevisionConflict)
        );

        let got = store.row_fetch(&Selector::Single(&row)).await.unwrap();
        assert_eq!(got[0].value, b"c".to_vec());
        assert_eq!(got[0].row_ref.revision, r2.revision);
    }

    #[tokio::test]
    async fn prefix_and_range_are_ordered() {
        let store = MemStore::new();
        for sort in ["uid/0000000003", "uid/0000000001", "other", "uid/0000000002"] {
            store
                .row_insert(RowVal::new(RowRef::new("s", sort), vec![]))
                .await
                .unwrap();
        }

        let got = store
            .row_fetch(&Selector::Prefix {
                shard: "s",
                sort_prefix: "uid/",
            })
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.row_ref.uid.sort)
            .collect::<Vec<_>>();
        assert_eq!(
            got,
            vec!["uid/0000000001", "uid/0000000002", "uid/0000000003"]
        );

        let got = store
            .row_fetch(&Selector::Range {
                shard: "s",
                sort_begin: "uid/0000000002",
                sort_end: "uid/0000000003",
            })
            .await
            .unwrap();
        assert_eq!(got.len(), 1);

        store
            .row_rm(&Selector::Prefix {
                shard: "s",
                sort_prefix: "uid/",
            })
            .await
            .unwrap();
        let left = store
            .row_fetch(&Selector::Prefix {
                shard: "s",
                sort_prefix: "",
            })
            .await
            .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].row_ref.uid.sort, "other");
    }

    #[tokio::test]
    async fn watch_filters_on_prefix() {
        let builder = MemBuilder::new();
        let store = builder.build().await.unwrap();
        let mut events = store.watch("alice/incoming/");

        store
            .blob_insert(BlobVal::new(BlobRef("bob/incoming/1".into()), vec![]))
            .await
            .unwrap();
        store
            .blob_insert(BlobVal::new(BlobRef("alice/incoming/2".into()), vec![1]))
            .await
            .unwrap();

        let evt = events.next().await.unwrap();
        assert_eq!(evt, StoreEvent::BlobPut(BlobRef("alice/incoming/2".into())));

        // another handle from the same builder shares the data
        let other = builder.build().await.unwrap();
        let listed = other.blob_list("alice/").await.unwrap();
        assert_eq!(listed, vec![BlobRef("alice/incoming/2".into())]);
    }
}
