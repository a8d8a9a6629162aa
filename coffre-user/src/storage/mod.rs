/*
 * Storage primitives consumed by the rest of coffre.
 *
 * The replicated document store is an external collaborator: we only rely
 * on revisioned rows (shard + sort key), change notifications on those rows,
 * and an opaque blob namespace. Everything above this layer works through
 * the `IStore` trait so a remote engine can be plugged next to the
 * in-memory one.
 */

pub mod in_memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    NotFound,
    Unavailable,
    RevisionConflict,
    Internal,
}
impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Storage Error: ")?;
        match self {
            Self::NotFound => f.write_str("Item not found"),
            Self::Unavailable => f.write_str("Store is temporarily unavailable"),
            Self::RevisionConflict => f.write_str("Revision does not match the stored one"),
            Self::Internal => f.write_str("An internal error occured"),
        }
    }
}
impl std::error::Error for StorageError {}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowUid {
    pub shard: String,
    pub sort: String,
}

/// A pointer to a row. `revision` is the token returned by the store the
/// last time the row was read or written.
///
/// On insert, `None` means the row must not exist yet and `Some(r)` means
/// the stored revision must still be `r`. On delete, `None` removes the row
/// unconditionally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRef {
    pub uid: RowUid,
    pub revision: Option<u64>,
}
impl std::fmt::Display for RowRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RowRef({}, {}, {:?})", self.uid.shard, self.uid.sort, self.revision)
    }
}

impl RowRef {
    pub fn new(shard: &str, sort: &str) -> Self {
        Self {
            uid: RowUid {
                shard: shard.to_string(),
                sort: sort.to_string(),
            },
            revision: None,
        }
    }
    pub fn with_revision(mut self, revision: u64) -> Self {
        self.revision = Some(revision);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RowVal {
    pub row_ref: RowRef,
    pub value: Vec<u8>,
}

impl RowVal {
    pub fn new(row_ref: RowRef, value: Vec<u8>) -> Self {
        Self { row_ref, value }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlobRef(pub String);
impl std::fmt::Display for BlobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlobRef({})", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct BlobVal {
    pub blob_ref: BlobRef,
    pub value: Vec<u8>,
}
impl BlobVal {
    pub fn new(blob_ref: BlobRef, value: Vec<u8>) -> Self {
        Self { blob_ref, value }
    }
}

#[derive(Debug)]
pub enum Selector<'a> {
    Range {
        shard: &'a str,
        sort_begin: &'a str,
        sort_end: &'a str,
    },
    List(Vec<RowRef>),
    Prefix {
        shard: &'a str,
        sort_prefix: &'a str,
    },
    Single(&'a RowRef),
}
impl<'a> std::fmt::Display for Selector<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Range {
                shard,
                sort_begin,
                sort_end,
            } => write!(f, "Range({}, [{}, {}[)", shard, sort_begin, sort_end),
            Self::List(list) => write!(f, "List({:?})", list),
            Self::Prefix { shard, sort_prefix } => write!(f, "Prefix({}, {})", shard, sort_prefix),
            Self::Single(row_ref) => write!(f, "Single({})", row_ref),
        }
    }
}

/// Change notification emitted by a store after a successful mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    RowPut(RowRef),
    RowDeleted(RowUid),
    BlobPut(BlobRef),
}

impl StoreEvent {
    /// Rows match on their shard, blobs on their key.
    pub fn matches(&self, prefix: &str) -> bool {
        match self {
            Self::RowPut(r) => r.uid.shard.starts_with(prefix),
            Self::RowDeleted(uid) => uid.shard.starts_with(prefix),
            Self::BlobPut(b) => b.0.starts_with(prefix),
        }
    }
}

#[async_trait]
pub trait IStore {
    async fn row_fetch<'a>(&self, select: &Selector<'a>) -> Result<Vec<RowVal>, StorageError>;
    async fn row_rm<'a>(&self, select: &Selector<'a>) -> Result<(), StorageError>;
    async fn row_rm_single(&self, entry: &RowRef) -> Result<(), StorageError>;
    async fn row_insert(&self, value: RowVal) -> Result<RowRef, StorageError>;

    /// Change notifications for every row whose shard, or blob whose key,
    /// starts with `prefix`. Notifications missed by a slow consumer are
    /// dropped: consumers re-read the store on wake-up.
    fn watch(&self, prefix: &str) -> BoxStream<'static, StoreEvent>;

    async fn blob_fetch(&self, blob_ref: &BlobRef) -> Result<BlobVal, StorageError>;
    async fn blob_insert(&self, blob_val: BlobVal) -> Result<(), StorageError>;
    async fn blob_copy(&self, src: &BlobRef, dst: &BlobRef) -> Result<(), StorageError>;
    async fn blob_list(&self, prefix: &str) -> Result<Vec<BlobRef>, StorageError>;
    async fn blob_rm(&self, blob_ref: &BlobRef) -> Result<(), StorageError>;
}

pub type Store = Arc<dyn IStore + Send + Sync>;

#[async_trait]
pub trait IBuilder: fmt::Debug {
    async fn build(&self) -> Result<Store, StorageError>;
}
pub type Builder = Arc<dyn IBuilder + Send + Sync>;
