#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::{watch, Notify};

use coffre_collections::account::Account;
use coffre_user::config::{
    AccountConfig, Config, DedupPolicy, IncomingConfig, RetryPolicy, StorageConfig,
};
use coffre_user::cryptoblob::CryptoKeys;
use coffre_user::storage::in_memory::{MemBuilder, MemStore};
use coffre_user::storage::*;

pub const USER: &str = "alice";

pub fn config(keys: &CryptoKeys, dedup: DedupPolicy) -> Config {
    Config {
        account: AccountConfig {
            user_id: USER.into(),
            inbox: "INBOX".into(),
            hierarchy_delimiter: "/".into(),
            master_key: keys.master_b64(),
            secret_key: keys.secret_b64(),
        },
        storage: StorageConfig::InMemory,
        incoming: IncomingConfig {
            poll_interval_secs: 1,
            dedup,
        },
        serializer: RetryPolicy {
            max_conflict_retries: 8,
            max_unavailable_retries: 5,
            backoff_base_ms: 1,
        },
    }
}

/// An account on its own in-memory store. Keep the sender alive for as
/// long as the account is used.
pub struct TestAccount {
    pub account: Arc<Account>,
    pub keys: CryptoKeys,
    pub exit: watch::Sender<bool>,
}

pub async fn open_on(store: Store, keys: &CryptoKeys, dedup: DedupPolicy) -> TestAccount {
    open_with(store, keys, config(keys, dedup)).await
}

pub async fn open_with(store: Store, keys: &CryptoKeys, config: Config) -> TestAccount {
    let (exit, must_exit) = watch::channel(false);
    let account = Account::open(&config, store, must_exit)
        .await
        .expect("account opens");
    TestAccount {
        account,
        keys: keys.clone(),
        exit,
    }
}

pub async fn open_account() -> TestAccount {
    open_on(Arc::new(MemStore::new()), &CryptoKeys::init(), DedupPolicy::None).await
}

pub fn message(subject: &str) -> Vec<u8> {
    format!(
        "From: bob@example.tld\r\nTo: alice@example.tld\r\nSubject: {}\r\n\r\nHello, this is {}.\r\n",
        subject, subject
    )
    .into_bytes()
}

// ---- fault injection ----

struct Fault {
    shard_contains: String,
    error: StorageError,
    remaining: u32,
}

enum PauseOn {
    Rows(String),
    Blob(String),
}

struct Pause {
    on: PauseOn,
    reached: Arc<Notify>,
    gate: Arc<Notify>,
}

/// A fetch held in the middle of an operation.
pub struct Paused {
    reached: Arc<Notify>,
    gate: Arc<Notify>,
}

impl Paused {
    /// Waits until the fetch is held.
    pub async fn reached(&self) {
        self.reached.notified().await
    }

    pub fn release(&self) {
        self.gate.notify_one()
    }
}

/// An in-memory store failing the next row inserts whose shard contains a
/// given pattern, and able to hold one fetch until told to go on. Used to
/// simulate write races, outages, writes lost in flight and readers
/// overtaken by a writer.
pub struct FaultyStore {
    inner: MemStore,
    faults: Mutex<Vec<Fault>>,
    pauses: Mutex<Vec<Pause>>,
}

impl FaultyStore {
    pub fn new() -> Arc<Self> {
        Self::on(MemBuilder::new().store())
    }

    /// Wraps a store sharing its data with others of the same builder.
    pub fn on(inner: MemStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            faults: Mutex::new(vec![]),
            pauses: Mutex::new(vec![]),
        })
    }

    /// Holds the next row fetch on a shard containing `shard_contains`.
    pub fn pause_row_fetch(&self, shard_contains: &str) -> Paused {
        self.pause(PauseOn::Rows(shard_contains.to_string()))
    }

    /// Holds the next fetch of a blob whose key contains `key_contains`.
    pub fn pause_blob_fetch(&self, key_contains: &str) -> Paused {
        self.pause(PauseOn::Blob(key_contains.to_string()))
    }

    fn pause(&self, on: PauseOn) -> Paused {
        let (reached, gate) = (Arc::new(Notify::new()), Arc::new(Notify::new()));
        self.pauses.lock().unwrap().push(Pause {
            on,
            reached: reached.clone(),
            gate: gate.clone(),
        });
        Paused { reached, gate }
    }

    async fn hold(&self, matches: impl Fn(&PauseOn) -> bool) {
        let pause = {
            let mut pauses = self.pauses.lock().unwrap();
            match pauses.iter().position(|p| matches(&p.on)) {
                Some(i) => pauses.remove(i),
                None => return,
            }
        };
        pause.reached.notify_one();
        pause.gate.notified().await;
    }

    pub fn inject(&self, shard_contains: &str, error: StorageError, times: u32) {
        self.faults.lock().unwrap().push(Fault {
            shard_contains: shard_contains.to_string(),
            error,
            remaining: times,
        });
    }

    pub fn clear(&self) {
        self.faults.lock().unwrap().clear();
    }

    fn should_fail(&self, shard: &str) -> Option<StorageError> {
        let mut faults = self.faults.lock().unwrap();
        let fault = faults
            .iter_mut()
            .find(|f| f.remaining > 0 && shard.contains(&f.shard_contains))?;
        fault.remaining -= 1;
        Some(fault.error)
    }
}

#[async_trait]
impl IStore for FaultyStore {
    async fn row_fetch<'a>(&self, select: &Selector<'a>) -> Result<Vec<RowVal>, StorageError> {
        let shard = match select {
            Selector::Range { shard, .. } | Selector::Prefix { shard, .. } => shard.to_string(),
            Selector::Single(row_ref) => row_ref.uid.shard.clone(),
            Selector::List(rows) => rows.first().map(|r| r.uid.shard.clone()).unwrap_or_default(),
        };
        self.hold(|on| matches!(on, PauseOn::Rows(p) if shard.contains(p.as_str())))
            .await;
        self.inner.row_fetch(select).await
    }
    async fn row_rm<'a>(&self, select: &Selector<'a>) -> Result<(), StorageError> {
        self.inner.row_rm(select).await
    }
    async fn row_rm_single(&self, entry: &RowRef) -> Result<(), StorageError> {
        self.inner.row_rm_single(entry).await
    }
    async fn row_insert(&self, value: RowVal) -> Result<RowRef, StorageError> {
        if let Some(e) = self.should_fail(&value.row_ref.uid.shard) {
            return Err(e);
        }
        self.inner.row_insert(value).await
    }
    fn watch(&self, prefix: &str) -> BoxStream<'static, StoreEvent> {
        self.inner.watch(prefix)
    }
    async fn blob_fetch(&self, blob_ref: &BlobRef) -> Result<BlobVal, StorageError> {
        self.hold(|on| matches!(on, PauseOn::Blob(p) if blob_ref.0.contains(p.as_str())))
            .await;
        self.inner.blob_fetch(blob_ref).await
    }
    async fn blob_insert(&self, blob_val: BlobVal) -> Result<(), StorageError> {
        self.inner.blob_insert(blob_val).await
    }
    async fn blob_copy(&self, src: &BlobRef, dst: &BlobRef) -> Result<(), StorageError> {
        self.inner.blob_copy(src, dst).await
    }
    async fn blob_list(&self, prefix: &str) -> Result<Vec<BlobRef>, StorageError> {
        self.inner.blob_list(prefix).await
    }
    async fn blob_rm(&self, blob_ref: &BlobRef) -> Result<(), StorageError> {
        self.inner.blob_rm(blob_ref).await
    }
}
