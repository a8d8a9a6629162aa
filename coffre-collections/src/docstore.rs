//! Typed facade over the account's store.
//!
//! Rows are sealed with the account master key before they leave the
//! process and opened again on read; the remote side only ever sees
//! ciphertext. This module also owns the naming of every document, so no
//! other component builds shard or blob keys by hand.
//!
//! Nothing here retries: conflicts and outages are reported to the caller,
//! which is the write serializer for every mutation.

use futures::stream::{self, BoxStream, StreamExt};
use serde::{de::DeserializeOwned, Serialize};

use coffre_user::cryptoblob::{self, Key};
use coffre_user::storage::{self, BlobRef, BlobVal, RowRef, RowVal, Selector, Store, StoreEvent};

use crate::error::{Error, Result};
use crate::mail::uidindex::ImapUid;
use crate::unique_ident::UniqueIdent;

pub const MESSAGE_SORT_PREFIX: &str = "uid/";

/// A decoded document along with the revision it was read at.
#[derive(Debug, Clone)]
pub struct Doc<T> {
    pub row_ref: RowRef,
    pub value: T,
}

#[derive(Clone)]
pub struct DocStore {
    account: String,
    store: Store,
    key: Key,
}

impl DocStore {
    pub fn new(account: &str, store: Store, key: Key) -> Self {
        Self {
            account: account.to_string(),
            store,
            key,
        }
    }

    // ---- naming ----

    pub fn mailboxes_shard(&self) -> String {
        format!("{}/mailboxes", self.account)
    }

    pub fn mailbox_row(&self, mailbox: &UniqueIdent) -> RowRef {
        RowRef::new(&self.mailboxes_shard(), &mailbox.to_string())
    }

    pub fn uidvalidity_shard(&self) -> String {
        format!("{}/uidvalidity", self.account)
    }

    /// Common prefix of the message shards of every mailbox.
    pub fn messages_prefix(&self) -> String {
        format!("{}/mailbox/", self.account)
    }

    pub fn messages_shard(&self, mailbox: &UniqueIdent) -> String {
        format!("{}{}", self.messages_prefix(), mailbox)
    }

    pub fn message_row(&self, mailbox: &UniqueIdent, uid: ImapUid) -> RowRef {
        RowRef::new(
            &self.messages_shard(mailbox),
            &format!("{}{:010}", MESSAGE_SORT_PREFIX, uid),
        )
    }

    pub fn dedup_shard(&self) -> String {
        format!("{}/dedup", self.account)
    }

    pub fn content_blob(&self, message: &UniqueIdent) -> BlobRef {
        BlobRef(format!("{}/content/{}", self.account, message))
    }

    pub fn incoming_prefix(&self) -> String {
        format!("{}/incoming/", self.account)
    }

    pub fn incoming_blob(&self, item: &UniqueIdent) -> BlobRef {
        BlobRef(format!("{}{}", self.incoming_prefix(), item))
    }

    /// Items that can never be filed are moved under this prefix, out of
    /// the queue.
    pub fn incoming_failed_prefix(&self) -> String {
        format!("{}/incoming-failed/", self.account)
    }

    pub fn incoming_failed_blob(&self, item: &BlobRef) -> BlobRef {
        let name = item.0.strip_prefix(&self.incoming_prefix()).unwrap_or(&item.0);
        BlobRef(format!("{}{}", self.incoming_failed_prefix(), name))
    }

    // ---- rows ----

    pub async fn get<T: DeserializeOwned>(&self, row_ref: &RowRef) -> Result<Doc<T>> {
        let mut rows = self.store.row_fetch(&Selector::Single(row_ref)).await?;
        let row = rows.pop().ok_or(Error::NotFound)?;
        let value = self.decode(&row)?;
        Ok(Doc {
            row_ref: row.row_ref,
            value,
        })
    }

    pub async fn get_opt<T: DeserializeOwned>(&self, row_ref: &RowRef) -> Result<Option<Doc<T>>> {
        match self.get(row_ref).await {
            Ok(doc) => Ok(Some(doc)),
            Err(Error::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Writes `value` at `row_ref`, honoring its revision: a `None` revision
    /// only succeeds if the row does not exist yet.
    pub async fn put<T: Serialize>(&self, row_ref: RowRef, value: &T) -> Result<RowRef> {
        let sealed = cryptoblob::seal_serialize(value, &self.key)
            .map_err(|e| Error::MalformedRecord(e.to_string()))?;
        Ok(self.store.row_insert(RowVal::new(row_ref, sealed)).await?)
    }

    pub async fn delete(&self, row_ref: &RowRef) -> Result<()> {
        Ok(self.store.row_rm_single(row_ref).await?)
    }

    pub async fn delete_shard(&self, shard: &str) -> Result<()> {
        Ok(self
            .store
            .row_rm(&Selector::Prefix {
                shard,
                sort_prefix: "",
            })
            .await?)
    }

    /// Every document of `shard` whose sort key starts with `sort_prefix`,
    /// in sort key order. Nothing is read until the stream is polled;
    /// documents are decoded one by one, an undecodable one is yielded as
    /// `MalformedRecord` without ending the stream.
    pub fn query<T: DeserializeOwned + Send + 'static>(
        &self,
        shard: String,
        sort_prefix: String,
    ) -> BoxStream<'static, Result<Doc<T>>> {
        self.query_with_keys(shard, sort_prefix)
            .map(|row| {
                let (row_ref, value) = row?;
                Ok(Doc {
                    row_ref,
                    value: value?,
                })
            })
            .boxed()
    }

    /// Same as `query`, but the row reference is kept next to the decoding
    /// result so a caller can still account for rows it cannot read. The
    /// outer error is a store failure.
    pub fn query_with_keys<T: DeserializeOwned + Send + 'static>(
        &self,
        shard: String,
        sort_prefix: String,
    ) -> BoxStream<'static, Result<(RowRef, Result<T>)>> {
        let this = self.clone();
        stream::once(async move {
            let rows = this
                .store
                .row_fetch(&Selector::Prefix {
                    shard: &shard,
                    sort_prefix: &sort_prefix,
                })
                .await;
            match rows {
                Ok(rows) => stream::iter(rows)
                    .map(move |row| {
                        let value = this.decode::<T>(&row);
                        Ok((row.row_ref, value))
                    })
                    .boxed(),
                Err(e) => stream::iter(vec![Err(e.into())]).boxed(),
            }
        })
        .flatten()
        .boxed()
    }

    /// Change notifications under `prefix` (a shard or a blob prefix).
    pub fn subscribe(&self, prefix: &str) -> BoxStream<'static, StoreEvent> {
        self.store.watch(prefix)
    }

    fn decode<T: DeserializeOwned>(&self, row: &RowVal) -> Result<T> {
        cryptoblob::open_deserialize::<T>(&row.value, &self.key).map_err(|e| {
            Error::MalformedRecord(format!("{}/{}: {}", row.row_ref.uid.shard, row.row_ref.uid.sort, e))
        })
    }

    // ---- blobs ----

    pub async fn blob_put_sealed(&self, blob_ref: BlobRef, plain: &[u8]) -> Result<()> {
        let sealed =
            cryptoblob::seal(plain, &self.key).map_err(|e| Error::MalformedRecord(e.to_string()))?;
        Ok(self.store.blob_insert(BlobVal::new(blob_ref, sealed)).await?)
    }

    pub async fn blob_get_sealed(&self, blob_ref: &BlobRef) -> Result<Vec<u8>> {
        let blob = self.store.blob_fetch(blob_ref).await?;
        cryptoblob::open(&blob.value, &self.key)
            .map_err(|e| Error::MalformedRecord(format!("{}: {}", blob_ref.0, e)))
    }

    pub async fn blob_put_raw(&self, blob_ref: BlobRef, raw: Vec<u8>) -> Result<()> {
        Ok(self.store.blob_insert(BlobVal::new(blob_ref, raw)).await?)
    }

    pub async fn blob_get_raw(&self, blob_ref: &BlobRef) -> Result<Vec<u8>> {
        Ok(self.store.blob_fetch(blob_ref).await?.value)
    }

    pub async fn blob_copy(&self, src: &BlobRef, dst: &BlobRef) -> Result<()> {
        Ok(self.store.blob_copy(src, dst).await?)
    }

    pub async fn blob_list(&self, prefix: &str) -> Result<Vec<BlobRef>> {
        Ok(self.store.blob_list(prefix).await?)
    }

    pub async fn blob_rm(&self, blob_ref: &BlobRef) -> Result<()> {
        match self.store.blob_rm(blob_ref).await {
            Ok(()) | Err(storage::StorageError::NotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffre_user::storage::in_memory::MemStore;
    use std::sync::Arc;

    fn docstore() -> DocStore {
        DocStore::new("alice", Arc::new(MemStore::new()), cryptoblob::gen_key())
    }

    #[tokio::test]
    async fn put_bumps_revision_and_rejects_stale_writes() {
        let ds = docstore();
        let row = RowRef::new(&ds.mailboxes_shard(), "a");

        let r1 = ds.put(row.clone(), &"first".to_string()).await.unwrap();
        assert_eq!(
            ds.put(row.clone(), &"again".to_string()).await,
            Err(Error::RevisionConflict)
        );
        let r2 = ds.put(r1.clone(), &"second".to_string()).await.unwrap();
        assert_eq!(ds.put(r1, &"stale".to_string()).await, Err(Error::RevisionConflict));

        let doc: Doc<String> = ds.get(&row).await.unwrap();
        assert_eq!(doc.value, "second");
        assert_eq!(doc.row_ref.revision, r2.revision);
    }

    #[tokio::test]
    async fn query_reports_undecodable_rows_individually() {
        let ds = docstore();
        let shard = ds.mailboxes_shard();
        ds.put(RowRef::new(&shard, "a"), &1u32).await.unwrap();
        ds.store
            .row_insert(RowVal::new(RowRef::new(&shard, "b"), b"garbage".to_vec()))
            .await
            .unwrap();
        ds.put(RowRef::new(&shard, "c"), &3u32).await.unwrap();

        let res = ds
            .query::<u32>(shard, String::new())
            .collect::<Vec<_>>()
            .await;
        assert_eq!(res.len(), 3);
        assert_eq!(res[0].as_ref().unwrap().value, 1);
        assert!(matches!(res[1], Err(Error::MalformedRecord(_))));
        assert_eq!(res[2].as_ref().unwrap().value, 3);
    }

    #[tokio::test]
    async fn missing_document() {
        let ds = docstore();
        let row = RowRef::new(&ds.dedup_shard(), "nope");
        assert!(matches!(ds.get::<u32>(&row).await, Err(Error::NotFound)));
        assert!(ds.get_opt::<u32>(&row).await.unwrap().is_none());
    }
}
