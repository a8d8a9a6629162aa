//! Filing of the mail dropped encrypted in the account's incoming queue.
//!
//! Senders only know the account's public key: each item is a message
//! sealed with a fresh symmetric key, itself sealed for the account. The
//! pipeline walks the queue in key order and files what it can decrypt and
//! parse into the delivery mailbox. Items that will never decrypt or parse
//! are moved out of the queue; items hit by a store failure stay for the
//! next tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use coffre_user::config::{DedupPolicy, IncomingConfig};
use coffre_user::cryptoblob::{self, CryptoKeys, Key, PublicKey, KEYBYTES, SEALBYTES};
use coffre_user::storage::{BlobRef, RowRef};
use coffre_user::timestamp::now_msec;

use crate::account::Account;
use crate::error::{Error, Result};
use crate::mail::mailbox::Mailbox;
use crate::mail::record::{self, RECENT};
use crate::mail::uidindex::ImapUid;
use crate::serializer::Lane;
use crate::unique_ident::{gen_ident, UniqueIdent};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct DecryptionError(pub String);

impl From<DecryptionError> for Error {
    fn from(e: DecryptionError) -> Self {
        Error::Decryption(e.0)
    }
}

/// Turns a drop-queue item back into a plain RFC 5322 message.
#[async_trait]
pub trait Decrypt: Send + Sync {
    async fn decrypt(&self, item: &[u8]) -> std::result::Result<Vec<u8>, DecryptionError>;
}

/// Opens items made of the message key sealed for the account keypair,
/// followed by the message sealed with that key.
pub struct SealedBoxDecryptor {
    keys: CryptoKeys,
}

impl SealedBoxDecryptor {
    pub fn new(keys: CryptoKeys) -> Self {
        Self { keys }
    }
}

const SEALED_KEY_LEN: usize = KEYBYTES + SEALBYTES;

#[async_trait]
impl Decrypt for SealedBoxDecryptor {
    async fn decrypt(&self, item: &[u8]) -> std::result::Result<Vec<u8>, DecryptionError> {
        if item.len() < SEALED_KEY_LEN {
            return Err(DecryptionError(format!("item too short ({} bytes)", item.len())));
        }
        let (sealed_key, body) = item.split_at(SEALED_KEY_LEN);

        let message_key = cryptoblob::open_sealed(sealed_key, &self.keys.public, &self.keys.secret)
            .map_err(|_| DecryptionError("cannot decrypt message key".into()))?;
        let message_key = Key::from_slice(&message_key)
            .ok_or_else(|| DecryptionError("invalid message key".into()))?;
        cryptoblob::open(body, &message_key)
            .map_err(|_| DecryptionError("cannot decrypt message body".into()))
    }
}

/// A message encrypted for delivery into an account's incoming queue.
pub struct EncryptedMessage {
    key: Key,
    encrypted_body: Vec<u8>,
}

impl EncryptedMessage {
    pub fn new(body: Vec<u8>) -> anyhow::Result<Self> {
        let key = cryptoblob::gen_key();
        let encrypted_body = cryptoblob::seal(&body, &key)?;
        Ok(Self {
            key,
            encrypted_body,
        })
    }

    /// The drop-queue item readable by the owner of `public_key`.
    pub fn seal_for(&self, public_key: &PublicKey) -> Vec<u8> {
        let mut item = cryptoblob::seal_for(self.key.as_ref(), public_key);
        item.extend_from_slice(&self.encrypted_body);
        item
    }

    pub async fn deliver_to(&self, account: &Account) -> Result<BlobRef> {
        let docs = account.docs();
        let blob = docs.incoming_blob(&gen_ident());
        docs.blob_put_raw(blob.clone(), self.seal_for(&account.keys.public))
            .await?;
        Ok(blob)
    }
}

/// What happened to one drop-queue item during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Filed { key: String, uid: ImapUid },
    /// Already filed once: removed from the queue without filing it again.
    Duplicate { key: String },
    /// Cannot be decrypted or parsed: moved under the failed prefix.
    Quarantined { key: String, reason: String },
    /// Left in the queue, to be tried again.
    Skipped { key: String, reason: String },
}

impl ItemOutcome {
    pub fn key(&self) -> &str {
        match self {
            Self::Filed { key, .. }
            | Self::Duplicate { key }
            | Self::Quarantined { key, .. }
            | Self::Skipped { key, .. } => key,
        }
    }
}

/// Written in the dedup shard, keyed by content hash, once a message is filed.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct DeliveryReceipt {
    mailbox: UniqueIdent,
    uid: u32,
    filed: u64,
}

pub struct IncomingPipeline {
    account: Arc<Account>,
    decryptor: Arc<dyn Decrypt>,
    config: IncomingConfig,
}

impl IncomingPipeline {
    pub fn new(account: Arc<Account>, decryptor: Arc<dyn Decrypt>, config: IncomingConfig) -> Self {
        Self {
            account,
            decryptor,
            config,
        }
    }

    /// Goes once through the queue. Item failures end up in the report; an
    /// error is returned only if the queue or the delivery mailbox cannot
    /// be read at all.
    pub async fn tick(&self) -> Result<Vec<ItemOutcome>> {
        let docs = self.account.docs();
        let mut items = docs.blob_list(&docs.incoming_prefix()).await?;
        items.sort();
        if items.is_empty() {
            return Ok(vec![]);
        }

        let inbox = self.account.open_mailbox(self.account.inbox()).await?;
        let must_exit = self.account.must_exit();

        let mut report = Vec::with_capacity(items.len());
        for item in items {
            if *must_exit.borrow() {
                info!(user=%self.account.user_id, "exit requested, leaving the rest of the queue");
                break;
            }
            let outcome = match self.file(&inbox, &item).await {
                Ok(outcome) => outcome,
                Err(e @ (Error::Decryption(_) | Error::MalformedMessage(_))) => {
                    self.quarantine(&item, e.to_string()).await
                }
                Err(e) => ItemOutcome::Skipped {
                    key: item.0.clone(),
                    reason: e.to_string(),
                },
            };
            match &outcome {
                ItemOutcome::Skipped { key, reason } => {
                    warn!(user=%self.account.user_id, item=%key, reason=%reason, "incoming item skipped")
                }
                ItemOutcome::Quarantined { key, reason } => {
                    warn!(user=%self.account.user_id, item=%key, reason=%reason, "incoming item moved out of the queue")
                }
                _ => (),
            }
            report.push(outcome);
        }
        Ok(report)
    }

    async fn file(&self, inbox: &Mailbox, item: &BlobRef) -> Result<ItemOutcome> {
        let docs = self.account.docs();
        let key = item.0.clone();

        let ciphertext = docs.blob_get_raw(item).await?;
        let plain = self.decryptor.decrypt(&ciphertext).await?;
        record::parse_headers(&plain)?;

        let hash = record::content_hash(&plain);
        let receipt_row = RowRef::new(&docs.dedup_shard(), &hash);
        if self.config.dedup == DedupPolicy::ContentHash
            && docs.get_opt::<DeliveryReceipt>(&receipt_row).await?.is_some()
        {
            docs.blob_rm(item).await?;
            info!(user=%self.account.user_id, item=%key, "duplicate incoming message dropped");
            return Ok(ItemOutcome::Duplicate { key });
        }

        // Refiling an item after a crash finds the message already there.
        let ident = key
            .strip_prefix(&docs.incoming_prefix())
            .and_then(|id| id.parse::<UniqueIdent>().ok())
            .unwrap_or_else(gen_ident);
        let (_, uid) = inbox
            .append_as(ident, plain, vec![RECENT.to_string()], None)
            .await?;

        if self.config.dedup == DedupPolicy::ContentHash {
            let receipt = DeliveryReceipt {
                mailbox: inbox.id(),
                uid: uid.get(),
                filed: now_msec(),
            };
            let docs = docs.clone();
            self.account
                .serializer()
                .submit(Lane::Mailbox(inbox.id()), move || {
                    let (docs, row, receipt) = (docs.clone(), receipt_row.clone(), receipt.clone());
                    async move {
                        match docs.put(row, &receipt).await {
                            Ok(_) | Err(Error::RevisionConflict) => Ok(()),
                            Err(e) => Err(e),
                        }
                    }
                })
                .await?;
        }

        docs.blob_rm(item).await?;
        info!(user=%self.account.user_id, item=%key, uid=uid.get(), "incoming message filed");
        Ok(ItemOutcome::Filed { key, uid })
    }

    /// Moves `item` out of the queue. If that fails it stays where it is
    /// and is reported as skipped.
    async fn quarantine(&self, item: &BlobRef, reason: String) -> ItemOutcome {
        let docs = self.account.docs();
        let dest = docs.incoming_failed_blob(item);
        let moved = match docs.blob_copy(item, &dest).await {
            Ok(()) => docs.blob_rm(item).await,
            Err(e) => Err(e),
        };
        let key = item.0.clone();
        match moved {
            Ok(()) => ItemOutcome::Quarantined { key, reason },
            Err(e) => ItemOutcome::Skipped {
                key,
                reason: format!("{}, and unable to move it aside: {}", reason, e),
            },
        }
    }

    /// Ticks on a timer, and early whenever something lands in the queue,
    /// until `must_exit` is raised.
    pub async fn run(self, mut must_exit: watch::Receiver<bool>) {
        let docs = self.account.docs().clone();
        let mut wakeups = docs.subscribe(&docs.incoming_prefix());
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs));
        interval.tick().await;

        loop {
            match self.tick().await {
                Ok(report) if !report.is_empty() => {
                    let filed = report
                        .iter()
                        .filter(|o| matches!(o, ItemOutcome::Filed { .. }))
                        .count();
                    info!(user=%self.account.user_id, filed=filed, total=report.len(), "incoming queue processed");
                }
                Ok(_) => (),
                Err(e) => warn!(user=%self.account.user_id, err=%e, "unable to process incoming queue"),
            }

            tokio::select! {
                _ = interval.tick() => (),
                Some(_) = wakeups.next() => (),
                res = must_exit.changed() => {
                    if res.is_err() || *must_exit.borrow() {
                        break;
                    }
                }
            }
        }
        info!(user=%self.account.user_id, "incoming pipeline exiting");
    }
}
