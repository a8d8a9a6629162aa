use std::io::Read;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::cryptoblob::CryptoKeys;
use crate::storage::{in_memory::MemBuilder, Builder};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub account: AccountConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub incoming: IncomingConfig,
    #[serde(default)]
    pub serializer: RetryPolicy,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AccountConfig {
    pub user_id: String,
    #[serde(default = "default_inbox")]
    pub inbox: String,
    #[serde(default = "default_delimiter")]
    pub hierarchy_delimiter: String,

    pub master_key: String,
    pub secret_key: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "storage_driver")]
pub enum StorageConfig {
    InMemory,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// File every item observed in the drop queue, even if it was filed before.
    None,
    /// Skip items whose plaintext hash was already filed for this account.
    ContentHash,
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self::None
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IncomingConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub dedup: DedupPolicy,
}

impl Default for IncomingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            dedup: DedupPolicy::default(),
        }
    }
}

/// Bounds applied by the write serializer when the store pushes back.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct RetryPolicy {
    #[serde(default = "default_conflict_retries")]
    pub max_conflict_retries: u32,
    #[serde(default = "default_unavailable_retries")]
    pub max_unavailable_retries: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_conflict_retries: default_conflict_retries(),
            max_unavailable_retries: default_unavailable_retries(),
            backoff_base_ms: default_backoff_base(),
        }
    }
}

impl AccountConfig {
    pub fn delimiter(&self) -> Result<char> {
        let mut chars = self.hierarchy_delimiter.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(c),
            _ => bail!(
                "hierarchy_delimiter must be exactly one character, got {:?}",
                self.hierarchy_delimiter
            ),
        }
    }

    pub fn crypto_keys(&self) -> Result<CryptoKeys> {
        CryptoKeys::from_b64(&self.master_key, &self.secret_key)
            .context("account keys are invalid")
    }
}

impl StorageConfig {
    pub fn builder(&self) -> Builder {
        match self {
            StorageConfig::InMemory => MemBuilder::new(),
        }
    }
}

impl Config {
    /// Fails fast on values that would otherwise only surface at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.account.user_id.trim().is_empty() {
            bail!("account.user_id must not be empty");
        }
        let delim = self.account.delimiter()?;
        if self.account.inbox.is_empty() || self.account.inbox.split(delim).any(str::is_empty) {
            bail!("account.inbox is not a valid mailbox path: {:?}", self.account.inbox);
        }
        self.account.crypto_keys()?;
        if self.incoming.poll_interval_secs == 0 {
            bail!("incoming.poll_interval_secs must be at least 1");
        }
        Ok(())
    }
}

pub fn read_config<T: DeserializeOwned>(config_file: PathBuf) -> Result<T> {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .open(config_file.as_path())
        .with_context(|| format!("unable to open {:?}", config_file))?;

    let mut config = String::new();
    file.read_to_string(&mut config)?;

    Ok(toml::from_str(&config)?)
}

fn default_inbox() -> String {
    "INBOX".into()
}

fn default_delimiter() -> String {
    "/".into()
}

fn default_poll_interval() -> u64 {
    5
}

fn default_conflict_retries() -> u32 {
    8
}

fn default_unavailable_retries() -> u32 {
    5
}

fn default_backoff_base() -> u64 {
    50
}
