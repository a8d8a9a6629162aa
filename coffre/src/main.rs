use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use coffre_collections::account::Account;
use coffre_collections::mail::incoming::{EncryptedMessage, IncomingPipeline, SealedBoxDecryptor};
use coffre_user::config::{read_config, Config, StorageConfig};
use coffre_user::cryptoblob::{b64_encode, CryptoKeys};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    #[clap(short, long, env = "COFFRE_CONFIG", default_value = "coffre.toml")]
    /// Path to the coffre configuration file
    config_file: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Files incoming mail and follows the store until CTRL+C. The store
    /// lives in this process: mail reaches it through `--deliver`
    Daemon {
        /// Raw messages to seal into the incoming queue at startup
        #[clap(short, long)]
        deliver: Vec<PathBuf>,
    },

    #[clap(subcommand)]
    /// Specific tooling, should not be part of a normal workflow
    Tools(ToolsCommand),
}

#[derive(Subcommand, Debug)]
enum ToolsCommand {
    /// Generate the key material of a new account
    Keygen,
    /// Encrypt a message for the account's incoming queue, printed as base64
    Seal {
        #[clap(short, long)]
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "main=info,coffre=info")
    }

    // Abort on panic (same behavior as in Go)
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("{}", panic_info);
        eprintln!("{:?}", backtrace::Backtrace::new());
        std::process::abort();
    }));

    tracing_subscriber::fmt::init();

    if sodiumoxide::init().is_err() {
        anyhow::bail!("unable to initialize the cryptography library");
    }

    let args = Args::parse();
    match &args.command {
        Command::Daemon { deliver } => {
            let config: Config = read_config(args.config_file.clone())?;
            daemon(config, deliver).await?;
        }
        Command::Tools(ToolsCommand::Keygen) => {
            let keys = CryptoKeys::init();
            println!("[account]");
            println!("master_key = \"{}\"", keys.master_b64());
            println!("secret_key = \"{}\"", keys.secret_b64());
            println!("# public key: {}", keys.public_b64());
        }
        Command::Tools(ToolsCommand::Seal { input }) => {
            let config: Config = read_config(args.config_file.clone())?;
            let keys = config.account.crypto_keys()?;
            let body = std::fs::read(input).with_context(|| format!("unable to read {:?}", input))?;
            let item = EncryptedMessage::new(body)?.seal_for(&keys.public);
            println!("{}", b64_encode(&item));
        }
    }

    Ok(())
}

async fn daemon(config: Config, deliver: &[PathBuf]) -> Result<()> {
    let store = config
        .storage
        .builder()
        .build()
        .await
        .context("storage is unreachable")?;

    let must_exit = watch_ctrl_c();
    let account = Account::open(&config, store, must_exit.clone())
        .await
        .context("unable to open the account")?;
    info!(user=%account.user_id, inbox=%account.inbox(), "account opened");
    if matches!(config.storage, StorageConfig::InMemory) {
        warn!("in-memory storage, only this process can reach the account");
    }

    queue_files(&account, deliver).await?;

    let pipeline = IncomingPipeline::new(
        account.clone(),
        Arc::new(SealedBoxDecryptor::new(account.keys.clone())),
        config.incoming.clone(),
    );
    pipeline.run(must_exit).await;

    info!("daemon exited");
    Ok(())
}

/// Seals each file into the account's drop queue.
async fn queue_files(account: &Account, paths: &[PathBuf]) -> Result<()> {
    for path in paths {
        let body = std::fs::read(path).with_context(|| format!("unable to read {:?}", path))?;
        let item = EncryptedMessage::new(body)?
            .deliver_to(account)
            .await
            .with_context(|| format!("unable to queue {:?}", path))?;
        info!(file=?path, item=%item.0, "message queued");
    }
    Ok(())
}

fn watch_ctrl_c() -> watch::Receiver<bool> {
    let (send_cancel, watch_cancel) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(err=%e, "failed to install CTRL+C signal handler");
            return;
        }
        info!("Received CTRL+C, shutting down.");
        let _ = send_cancel.send(true);
    });
    watch_cancel
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffre_collections::mail::incoming::ItemOutcome;
    use coffre_user::config::{AccountConfig, IncomingConfig, RetryPolicy};
    use coffre_user::storage::in_memory::MemStore;

    #[test]
    fn daemon_takes_files_to_deliver() {
        let args =
            Args::try_parse_from(["coffre", "daemon", "--deliver", "a.eml", "-d", "b.eml"]).unwrap();
        match args.command {
            Command::Daemon { deliver } => {
                assert_eq!(deliver, vec![PathBuf::from("a.eml"), PathBuf::from("b.eml")])
            }
            other => panic!("unexpected command {:?}", other),
        }

        let args = Args::try_parse_from(["coffre", "daemon"]).unwrap();
        assert!(matches!(args.command, Command::Daemon { ref deliver } if deliver.is_empty()));
    }

    #[tokio::test]
    async fn queued_files_are_filed_by_the_pipeline() {
        let keys = CryptoKeys::init();
        let config = Config {
            account: AccountConfig {
                user_id: "alice".into(),
                inbox: "INBOX".into(),
                hierarchy_delimiter: "/".into(),
                master_key: keys.master_b64(),
                secret_key: keys.secret_b64(),
            },
            storage: StorageConfig::InMemory,
            incoming: IncomingConfig::default(),
            serializer: RetryPolicy::default(),
        };
        let (_exit, must_exit) = watch::channel(false);
        let account = Account::open(&config, Arc::new(MemStore::new()), must_exit)
            .await
            .unwrap();

        let path = std::env::temp_dir().join(format!("coffre-queue-{}.eml", std::process::id()));
        std::fs::write(&path, b"From: bob@example.tld\r\nSubject: hi\r\n\r\nhello\r\n").unwrap();
        let queued = queue_files(&account, &[path.clone()]).await;
        std::fs::remove_file(&path).unwrap();
        queued.unwrap();

        let pipeline = IncomingPipeline::new(
            account.clone(),
            Arc::new(SealedBoxDecryptor::new(account.keys.clone())),
            config.incoming.clone(),
        );
        let outcomes = pipeline.tick().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], ItemOutcome::Filed { .. }));

        let missing = PathBuf::from("/nonexistent/coffre.eml");
        assert!(queue_files(&account, &[missing]).await.is_err());
    }
}
