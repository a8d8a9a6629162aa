use thiserror::Error;

use coffre_user::storage::StorageError;

/// Every failure an engine operation can report to its caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("store is temporarily unavailable")]
    StoreUnavailable,
    #[error("document revision changed concurrently")]
    RevisionConflict,
    #[error("write still conflicting after {0} attempts")]
    WriteFailed(u32),
    #[error("document not found")]
    NotFound,
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error("not an RFC 5322 message: {0}")]
    MalformedMessage(String),
    #[error("unable to decrypt: {0}")]
    Decryption(String),

    #[error("mailbox {0} already exists")]
    MailboxExists(String),
    #[error("mailbox {0} does not exist")]
    MailboxNotFound(String),
    #[error("mailbox {0} has inferior hierarchical names")]
    HasInferiors(String),
    #[error("invalid mailbox name {0:?}")]
    InvalidMailboxName(String),
    #[error("mailbox {0} is not subscribed")]
    NotSubscribed(String),
    #[error("invalid flag {0:?}")]
    InvalidFlag(String),
    #[error("no such message: {0}")]
    NoSuchMessage(u32),
    #[error("no such body part: {0}")]
    NoSuchPart(String),

    #[error("not authenticated")]
    NotAuthenticated,
    #[error("authentication rejected")]
    AuthenticationRejected,
    #[error("mailbox is selected read-only")]
    ReadOnly,
    #[error("no mailbox selected")]
    NoMailboxSelected,

    #[error("write serializer is shut down")]
    Shutdown,
    #[error("{0}")]
    Storage(StorageError),
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound => Self::NotFound,
            StorageError::Unavailable => Self::StoreUnavailable,
            StorageError::RevisionConflict => Self::RevisionConflict,
            StorageError::Internal => Self::Storage(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
