pub mod account;
pub mod docstore;
pub mod error;
pub mod mail;
pub mod serializer;
pub mod unique_ident;

pub use error::{Error, Result};
