pub mod config;
pub mod cryptoblob;
pub mod storage;
pub mod timestamp;

// An account is composed of 3 things:
// - An identity (config.account.user_id)
// - A storage profile (storage)
// - Some cryptography data (cryptoblob)
