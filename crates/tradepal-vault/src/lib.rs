// Provider credential vault
// Per-session symmetric key, durable ciphertext

mod storage;
mod store;

pub use storage::{FileStorage, KeyValueStorage, MemoryStorage};
pub use store::{
    validate_api_key, CredentialStore, CredentialSummary, StoredCredential, CREDENTIAL_KEY_PREFIX,
    SESSION_KEY_ENTRY,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("API key cannot be empty")]
    EmptyKey,

    #[error("Invalid {provider} API key: {reason}")]
    InvalidFormat { provider: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CredentialError>;
