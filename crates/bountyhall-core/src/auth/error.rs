use thiserror::Error;

/// Failure of the durable storage medium behind the credential store.
///
/// These are never swallowed by the store; every accessor hands them
/// back to its caller.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Keychain access failed: {0}")]
    Keychain(#[from] keyring::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}
