//! Credential storage for the authenticated session.
//!
//! This module provides:
//! - `CredentialStore`: field accessors for the access token and the
//!   identity fields (phone, username) shown by the client
//! - `StorageBackend`: the synchronous key-value medium behind the store,
//!   with file, OS keychain and in-memory implementations
//!
//! The store performs no validation of the token; it is an opaque string
//! issued by the marketplace backend.

pub mod error;
pub mod file;
pub mod keychain;
pub mod store;

pub use error::StoreError;
pub use file::FileStorage;
pub use keychain::KeychainStorage;
pub use store::{CredentialField, CredentialRecord, CredentialStore, MemoryStorage, StorageBackend};
