//! Persistent storage
//!
//! - [`WatchStateStore`]: one JSON watch record per account
//! - [`SecretStore`]: credentials keyed by name

mod secrets;
mod watch_store;

pub use secrets::{FileSecretStore, InMemorySecretStore, SECRETS_FILE, SecretStore};
pub use watch_store::{
    StartCursor, StoreError, WATCH_STATE_DIR, WatchStateStore, default_dir, sanitize_account,
};
