//! Persistent per-account watch state
//!
//! One JSON record per account under `<config dir>/state/gmail-watch/`. The
//! in-memory copy is guarded by a mutex and every update rewrites the whole
//! record atomically.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};

use crate::models::{WatchState, parse_history_id};

/// State subdirectory for watch records
pub const WATCH_STATE_DIR: &str = "gmail-watch";

/// Errors from the watch state store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("No watch state for {account}; run `relayd watch start` first")]
    NotFound { account: String },
    #[error("Failed to read watch state {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Watch state {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Watch state {} belongs to {stored}, not {requested}", path.display())]
    AccountMismatch {
        path: PathBuf,
        stored: String,
        requested: String,
    },
    #[error("History ID {value:?} is not a valid cursor")]
    InvalidHistoryId { value: String },
    #[error("Failed to persist watch state: {0:#}")]
    Write(anyhow::Error),
}

/// Default directory for watch records
pub fn default_dir() -> Option<PathBuf> {
    config::state_dir(WATCH_STATE_DIR)
}

/// File-safe form of an account name
///
/// Lowercase ASCII alphanumerics are kept, everything else becomes `_`.
pub fn sanitize_account(account: &str) -> String {
    account
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Where a push starts reconciling from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartCursor {
    /// No cursor was stored; this one was adopted and nothing is diffed
    Baseline(u64),
    /// Diff from the stored cursor
    Resume(u64),
}

/// Watch state for one account, persisted on every update
pub struct WatchStateStore {
    path: PathBuf,
    state: Mutex<WatchState>,
}

impl WatchStateStore {
    /// Path of the record for `account` inside `dir`
    pub fn path_for(dir: &Path, account: &str) -> PathBuf {
        dir.join(format!("{}.json", sanitize_account(account)))
    }

    /// Write a fresh record, replacing any existing one for the same account
    ///
    /// Accounts that sanitize to the same file name never overwrite each
    /// other: the existing record's account must match.
    pub fn create(dir: &Path, mut state: WatchState) -> Result<Self, StoreError> {
        let path = Self::path_for(dir, &state.account);
        match read_record(&path) {
            Ok(Some(existing)) => check_account(&path, &existing, &state.account)?,
            Ok(None) => {}
            Err(e @ StoreError::Corrupt { .. }) => warn!("Replacing unreadable record: {e}"),
            Err(e) => return Err(e),
        }

        state.updated_at_ms = now_ms();
        config::write_json_atomic(&path, &state).map_err(StoreError::Write)?;
        info!("Created watch state for {} at {}", state.account, path.display());

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Load the record for `account`
    pub fn load(dir: &Path, account: &str) -> Result<Self, StoreError> {
        let path = Self::path_for(dir, account);
        let Some(state) = read_record(&path)? else {
            return Err(StoreError::NotFound {
                account: account.to_string(),
            });
        };
        check_account(&path, &state, account)?;
        debug!("Loaded watch state for {} (historyId={:?})", account, state.history_id);

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current state
    pub fn get(&self) -> WatchState {
        self.lock().clone()
    }

    /// Mutate the state and persist the whole record
    ///
    /// `updatedAtMs` is stamped on every call. If persisting fails the
    /// in-memory mutation stays visible to later readers.
    pub fn update<R>(&self, f: impl FnOnce(&mut WatchState) -> R) -> Result<R, StoreError> {
        let mut state = self.lock();
        let result = f(&mut state);
        state.updated_at_ms = now_ms();
        config::write_json_atomic(&self.path, &*state).map_err(StoreError::Write)?;
        Ok(result)
    }

    /// Cursor to diff from for a push carrying `push_history_id`
    ///
    /// Without a stored cursor (empty or "0") the push's cursor is adopted
    /// and persisted as the baseline; there is nothing to diff yet.
    pub fn start_history_id(&self, push_history_id: &str) -> Result<StartCursor, StoreError> {
        let mut state = self.lock();
        if state.needs_baseline() {
            let baseline = parse_history_id(push_history_id)
                .filter(|id| *id > 0)
                .ok_or_else(|| StoreError::InvalidHistoryId {
                    value: push_history_id.to_string(),
                })?;
            state.history_id = baseline.to_string();
            state.updated_at_ms = now_ms();
            config::write_json_atomic(&self.path, &*state).map_err(StoreError::Write)?;
            info!("Adopted baseline historyId {} for {}", baseline, state.account);
            return Ok(StartCursor::Baseline(baseline));
        }

        state
            .history_cursor()
            .map(StartCursor::Resume)
            .ok_or_else(|| StoreError::InvalidHistoryId {
                value: state.history_id.clone(),
            })
    }

    /// Remove the persisted record
    pub fn delete(self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Read {
                path: self.path,
                source,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read and parse a record, None when the file does not exist
fn read_record(path: &Path) -> Result<Option<WatchState>, StoreError> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

fn check_account(path: &Path, state: &WatchState, account: &str) -> Result<(), StoreError> {
    if state.account.trim().eq_ignore_ascii_case(account.trim()) {
        return Ok(());
    }
    Err(StoreError::AccountMismatch {
        path: path.to_path_buf(),
        stored: state.account.clone(),
        requested: account.to_string(),
    })
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
