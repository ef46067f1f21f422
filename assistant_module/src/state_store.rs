//! Durable run state: the fetch cursor, the processed-ID set and the
//! failed-ID ledger, persisted as JSON over one of two backends chosen
//! once at startup from the state-root prefix (`az://container/prefix`
//! selects remote object storage, anything else the local filesystem).
//!
//! The store owns the on-disk/remote representation; every other
//! component holds only transient copies for the duration of one run.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::blob_store::BlobStateStore;

pub const CURSOR_FILE: &str = "last_history_id.json";
pub const PROCESSED_FILE: &str = "processed_ids.json";
pub const FAILED_FILE: &str = "failed_ids.json";

const REMOTE_SCHEME: &str = "az://";
const MAX_FAILED_ENTRIES: usize = 200;
const MAX_REASON_CHARS: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("state backend error: {0}")]
    Backend(String),
    /// Present but unreadable or of the wrong shape. Fatal for the run:
    /// silently resetting would risk reprocessing already-handled mail.
    #[error("corrupt state record {path}: {detail}")]
    Corrupt { path: String, detail: String },
}

pub enum StateStore {
    Local(LocalStateStore),
    Remote(BlobStateStore),
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateStore::Local(_) => f.write_str("StateStore::Local"),
            StateStore::Remote(_) => f.write_str("StateStore::Remote"),
        }
    }
}

impl StateStore {
    /// Pick the backend from the state root. Remote roots look like
    /// `az://container/prefix` and need the storage connection string;
    /// everything else is a local directory.
    pub fn from_state_root(
        state_root: &str,
        azure_connection_string: Option<&str>,
    ) -> Result<Self, StateStoreError> {
        if let Some(rest) = state_root.strip_prefix(REMOTE_SCHEME) {
            let (container, prefix) = match rest.split_once('/') {
                Some((container, prefix)) => (container, prefix),
                None => (rest, ""),
            };
            if container.is_empty() {
                return Err(StateStoreError::Backend(format!(
                    "invalid remote state root: {state_root}"
                )));
            }
            let connection_string = azure_connection_string.ok_or_else(|| {
                StateStoreError::Backend(
                    "remote state root configured but AZURE_STORAGE_CONNECTION_STRING is not set"
                        .to_string(),
                )
            })?;
            Ok(StateStore::Remote(BlobStateStore::new(
                connection_string,
                container,
                prefix,
            )?))
        } else {
            Ok(StateStore::Local(LocalStateStore::new(state_root)))
        }
    }

    pub fn read_json(&self, name: &str) -> Result<Option<Value>, StateStoreError> {
        match self {
            StateStore::Local(store) => store.read_json(name),
            StateStore::Remote(store) => store.read_json(name),
        }
    }

    pub fn write_json(&self, name: &str, value: &Value) -> Result<(), StateStoreError> {
        match self {
            StateStore::Local(store) => store.write_json(name, value),
            StateStore::Remote(store) => store.write_json(name, value),
        }
    }
}

pub struct LocalStateStore {
    root: PathBuf,
}

impl LocalStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn read_json(&self, name: &str) -> Result<Option<Value>, StateStoreError> {
        let path = self.path_for(name);
        if !path.is_file() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).map_err(|err| StateStoreError::Backend(
            format!("read {}: {err}", path.display()),
        ))?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|err| StateStoreError::Corrupt {
                path: path.display().to_string(),
                detail: err.to_string(),
            })
    }

    fn write_json(&self, name: &str, value: &Value) -> Result<(), StateStoreError> {
        let path = self.path_for(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                StateStoreError::Backend(format!("create {}: {err}", parent.display()))
            })?;
        }
        let serialized = serde_json::to_string_pretty(value)
            .map_err(|err| StateStoreError::Backend(err.to_string()))?;

        // temp-file replace so a crash mid-write never corrupts the record
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, serialized).map_err(|err| {
            StateStoreError::Backend(format!("write {}: {err}", temp.display()))
        })?;
        fs::rename(&temp, &path).map_err(|err| {
            StateStoreError::Backend(format!("replace {}: {err}", path.display()))
        })?;
        Ok(())
    }
}

/// Where incremental fetch resumes. One logical record, overwritten each
/// run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorState {
    pub last_history_id: String,
    pub updated_at: String,
}

/// `None` means first run: the record is missing, empty, or has no
/// history id yet. A present record of the wrong shape is corruption.
pub fn load_cursor(store: &StateStore) -> Result<Option<CursorState>, StateStoreError> {
    let Some(value) = store.read_json(CURSOR_FILE)? else {
        debug!("cursor record not found; treating as first run");
        return Ok(None);
    };
    let cursor: CursorState =
        serde_json::from_value(value).map_err(|err| StateStoreError::Corrupt {
            path: CURSOR_FILE.to_string(),
            detail: err.to_string(),
        })?;
    if cursor.last_history_id.is_empty() {
        return Ok(None);
    }
    Ok(Some(cursor))
}

pub fn save_cursor(store: &StateStore, cursor: &CursorState) -> Result<(), StateStoreError> {
    let value = serde_json::to_value(cursor)
        .map_err(|err| StateStoreError::Backend(err.to_string()))?;
    store.write_json(CURSOR_FILE, &value)
}

/// Lenient by design: a malformed processed-ID record is reset to empty
/// with a warning. The unread filter absorbs the cost of re-checking.
pub fn load_processed_ids(store: &StateStore) -> BTreeSet<String> {
    let value = match store.read_json(PROCESSED_FILE) {
        Ok(Some(value)) => value,
        Ok(None) => return BTreeSet::new(),
        Err(err) => {
            warn!("failed to read processed ids: {}; resetting", err);
            return BTreeSet::new();
        }
    };
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| item.as_str().map(|s| s.to_string()))
            .collect(),
        other => {
            warn!(
                "invalid processed-ids format ({}), expected a list; resetting",
                other
            );
            BTreeSet::new()
        }
    }
}

pub fn save_processed_ids(
    store: &StateStore,
    ids: &BTreeSet<String>,
) -> Result<(), StateStoreError> {
    // BTreeSet iteration is already the deduplicated sorted sequence
    let value = Value::Array(ids.iter().map(|id| Value::String(id.clone())).collect());
    store.write_json(PROCESSED_FILE, &value)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedEntry {
    pub msg_id: String,
    pub reason: String,
    pub timestamp: String,
}

/// Message IDs eligible for retry on a later run. Insertion-ordered and
/// bounded: once full, the oldest entries are evicted first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailedLedger {
    entries: Vec<FailedEntry>,
}

impl FailedLedger {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[FailedEntry] {
        &self.entries
    }

    /// Insert or refresh an entry. Re-recording an id moves it to the
    /// newest position; reasons are truncated.
    pub fn record(&mut self, msg_id: &str, reason: &str, timestamp: &str) {
        self.remove(msg_id);
        self.entries.push(FailedEntry {
            msg_id: msg_id.to_string(),
            reason: truncate_chars(reason, MAX_REASON_CHARS),
            timestamp: timestamp.to_string(),
        });
        if self.entries.len() > MAX_FAILED_ENTRIES {
            let excess = self.entries.len() - MAX_FAILED_ENTRIES;
            self.entries.drain(..excess);
        }
    }

    pub fn remove(&mut self, msg_id: &str) {
        self.entries.retain(|entry| entry.msg_id != msg_id);
    }

    pub fn contains(&self, msg_id: &str) -> bool {
        self.entries.iter().any(|entry| entry.msg_id == msg_id)
    }

    fn from_value(value: Value) -> Result<Self, String> {
        let Value::Array(items) = value else {
            return Err(format!("expected a list, got {value}"));
        };
        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            let entry: FailedEntry =
                serde_json::from_value(item).map_err(|err| err.to_string())?;
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    fn to_value(&self) -> Value {
        serde_json::to_value(&self.entries).unwrap_or_else(|_| Value::Array(Vec::new()))
    }
}

/// Missing record: create an empty one (first run). Present but
/// malformed: corruption, surfaced to the caller.
pub fn load_failed_ledger(store: &StateStore) -> Result<FailedLedger, StateStoreError> {
    match store.read_json(FAILED_FILE)? {
        Some(value) => FailedLedger::from_value(value).map_err(|detail| StateStoreError::Corrupt {
            path: FAILED_FILE.to_string(),
            detail,
        }),
        None => {
            warn!("failed-ID ledger missing or empty; creating a new one");
            let ledger = FailedLedger::default();
            store.write_json(FAILED_FILE, &ledger.to_value())?;
            Ok(ledger)
        }
    }
}

pub fn save_failed_ledger(
    store: &StateStore,
    ledger: &FailedLedger,
) -> Result<(), StateStoreError> {
    store.write_json(FAILED_FILE, &ledger.to_value())
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}
