//! State persisted across restarts of the host.
//!
//! Holds, per workspace or notebook scope, the pid and port of the last
//! server we launched (for recovery on the next launch) and the package
//! manager the user last picked. Stored as one JSON file, rewritten whole
//! on every change.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Errors from reading or writing the state file.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid state file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persisted values for one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_manager: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    scopes: BTreeMap<String, ScopeState>,
}

/// Compute the stable key for a workspace or file path.
///
/// Returns the first 12 hex characters of the SHA-256 of the path.
pub fn scope_key(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hex::encode(&hasher.finalize()[..6])
}

/// Get the default path to the state file.
pub fn default_state_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("marimo-host")
        .join("state.json")
}

/// JSON-file backed store for [`ScopeState`].
pub struct StateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> StateFile {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!("[state] Ignoring unreadable state file {:?}: {}", self.path, e);
                StateFile::default()
            }),
            Err(_) => StateFile::default(),
        }
    }

    fn write_file(&self, file: &StateFile) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(file)?)?;
        Ok(())
    }

    /// Read the state for `scope`, or defaults if nothing was stored.
    pub fn get(&self, scope: &str) -> ScopeState {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read_file().scopes.remove(scope).unwrap_or_default()
    }

    /// Apply `change` to the state for `scope` and persist the result.
    pub fn update<F>(&self, scope: &str, change: F) -> Result<ScopeState, StateError>
    where
        F: FnOnce(&mut ScopeState),
    {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = self.read_file();
        let entry = file.scopes.entry(scope.to_string()).or_default();
        change(entry);
        let updated = entry.clone();
        if updated == ScopeState::default() {
            file.scopes.remove(scope);
        }
        self.write_file(&file)?;
        debug!("[state] Updated scope {}: {:?}", scope, updated);
        Ok(updated)
    }

    /// Record the server we just launched for `scope`.
    pub fn record_server(&self, scope: &str, pid: u32, port: u16) -> Result<(), StateError> {
        self.update(scope, |state| {
            state.server_pid = Some(pid);
            state.server_port = Some(port);
        })
        .map(|_| ())
    }

    /// Forget the server recorded for `scope`.
    pub fn clear_server(&self, scope: &str) -> Result<(), StateError> {
        self.update(scope, |state| {
            state.server_pid = None;
            state.server_port = None;
        })
        .map(|_| ())
    }

    pub fn package_manager(&self, scope: &str) -> Option<String> {
        self.get(scope).package_manager
    }

    pub fn set_package_manager(&self, scope: &str, manager: &str) -> Result<(), StateError> {
        self.update(scope, |state| state.package_manager = Some(manager.to_string()))
            .map(|_| ())
    }
}
