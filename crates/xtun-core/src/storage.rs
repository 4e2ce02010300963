//! Storage collaborator
//!
//! The host application owns persistence; the core only reads and writes a
//! handful of keys through this trait.

use crate::descriptor::{ConnectionMode, ServerDescriptor};
use crate::session::SessionHistory;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// Id of the last server a connect was configured for
pub const SELECTED_SERVER_KEY: &str = "selectedServer";
/// Stored [`ConnectionMode`]
pub const CONNECTION_MODE_KEY: &str = "connectionMode";
/// Stored [`SessionHistory`]
pub const SESSION_HISTORY_KEY: &str = "sessionHistory";

const SERVERS_FILE: &str = "servers.json";

/// Storage errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(String),

    #[error("Storage serialization error: {0}")]
    Serialization(String),
}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Key/value and server-list persistence.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn load_servers(&self) -> Result<Vec<ServerDescriptor>, StorageError>;

    async fn save_servers(&self, servers: &[ServerDescriptor]) -> Result<(), StorageError>;

    /// Value stored under `key`, `None` if never written.
    async fn load(&self, key: &str) -> Result<Option<Value>, StorageError>;

    async fn save(&self, key: &str, value: Value) -> Result<(), StorageError>;
}

/// Stored connection mode; unreadable or missing values fall back to the default.
pub async fn load_mode(storage: &dyn Storage) -> ConnectionMode {
    match storage.load(CONNECTION_MODE_KEY).await {
        Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
            warn!("Ignoring stored connection mode: {}", e);
            ConnectionMode::default()
        }),
        Ok(None) => ConnectionMode::default(),
        Err(e) => {
            warn!("Could not load connection mode: {}", e);
            ConnectionMode::default()
        }
    }
}

/// Stored session history; unreadable values give an empty history.
pub async fn load_history(storage: &dyn Storage) -> SessionHistory {
    match storage.load(SESSION_HISTORY_KEY).await {
        Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
            warn!("Discarding stored session history: {}", e);
            SessionHistory::new()
        }),
        Ok(None) => SessionHistory::new(),
        Err(e) => {
            warn!("Could not load session history: {}", e);
            SessionHistory::new()
        }
    }
}

/// Stored server the last connect was configured for.
///
/// `None` when nothing was selected or the selection is no longer in the
/// server list.
pub async fn load_selected_server(storage: &dyn Storage) -> Result<Option<ServerDescriptor>, StorageError> {
    let Some(value) = storage.load(SELECTED_SERVER_KEY).await? else {
        return Ok(None);
    };
    let Value::String(id) = value else {
        warn!("Ignoring stored server selection {}", value);
        return Ok(None);
    };

    let selected = storage
        .load_servers()
        .await?
        .into_iter()
        .find(|server| server.id == id);
    if selected.is_none() {
        warn!("Selected server {} is no longer stored", id);
    }
    Ok(selected)
}

/// One JSON file per key under a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StorageError::Io(format!("invalid storage key {:?}", key)));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }

    async fn read(path: &Path) -> Result<Option<Value>, StorageError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write through a sibling temp file so readers never see half a value.
    async fn write(&self, path: &Path, value: &Value) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let bytes = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn load_servers(&self) -> Result<Vec<ServerDescriptor>, StorageError> {
        match Self::read(&self.dir.join(SERVERS_FILE)).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save_servers(&self, servers: &[ServerDescriptor]) -> Result<(), StorageError> {
        let value = serde_json::to_value(servers)?;
        self.write(&self.dir.join(SERVERS_FILE), &value).await
    }

    async fn load(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Self::read(&self.key_path(key)?).await
    }

    async fn save(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let path = self.key_path(key)?;
        self.write(&path, &value).await
    }
}

/// Process-local storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, Value>>,
    servers: Mutex<Vec<ServerDescriptor>>,
    fail_writes: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make writes fail, as a full or read-only store would.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Current value under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        lock(&self.values).get(key).cloned()
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            Err(StorageError::Io("storage is read-only".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load_servers(&self) -> Result<Vec<ServerDescriptor>, StorageError> {
        Ok(lock(&self.servers).clone())
    }

    async fn save_servers(&self, servers: &[ServerDescriptor]) -> Result<(), StorageError> {
        self.check_writable()?;
        *lock(&self.servers) = servers.to_vec();
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.get(key))
    }

    async fn save(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.check_writable()?;
        lock(&self.values).insert(key.to_string(), value);
        Ok(())
    }
}
