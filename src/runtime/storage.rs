//! Snapshot stores, atomic writes, and configuration persistence
//!
//! [`SnapshotStore`] is the durable key/value capability the runtime needs.
//! Two implementations ship with the crate: [`MemoryStore`] for tests and
//! single-process hosts, and [`FileStore`] which keeps one file per key and
//! replaces it atomically via temp file and rename.

use anyhow::{Context, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::RuntimeConfig;
use super::error::{StoreError, StoreResult};

/// Durable blob storage keyed by string
pub trait SnapshotStore: Send + Sync {
    /// Fetch a blob; `Ok(None)` when the key has never been written
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Vec<u8>>>>;

    /// Store a blob, replacing any previous value
    fn put<'a>(&'a self, key: &'a str, blob: Vec<u8>) -> BoxFuture<'a, StoreResult<()>>;
}

impl<S: SnapshotStore + ?Sized> SnapshotStore for Arc<S> {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Vec<u8>>>> {
        (**self).get(key)
    }

    fn put<'a>(&'a self, key: &'a str, blob: Vec<u8>) -> BoxFuture<'a, StoreResult<()>> {
        (**self).put(key, blob)
    }
}

/// In-process store with access counters
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    gets: AtomicUsize,
    puts: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get` calls served so far
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Number of `put` calls served so far
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Make every subsequent call fail (or succeed again)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Write a blob directly, bypassing the counters
    pub fn insert(&self, key: impl Into<String>, blob: Vec<u8>) {
        self.entries.lock().insert(key.into(), blob);
    }

    /// Read a blob directly, bypassing the counters
    pub fn peek(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().get(key).cloned()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store disabled".to_string()));
        }
        Ok(())
    }
}

impl SnapshotStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Vec<u8>>>> {
        async move {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.check_available()?;
            Ok::<_, StoreError>(self.entries.lock().get(key).cloned())
        }
        .boxed()
    }

    fn put<'a>(&'a self, key: &'a str, blob: Vec<u8>) -> BoxFuture<'a, StoreResult<()>> {
        async move {
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.check_available()?;
            self.entries.lock().insert(key.to_string(), blob);
            Ok::<_, StoreError>(())
        }
        .boxed()
    }
}

/// Directory-backed store, one file per key
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a key is stored at
    ///
    /// Every non-empty key maps to its own file directly under the root.
    /// Keys ending in `.tmp` are refused since that name is used for
    /// in-flight writes.
    pub fn path_for(&self, key: &str) -> StoreResult<PathBuf> {
        if key.is_empty() || key.ends_with(".tmp") {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(file_name(key)))
    }
}

/// Percent-encode `key` into a single file name.
///
/// Bytes outside `[A-Za-z0-9._-]` become `%XX`, and so does a leading `.`.
/// `%` itself is encoded, so the mapping is reversible.
fn file_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len());
    for (index, byte) in key.bytes().enumerate() {
        let plain = byte.is_ascii_alphanumeric()
            || byte == b'-'
            || byte == b'_'
            || (byte == b'.' && index > 0);
        if plain {
            name.push(char::from(byte));
        } else {
            name.push_str(&format!("%{:02X}", byte));
        }
    }
    name
}

impl SnapshotStore for FileStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Vec<u8>>>> {
        async move {
            let path = self.path_for(key)?;
            tokio::task::spawn_blocking(move || match fs::read(&path) {
                Ok(data) => Ok(Some(data)),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
                Err(err) => Err(StoreError::Io(err)),
            })
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
        }
        .boxed()
    }

    fn put<'a>(&'a self, key: &'a str, blob: Vec<u8>) -> BoxFuture<'a, StoreResult<()>> {
        async move {
            let path = self.path_for(key)?;
            tokio::task::spawn_blocking(move || {
                write_atomic(&path, &blob).map_err(|e| StoreError::AtomicWriteFailed {
                    path: path.clone(),
                    detail: format!("{:#}", e),
                })
            })
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
        }
        .boxed()
    }
}

/// Write data atomically to a file
///
/// Creates a temporary file, writes the data, syncs, then renames
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");

    let mut file = File::create(&temp_path)
        .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;

    file.write_all(data).context("Failed to write data")?;

    file.sync_all().context("Failed to sync file")?;

    drop(file);

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

    if let Some(parent) = path.parent() {
        let dir = OpenOptions::new()
            .read(true)
            .open(parent)
            .with_context(|| format!("Failed to open directory: {:?}", parent))?;

        dir.sync_all().context("Failed to sync directory")?;
    }

    Ok(())
}

/// Write runtime configuration as pretty JSON
pub fn write_config(path: &Path, config: &RuntimeConfig) -> Result<()> {
    let json = serde_json::to_vec_pretty(config).context("Failed to serialize config")?;

    write_atomic(path, &json)?;

    Ok(())
}

/// Load runtime configuration
pub fn load_config(path: &Path) -> Result<RuntimeConfig> {
    let data = fs::read(path).with_context(|| format!("Failed to read config: {:?}", path))?;
    let config: RuntimeConfig =
        serde_json::from_slice(&data).context("Failed to deserialize config")?;

    Ok(config)
}
