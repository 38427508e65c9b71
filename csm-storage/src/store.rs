//! File-backed variable store.
//!
//! All variables live in a single JSON file (`variables.json`) holding the
//! entries and a crc32c checksum over them. Every mutation rewrites the whole
//! file through a temporary file and an atomic rename, so a crash never leaves
//! a half-written file behind.
//!
//! Writes are synchronous and run on the calling thread (an instance's tokio
//! worker), with an fsync per write unless `fsync` is off. They cost one full
//! serialization of the store, so keep persistent variables few and small.
//! A mutation is applied to a copy that is written while holding only an
//! upgradable read lock: readers are not blocked by the I/O, writers are
//! serialized, and a failed write leaves the in-memory state untouched.

use crate::error::StorageError;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

const STORE_FILE: &str = "variables.json";
const STORE_VERSION: u32 = 1;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the store file.
    pub dir: PathBuf,
    /// Sync the file to disk on every write.
    pub fsync: bool,
}

impl StoreConfig {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            fsync: true,
        }
    }

    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }
}

/// On-disk layout.
#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    updated_at: i64,
    checksum: String,
    variables: BTreeMap<String, Value>,
}

/// Durable key/value store for persistent variables.
pub struct VariableStore {
    config: StoreConfig,
    variables: RwLock<BTreeMap<String, Value>>,
}

impl VariableStore {
    /// Opens or creates a store at the configured directory.
    pub fn open(config: StoreConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.dir)?;

        let store = Self {
            config,
            variables: RwLock::new(BTreeMap::new()),
        };
        store.load()?;

        tracing::info!(
            "Opened variable store at {} with {} variables",
            store.config.dir.display(),
            store.len()
        );

        Ok(store)
    }

    fn load(&self) -> Result<(), StorageError> {
        let path = self.file_path();
        if !path.exists() {
            return Ok(());
        }

        let file = File::open(&path)?;
        let stored: StoreFile = serde_json::from_reader(BufReader::new(file))?;

        if stored.version != STORE_VERSION {
            return Err(StorageError::Corruption(format!(
                "unsupported store version {} in {}",
                stored.version,
                path.display()
            )));
        }

        let actual = checksum(&stored.variables)?;
        if actual != stored.checksum {
            return Err(StorageError::Corruption(format!(
                "{} checksum mismatch: expected {}, got {}",
                path.display(),
                stored.checksum,
                actual
            )));
        }

        *self.variables.write() = stored.variables;
        Ok(())
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.variables.read().get(key).cloned()
    }

    /// Returns true if `key` exists.
    pub fn contains(&self, key: &str) -> bool {
        self.variables.read().contains_key(key)
    }

    /// Creates a new entry. Fails if the key already exists.
    pub fn create(&self, key: &str, value: Value) -> Result<usize, StorageError> {
        self.mutate(|variables| {
            if variables.contains_key(key) {
                return Err(StorageError::KeyExists(key.to_string()));
            }
            let written = value.to_string().len();
            variables.insert(key.to_string(), value);
            Ok(written)
        })
    }

    /// Replaces an existing entry. Fails if the key does not exist.
    pub fn put(&self, key: &str, value: Value) -> Result<usize, StorageError> {
        self.mutate(|variables| match variables.get_mut(key) {
            Some(slot) => {
                let written = value.to_string().len();
                *slot = value;
                Ok(written)
            }
            None => Err(StorageError::KeyNotFound(key.to_string())),
        })
    }

    /// Removes an entry. Fails if the key does not exist.
    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.mutate(|variables| {
            variables
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| StorageError::KeyNotFound(key.to_string()))
        })
    }

    /// Applies `change` to a copy of the entries, persists the copy and then
    /// publishes it.
    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut BTreeMap<String, Value>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let current = self.variables.upgradable_read();
        let mut next = current.clone();
        let out = change(&mut next)?;

        let next = self.persist(next)?;
        *RwLockUpgradableReadGuard::upgrade(current) = next;
        Ok(out)
    }

    /// Returns all entries whose key starts with `prefix`.
    pub fn scan_prefix(&self, prefix: &str) -> Vec<(String, Value)> {
        self.variables
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.variables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.read().is_empty()
    }

    /// Returns the path of the store file.
    pub fn file_path(&self) -> PathBuf {
        self.config.dir.join(STORE_FILE)
    }

    /// Writes the given entries to disk and hands them back.
    fn persist(
        &self,
        variables: BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>, StorageError> {
        let stored = StoreFile {
            version: STORE_VERSION,
            updated_at: chrono::Utc::now().timestamp_millis(),
            checksum: checksum(&variables)?,
            variables,
        };
        let data = serde_json::to_vec_pretty(&stored)?;

        let path = self.file_path();
        let tmp_path = path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&data)?;
            if self.config.fsync {
                file.sync_all()?;
            }
        }
        fs::rename(&tmp_path, &path)?;

        tracing::debug!(
            "Saved {} variables ({} bytes) to {}",
            stored.variables.len(),
            data.len(),
            path.display()
        );

        Ok(stored.variables)
    }
}

fn checksum(variables: &BTreeMap<String, Value>) -> Result<String, StorageError> {
    let bytes = serde_json::to_vec(variables)?;
    Ok(format!("{:08x}", crc32c::crc32c(&bytes)))
}
