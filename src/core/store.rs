//! String-keyed persistent storage.
//!
//! The quota counter, onboarding flag, sandbox entitlement and custom coaches
//! all live behind [`KeyValueStore`]. [`FileStore`] keeps them in a small TOML
//! table in the platform data directory; [`MemoryStore`] is used by tests and
//! by `--ephemeral` sessions.

use directories::ProjectDirs;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tempfile::NamedTempFile;

/// Errors surfaced by a [`KeyValueStore`].
#[derive(Debug)]
pub enum StoreError {
    /// The backing file exists but could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The backing file is not a valid table of strings.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// The new contents could not be written.
    Write {
        path: PathBuf,
        source: Box<dyn StdError + Send + Sync>,
    },

    /// The in-process lock was poisoned by a panicking writer.
    Poisoned,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Read { path, source } => {
                write!(f, "Failed to read store at {}: {}", path.display(), source)
            }
            StoreError::Parse { path, source } => {
                write!(f, "Failed to parse store at {}: {}", path.display(), source)
            }
            StoreError::Write { path, source } => {
                write!(f, "Failed to write store at {}: {}", path.display(), source)
            }
            StoreError::Poisoned => write!(f, "Store lock poisoned"),
        }
    }
}

impl StdError for StoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            StoreError::Read { source, .. } => Some(source),
            StoreError::Parse { source, .. } => Some(source),
            StoreError::Write { source, .. } => Some(source.as_ref()),
            StoreError::Poisoned => None,
        }
    }
}

/// Durable string-to-string storage. No transactions are offered.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// TOML-backed store. Every `set` rewrites the file atomically.
pub struct FileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Store file in the platform data directory, if one can be determined.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "coachai", "coachai")
            .map(|dirs| dirs.data_dir().join("store.toml"))
    }

    fn read_table(&self) -> Result<BTreeMap<String, String>, StoreError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = fs::read_to_string(&self.path).map_err(|source| StoreError::Read {
            path: self.path.clone(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn write_table(&self, table: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let wrap = |source: Box<dyn StdError + Send + Sync>| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        let parent = self.path.parent().filter(|dir| !dir.as_os_str().is_empty());
        if let Some(dir) = parent {
            fs::create_dir_all(dir).map_err(|e| wrap(Box::new(e)))?;
        }

        let contents = toml::to_string(table).map_err(|e| wrap(Box::new(e)))?;
        let mut temp_file = match parent {
            Some(dir) => NamedTempFile::new_in(dir),
            None => NamedTempFile::new(),
        }
        .map_err(|e| wrap(Box::new(e)))?;

        temp_file
            .write_all(contents.as_bytes())
            .map_err(|e| wrap(Box::new(e)))?;
        temp_file
            .as_file_mut()
            .sync_all()
            .map_err(|e| wrap(Box::new(e)))?;
        temp_file
            .persist(&self.path)
            .map_err(|e| wrap(Box::new(e)))?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(self.read_table()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        // A corrupt file is replaced rather than blocking every future write.
        let mut table = match self.read_table() {
            Ok(table) => table,
            Err(StoreError::Parse { .. }) => BTreeMap::new(),
            Err(err) => return Err(err),
        };
        table.insert(key.to_string(), value.to_string());
        self.write_table(&table)
    }
}
