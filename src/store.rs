use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::stream::{DebridAutoplayInfo, SelectedStreamMemo};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to write state file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Key-value storage for state that must survive restarts.
///
/// Values are plain JSON so any backing technology can hold them. Typed access
/// goes through [`Key`].
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Option<Value>;

    /// `None` removes the key
    fn set(&mut self, key: &str, value: Option<Value>) -> Result<(), StoreError>;
}

/// A store key bound to the type stored under it.
pub struct Key<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T: DeserializeOwned + Serialize> Key<T> {
    /// Read and decode the value. A value that no longer decodes is treated as
    /// absent.
    pub fn read(&self, store: &dyn KeyValueStore) -> Option<T> {
        let value = store.get(self.name)?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key = self.name, error = %e, "ignoring undecodable stored value");
                None
            }
        }
    }

    pub fn write(
        &self,
        store: &mut dyn KeyValueStore,
        value: Option<&T>,
    ) -> Result<(), StoreError> {
        let value = value.map(serde_json::to_value).transpose()?;
        store.set(self.name, value)
    }

    pub fn clear(&self, store: &mut dyn KeyValueStore) -> Result<(), StoreError> {
        store.set(self.name, None)
    }
}

/// Episode list and position of the debrid session being binged
pub const DEBRID_AUTOPLAY_INFO: Key<DebridAutoplayInfo> = Key::new("sea-autoplay-info");

/// Last stream picked by the user, with the batch cursor when it was a batch
pub const SELECTED_STREAM: Key<SelectedStreamMemo> = Key::new("sea-autoplay-selected-stream");

/// Keeps every key in one JSON object on disk, rewritten on each change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Map<String, Value>,
}

impl JsonFileStore {
    /// Open the store, starting empty when the file is missing or unreadable
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = Self::load(&path);
        Self { path, entries }
    }

    fn load(path: &Path) -> Map<String, Value> {
        if !path.exists() {
            return Map::new();
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(entries) => {
                    debug!(path = %path.display(), "loaded persisted state");
                    entries
                }
                Err(e) => {
                    error!("failed to parse state file: {}", e);
                    Map::new()
                }
            },
            Err(e) => {
                error!("failed to read state file: {}", e);
                Map::new()
            }
        }
    }

    fn save(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).filter(|v| !v.is_null()).cloned()
    }

    fn set(&mut self, key: &str, value: Option<Value>) -> Result<(), StoreError> {
        match value {
            Some(v) => {
                self.entries.insert(key.to_string(), v);
            }
            None => {
                if self.entries.remove(key).is_none() {
                    return Ok(());
                }
            }
        }
        self.save()
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: HashMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Option<Value>) -> Result<(), StoreError> {
        match value {
            Some(v) => self.entries.insert(key.to_string(), v),
            None => self.entries.remove(key),
        };
        Ok(())
    }
}
