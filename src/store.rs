//! Versioned storage for flags and segments.
//!
//! [`DataStore`] is the narrow interface persistent stores (e.g. database-backed caches)
//! implement. [`InMemoryDataStore`] is the store the SDK serves evaluations from.
use std::{
    collections::HashMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::{changeset::ObjectKind, Result};

/// A stored object version. `item` is `None` for a deleted object: the tombstone keeps its
/// version so that older updates arriving later are still rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemDescriptor {
    /// Version of the item.
    pub version: u64,
    /// The item, or `None` if it was deleted.
    pub item: Option<serde_json::Value>,
}

impl ItemDescriptor {
    /// A live object.
    pub fn new(version: u64, item: serde_json::Value) -> ItemDescriptor {
        ItemDescriptor {
            version,
            item: Some(item),
        }
    }

    /// A deletion placeholder.
    pub fn deleted(version: u64) -> ItemDescriptor {
        ItemDescriptor {
            version,
            item: None,
        }
    }

    /// Returns `true` for deletion placeholders.
    pub fn is_deleted(&self) -> bool {
        self.item.is_none()
    }
}

/// All items of one kind, by key.
pub type KeyedItems = HashMap<String, ItemDescriptor>;

/// Full contents of a store.
pub type AllData = HashMap<ObjectKind, KeyedItems>;

/// How the data system may use a persistent store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataStoreMode {
    /// Only read from the store; another process keeps it up to date.
    #[default]
    Read,
    /// Read from the store until fresh data arrives, and write every update through to it.
    ReadWrite,
}

/// A store of versioned flag and segment data.
pub trait DataStore: Send + Sync {
    /// Replace the store's contents. All previous data is discarded, regardless of versions.
    fn init(&self, all_data: AllData) -> Result<()>;

    /// Insert or update an item. The item is only written if `item.version` is greater than the
    /// stored version. Returns whether the item was written.
    fn upsert(&self, kind: ObjectKind, key: &str, item: ItemDescriptor) -> Result<bool>;

    /// Get an item, including deletion placeholders.
    fn get(&self, kind: ObjectKind, key: &str) -> Result<Option<ItemDescriptor>>;

    /// Get all items of a kind, including deletion placeholders.
    fn all(&self, kind: ObjectKind) -> Result<KeyedItems>;

    /// Returns `true` once the store has been initialized with a full data set.
    fn is_initialized(&self) -> bool;
}

#[derive(Debug, Default)]
struct MemoryContents {
    data: AllData,
    initialized: bool,
}

/// Thread-safe in-memory [`DataStore`].
#[derive(Debug, Default)]
pub struct InMemoryDataStore {
    contents: RwLock<MemoryContents>,
}

impl InMemoryDataStore {
    /// Create an empty, uninitialized store.
    pub fn new() -> Self {
        InMemoryDataStore::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryContents> {
        // A poisoned lock only means a writer panicked; the map itself is still consistent
        // because every write replaces whole entries.
        match self.contents.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryContents> {
        match self.contents.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Apply a batch of version-gated upserts under a single write lock, so readers never observe
    /// a partially applied batch. Returns the number of items written.
    pub fn apply_delta(&self, items: Vec<(ObjectKind, String, ItemDescriptor)>) -> usize {
        let mut contents = self.write();
        let mut written = 0;
        for (kind, key, item) in items {
            if upsert_into(&mut contents.data, kind, &key, item) {
                written += 1;
            }
        }
        written
    }
}

fn upsert_into(data: &mut AllData, kind: ObjectKind, key: &str, item: ItemDescriptor) -> bool {
    let items = data.entry(kind).or_default();
    match items.get(key) {
        Some(existing) if existing.version >= item.version => false,
        _ => {
            items.insert(key.to_owned(), item);
            true
        }
    }
}

impl DataStore for InMemoryDataStore {
    fn init(&self, all_data: AllData) -> Result<()> {
        let mut contents = self.write();
        contents.data = all_data;
        contents.initialized = true;
        Ok(())
    }

    fn upsert(&self, kind: ObjectKind, key: &str, item: ItemDescriptor) -> Result<bool> {
        Ok(upsert_into(&mut self.write().data, kind, key, item))
    }

    fn get(&self, kind: ObjectKind, key: &str) -> Result<Option<ItemDescriptor>> {
        Ok(self
            .read()
            .data
            .get(&kind)
            .and_then(|items| items.get(key))
            .cloned())
    }

    fn all(&self, kind: ObjectKind) -> Result<KeyedItems> {
        Ok(self.read().data.get(&kind).cloned().unwrap_or_default())
    }

    fn is_initialized(&self) -> bool {
        self.read().initialized
    }
}
