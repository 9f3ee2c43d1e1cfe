//! Where synchronizers deliver change sets.
use std::sync::{Arc, OnceLock, RwLock};

use crate::{
    changeset::{Change, ChangeSet, ChangeType, IntentCode, ObjectKind},
    status::{DataSourceState, DataSourceStatusReporter, ErrorInfo, ErrorKind},
    store::{AllData, DataStore, DataStoreMode, InMemoryDataStore, ItemDescriptor, KeyedItems},
    Result, Selector,
};

/// Receives change sets from initializers and synchronizers.
///
/// Implementations must apply each call atomically: readers never observe half of a change set.
pub trait DataDestination: Send + Sync {
    /// Replace all existing data with `changes`. Returns `false` if the update failed.
    fn set_basis(&self, changes: Vec<Change>, selector: Selector, persist: bool) -> bool;

    /// Merge `changes` into the existing data. Returns `false` if the update failed.
    fn apply_delta(&self, changes: Vec<Change>, selector: Selector, persist: bool) -> bool;
}

/// Deliver a change set according to its intent: a full transfer replaces everything, changes
/// are merged, and `none` means the data is already current.
pub(crate) fn apply_change_set(destination: &dyn DataDestination, change_set: ChangeSet, persist: bool) {
    let (intent_code, changes, selector) = change_set.into_parts();
    match intent_code {
        IntentCode::TransferFull => {
            destination.set_basis(changes, selector, persist);
        }
        IntentCode::TransferChanges => {
            destination.apply_delta(changes, selector, persist);
        }
        IntentCode::None => {}
    }
}

/// A full data snapshot produced by an initializer.
#[derive(Debug, Clone, PartialEq)]
pub struct Basis {
    /// Every item of the snapshot.
    pub changes: Vec<Change>,
    /// Selector of the snapshot.
    pub selector: Selector,
    /// Whether the snapshot should be written to a persistent store.
    pub persist: bool,
}

struct PersistentBinding {
    store: Arc<dyn DataStore>,
    mode: DataStoreMode,
}

/// The standard [`DataDestination`]: an in-memory store, optionally backed by a persistent
/// store.
///
/// Until fresh data has been received, reads are served from the persistent store (if any).
/// Afterwards reads come from memory, and with [`DataStoreMode::ReadWrite`] every update is
/// written through to the persistent store.
pub struct StoreDestination {
    memory: InMemoryDataStore,
    persistent: OnceLock<PersistentBinding>,
    selector: RwLock<Selector>,
    status_reporter: Arc<dyn DataSourceStatusReporter>,
}

impl StoreDestination {
    /// Create a destination backed only by memory.
    pub fn new(status_reporter: Arc<dyn DataSourceStatusReporter>) -> StoreDestination {
        StoreDestination {
            memory: InMemoryDataStore::new(),
            persistent: OnceLock::new(),
            selector: RwLock::new(Selector::none()),
            status_reporter,
        }
    }

    /// Attach a persistent store. Only the first call has an effect; returns whether the store
    /// was attached.
    pub fn attach_persistent_store(&self, store: Arc<dyn DataStore>, mode: DataStoreMode) -> bool {
        self.persistent
            .set(PersistentBinding { store, mode })
            .is_ok()
    }

    /// Selector of the most recently applied change set.
    pub fn selector(&self) -> Selector {
        match self.selector.read() {
            Ok(selector) => selector.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Returns `true` if reads are currently served from the persistent store.
    pub fn reading_from_persistent_store(&self) -> bool {
        !self.memory.is_initialized() && self.persistent.get().is_some()
    }

    /// Returns `true` once data is available, either fresh or from the persistent store.
    pub fn is_initialized(&self) -> bool {
        self.memory.is_initialized()
            || self
                .persistent
                .get()
                .is_some_and(|binding| binding.store.is_initialized())
    }

    /// Get an item, including deletion placeholders.
    pub fn get(&self, kind: ObjectKind, key: &str) -> Result<Option<ItemDescriptor>> {
        match self.read_source() {
            Some(store) => store.get(kind, key),
            None => self.memory.get(kind, key),
        }
    }

    /// Get all items of a kind, including deletion placeholders.
    pub fn all(&self, kind: ObjectKind) -> Result<KeyedItems> {
        match self.read_source() {
            Some(store) => store.all(kind),
            None => self.memory.all(kind),
        }
    }

    /// Persistent store to read from, or `None` to read from memory.
    fn read_source(&self) -> Option<&dyn DataStore> {
        if self.memory.is_initialized() {
            return None;
        }
        self.persistent.get().map(|binding| binding.store.as_ref())
    }

    fn set_selector(&self, selector: Selector) {
        let mut slot = match self.selector.write() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = selector;
    }

    /// Run `write` against the persistent store if it accepts writes. Failures are reported as an
    /// interruption and logged.
    fn write_through(&self, write: impl FnOnce(&dyn DataStore) -> Result<()>) -> bool {
        let Some(binding) = self.persistent.get() else {
            return true;
        };
        if binding.mode != DataStoreMode::ReadWrite {
            return true;
        }

        match write(binding.store.as_ref()) {
            Ok(()) => true,
            Err(err) => {
                log::warn!(target: "flagsync", "failed to update persistent store: {}", err);
                self.status_reporter.update_status(
                    DataSourceState::Interrupted,
                    Some(ErrorInfo::new(ErrorKind::StoreError, err.to_string())),
                );
                false
            }
        }
    }
}

fn descriptor(change: Change) -> (ObjectKind, String, ItemDescriptor) {
    let item = match change.action {
        ChangeType::Put => ItemDescriptor {
            version: change.version,
            item: change.object,
        },
        ChangeType::Delete => ItemDescriptor::deleted(change.version),
    };
    (change.kind, change.key, item)
}

/// Build a complete data set from a full transfer. Every known kind is present, so kinds with no
/// items end up empty. If a key appears twice, the higher version wins.
fn collect_full_data(changes: Vec<Change>) -> AllData {
    let mut all_data: AllData = ObjectKind::ALL
        .iter()
        .map(|kind| (*kind, KeyedItems::new()))
        .collect();

    for change in changes {
        let (kind, key, item) = descriptor(change);
        let items = all_data.entry(kind).or_default();
        match items.get(&key) {
            Some(existing) if existing.version >= item.version => {}
            _ => {
                items.insert(key, item);
            }
        }
    }

    all_data
}

impl DataDestination for StoreDestination {
    fn set_basis(&self, changes: Vec<Change>, selector: Selector, persist: bool) -> bool {
        let all_data = collect_full_data(changes);
        log::debug!(target: "flagsync",
            flags = all_data.get(&ObjectKind::Flag).map_or(0, |items| items.len()),
            segments = all_data.get(&ObjectKind::Segment).map_or(0, |items| items.len());
            "replacing data");

        let persisted = if persist {
            let to_persist = all_data.clone();
            // The in-memory store cannot fail.
            let _ = self.memory.init(all_data);
            self.write_through(|store| store.init(to_persist))
        } else {
            let _ = self.memory.init(all_data);
            true
        };

        self.set_selector(selector);
        persisted
    }

    fn apply_delta(&self, changes: Vec<Change>, selector: Selector, persist: bool) -> bool {
        let items: Vec<_> = changes.into_iter().map(descriptor).collect();
        let to_persist = persist.then(|| items.clone());

        let written = self.memory.apply_delta(items);
        log::debug!(target: "flagsync", written = written; "applied delta");

        let persisted = match to_persist {
            Some(items) => self.write_through(|store| {
                for (kind, key, item) in items {
                    store.upsert(kind, &key, item)?;
                }
                Ok(())
            }),
            None => true,
        };

        self.set_selector(selector);
        persisted
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::{DataDestination, StoreDestination};
    use crate::{
        changeset::{Change, ObjectKind},
        status::{DataSourceState, ErrorKind},
        store::{
            AllData, DataStore, DataStoreMode, InMemoryDataStore, ItemDescriptor, KeyedItems,
        },
        test_support::RecordingReporter,
        Error, Result, Selector,
    };

    struct FailingStore;

    impl DataStore for FailingStore {
        fn init(&self, _all_data: AllData) -> Result<()> {
            Err(Error::Store("disk full".to_owned()))
        }
        fn upsert(&self, _kind: ObjectKind, _key: &str, _item: ItemDescriptor) -> Result<bool> {
            Err(Error::Store("disk full".to_owned()))
        }
        fn get(&self, _kind: ObjectKind, _key: &str) -> Result<Option<ItemDescriptor>> {
            Ok(None)
        }
        fn all(&self, _kind: ObjectKind) -> Result<KeyedItems> {
            Ok(KeyedItems::new())
        }
        fn is_initialized(&self) -> bool {
            false
        }
    }

    fn destination() -> (StoreDestination, Arc<RecordingReporter>) {
        let reporter = Arc::new(RecordingReporter::default());
        (StoreDestination::new(reporter.clone()), reporter)
    }

    #[test]
    fn full_transfer_leaves_exactly_the_new_items() {
        let (destination, _) = destination();
        destination.set_basis(
            vec![
                Change::put(ObjectKind::Flag, "old", 1, json!({})),
                Change::put(ObjectKind::Segment, "seg", 1, json!({})),
            ],
            Selector::new("s1", 1),
            true,
        );

        destination.set_basis(
            vec![
                Change::put(ObjectKind::Flag, "a", 1, json!({"a": 1})),
                Change::put(ObjectKind::Flag, "b", 1, json!({"b": 1})),
            ],
            Selector::new("s2", 2),
            true,
        );

        let flags = destination.all(ObjectKind::Flag).unwrap();
        let mut keys: Vec<_> = flags.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["a".to_owned(), "b".to_owned()]);
        assert!(destination.all(ObjectKind::Segment).unwrap().is_empty());
        assert_eq!(destination.selector(), Selector::new("s2", 2));
    }

    #[test]
    fn full_transfer_ignores_stored_versions() {
        let (destination, _) = destination();
        destination.set_basis(
            vec![Change::put(ObjectKind::Flag, "a", 10, json!("new"))],
            Selector::new("s1", 1),
            true,
        );

        destination.set_basis(
            vec![Change::put(ObjectKind::Flag, "a", 3, json!("reset"))],
            Selector::new("s2", 2),
            true,
        );

        assert_eq!(
            destination.get(ObjectKind::Flag, "a").unwrap(),
            Some(ItemDescriptor::new(3, json!("reset")))
        );
    }

    #[test]
    fn delta_leaves_other_keys_untouched() {
        let (destination, _) = destination();
        destination.set_basis(
            vec![
                Change::put(ObjectKind::Flag, "a", 1, json!("a1")),
                Change::put(ObjectKind::Flag, "b", 1, json!("b1")),
                Change::put(ObjectKind::Segment, "s", 1, json!("s1")),
            ],
            Selector::new("s1", 1),
            true,
        );

        destination.apply_delta(
            vec![
                Change::put(ObjectKind::Flag, "a", 2, json!("a2")),
                Change::delete(ObjectKind::Segment, "s", 2),
            ],
            Selector::new("s2", 2),
            true,
        );

        assert_eq!(
            destination.get(ObjectKind::Flag, "a").unwrap(),
            Some(ItemDescriptor::new(2, json!("a2")))
        );
        assert_eq!(
            destination.get(ObjectKind::Flag, "b").unwrap(),
            Some(ItemDescriptor::new(1, json!("b1")))
        );
        assert!(destination
            .get(ObjectKind::Segment, "s")
            .unwrap()
            .unwrap()
            .is_deleted());
    }

    #[test]
    fn highest_version_wins_regardless_of_arrival_order() {
        let (destination, _) = destination();
        destination.set_basis(vec![], Selector::new("s0", 0), true);

        for version in [3, 7, 2, 7, 5] {
            destination.apply_delta(
                vec![Change::put(ObjectKind::Flag, "a", version, json!(version))],
                Selector::new(format!("s{version}"), version),
                true,
            );
        }

        assert_eq!(
            destination.get(ObjectKind::Flag, "a").unwrap(),
            Some(ItemDescriptor::new(7, json!(7)))
        );
    }

    #[test]
    fn duplicate_keys_in_full_transfer_keep_highest_version() {
        let (destination, _) = destination();

        destination.set_basis(
            vec![
                Change::put(ObjectKind::Flag, "a", 2, json!("v2")),
                Change::put(ObjectKind::Flag, "a", 1, json!("v1")),
            ],
            Selector::new("s1", 1),
            true,
        );

        assert_eq!(destination.get(ObjectKind::Flag, "a").unwrap().unwrap().version, 2);
    }

    #[test]
    fn reads_from_persistent_store_until_fresh_data_arrives() {
        let (destination, _) = destination();
        let persistent = Arc::new(InMemoryDataStore::new());
        persistent
            .init(AllData::from([(
                ObjectKind::Flag,
                KeyedItems::from([("cached".to_owned(), ItemDescriptor::new(1, json!("cached")))]),
            )]))
            .unwrap();
        destination.attach_persistent_store(persistent.clone(), DataStoreMode::ReadWrite);

        assert!(destination.reading_from_persistent_store());
        assert!(destination.is_initialized());
        assert!(destination.get(ObjectKind::Flag, "cached").unwrap().is_some());

        destination.set_basis(
            vec![Change::put(ObjectKind::Flag, "fresh", 1, json!("fresh"))],
            Selector::new("s1", 1),
            true,
        );

        assert!(!destination.reading_from_persistent_store());
        assert!(destination.get(ObjectKind::Flag, "cached").unwrap().is_none());
        // Written through to the persistent store as well.
        assert!(persistent.get(ObjectKind::Flag, "fresh").unwrap().is_some());
        assert!(persistent.get(ObjectKind::Flag, "cached").unwrap().is_none());
    }

    #[test]
    fn read_only_store_is_never_written() {
        let (destination, _) = destination();
        let persistent = Arc::new(InMemoryDataStore::new());
        destination.attach_persistent_store(persistent.clone(), DataStoreMode::Read);

        destination.set_basis(
            vec![Change::put(ObjectKind::Flag, "a", 1, json!({}))],
            Selector::new("s1", 1),
            true,
        );

        assert!(!persistent.is_initialized());
        assert!(persistent.get(ObjectKind::Flag, "a").unwrap().is_none());
    }

    #[test]
    fn unpersisted_updates_skip_the_persistent_store() {
        let (destination, _) = destination();
        let persistent = Arc::new(InMemoryDataStore::new());
        destination.attach_persistent_store(persistent.clone(), DataStoreMode::ReadWrite);

        destination.apply_delta(
            vec![Change::put(ObjectKind::Flag, "a", 1, json!({}))],
            Selector::new("s1", 1),
            false,
        );

        assert!(persistent.get(ObjectKind::Flag, "a").unwrap().is_none());
        assert!(destination.memory.get(ObjectKind::Flag, "a").unwrap().is_some());
    }

    #[test]
    fn store_failure_is_reported_as_interruption() {
        let (destination, reporter) = destination();
        destination.attach_persistent_store(Arc::new(FailingStore), DataStoreMode::ReadWrite);

        let ok = destination.set_basis(
            vec![Change::put(ObjectKind::Flag, "a", 1, json!({}))],
            Selector::new("s1", 1),
            true,
        );

        assert!(!ok);
        // Memory is still updated.
        assert!(destination.get(ObjectKind::Flag, "a").unwrap().is_some());
        let updates = reporter.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, DataSourceState::Interrupted);
        assert_eq!(updates[0].1.as_ref().unwrap().kind, ErrorKind::StoreError);
    }

    #[test]
    fn persistent_store_can_only_be_attached_once() {
        let (destination, _) = destination();

        assert!(destination
            .attach_persistent_store(Arc::new(InMemoryDataStore::new()), DataStoreMode::Read));
        assert!(!destination
            .attach_persistent_store(Arc::new(InMemoryDataStore::new()), DataStoreMode::Read));
    }
}
