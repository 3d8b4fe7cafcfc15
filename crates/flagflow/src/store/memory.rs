//! The default in-memory data store

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::errors::Result;
use crate::store::{DataKind, DataStore, FullDataSet, ItemDescriptor, KeyedItems};

/// Holds the rule replica in process memory. Reads are lock-cheap clones of
/// `Arc`ed entities; writes are serialized by the data-source task. This
/// store cannot fail and therefore reports no status.
#[derive(Debug, Default)]
pub struct InMemoryDataStore {
    data: RwLock<HashMap<DataKind, HashMap<String, ItemDescriptor>>>,
    initialized: AtomicBool,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        InMemoryDataStore::default()
    }
}

impl DataStore for InMemoryDataStore {
    fn init(&self, data: FullDataSet) -> Result<()> {
        let mut map = HashMap::new();
        for (kind, items) in data {
            map.insert(kind, items.into_iter().collect());
        }
        for kind in DataKind::ALL {
            map.entry(kind).or_default();
        }
        *self.data.write() = map;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<ItemDescriptor>> {
        Ok(self
            .data
            .read()
            .get(&kind)
            .and_then(|items| items.get(key))
            .cloned())
    }

    fn get_all(&self, kind: DataKind) -> Result<KeyedItems> {
        Ok(self
            .data
            .read()
            .get(&kind)
            .map(|items| {
                items
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> Result<bool> {
        let mut data = self.data.write();
        let items = data.entry(kind).or_default();
        match items.get(key) {
            Some(existing) if existing.version >= item.version => Ok(false),
            _ => {
                items.insert(key.to_string(), item);
                Ok(true)
            }
        }
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::flag::FeatureFlag;
    use serde_json::json;

    fn flag(key: &str, version: u64) -> ItemDescriptor {
        let f: FeatureFlag =
            serde_json::from_value(json!({"key": key, "version": version})).unwrap();
        ItemDescriptor::flag(f)
    }

    fn put(store: &InMemoryDataStore, items: Vec<(&str, u64)>) {
        store
            .init(vec![
                (DataKind::Segments, vec![]),
                (
                    DataKind::Features,
                    items
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), flag(k, v)))
                        .collect(),
                ),
            ])
            .unwrap();
    }

    #[test]
    fn test_not_initialized_until_init() {
        let store = InMemoryDataStore::new();
        assert!(!store.is_initialized());
        put(&store, vec![]);
        assert!(store.is_initialized());
    }

    #[test]
    fn test_init_replaces_entire_dataset() {
        let store = InMemoryDataStore::new();
        put(&store, vec![("a", 1), ("b", 1)]);
        put(&store, vec![("c", 1)]);
        assert!(store.get(DataKind::Features, "a").unwrap().is_none());
        assert!(store.get(DataKind::Features, "c").unwrap().is_some());
    }

    #[test]
    fn test_init_is_idempotent() {
        let store = InMemoryDataStore::new();
        put(&store, vec![("a", 2)]);
        let before: Vec<_> = {
            let mut all = store.get_all(DataKind::Features).unwrap();
            all.sort_by(|x, y| x.0.cmp(&y.0));
            all.iter().map(|(k, d)| (k.clone(), d.version)).collect()
        };
        put(&store, vec![("a", 2)]);
        let after: Vec<_> = {
            let mut all = store.get_all(DataKind::Features).unwrap();
            all.sort_by(|x, y| x.0.cmp(&y.0));
            all.iter().map(|(k, d)| (k.clone(), d.version)).collect()
        };
        assert_eq!(before, after);
    }

    #[test]
    fn test_upsert_is_version_gated() {
        let store = InMemoryDataStore::new();
        put(&store, vec![]);
        assert!(store.upsert(DataKind::Features, "a", flag("a", 5)).unwrap());
        // Older and equal versions are discarded.
        assert!(!store.upsert(DataKind::Features, "a", flag("a", 4)).unwrap());
        assert!(!store.upsert(DataKind::Features, "a", flag("a", 5)).unwrap());
        assert_eq!(store.get(DataKind::Features, "a").unwrap().unwrap().version, 5);
    }

    #[test]
    fn test_tombstone_suppresses_resurrection() {
        let store = InMemoryDataStore::new();
        put(&store, vec![("a", 5)]);
        assert!(store
            .upsert(DataKind::Features, "a", ItemDescriptor::tombstone(6))
            .unwrap());
        // The stale original arrives late; the tombstone must win.
        assert!(!store.upsert(DataKind::Features, "a", flag("a", 5)).unwrap());
        let got = store.get(DataKind::Features, "a").unwrap().unwrap();
        assert!(got.is_tombstone());
        assert_eq!(got.version, 6);
    }

    #[test]
    fn test_highest_version_wins_regardless_of_arrival_order() {
        let store = InMemoryDataStore::new();
        put(&store, vec![]);
        for version in [7u64, 3, 9, 2, 8] {
            let _ = store.upsert(DataKind::Features, "a", flag("a", version));
        }
        assert_eq!(store.get(DataKind::Features, "a").unwrap().unwrap().version, 9);
    }
}
