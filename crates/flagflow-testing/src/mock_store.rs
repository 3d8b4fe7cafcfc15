//! In-memory persistence backend with fault injection

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use flagflow::errors::{Error, Result};
use flagflow::store::persistent::{
    PersistentDataStore, SerializedDataSet, SerializedItemDescriptor,
};
use flagflow::store::DataKind;

/// A [`PersistentDataStore`] that lives in process memory. Toggle
/// [`MockPersistentStore::set_failing`] to simulate a backend outage and
/// exercise the wrapper's caching and recovery paths.
#[derive(Default)]
pub struct MockPersistentStore {
    data: RwLock<HashMap<(DataKind, String), SerializedItemDescriptor>>,
    inited: AtomicBool,
    failing: AtomicBool,
    queries: AtomicU64,
}

impl MockPersistentStore {
    pub fn new() -> MockPersistentStore {
        MockPersistentStore::default()
    }

    /// While failing, every operation returns an error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of read queries served (for cache assertions).
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    /// Direct inspection of the stored serialized form.
    pub fn raw_get(&self, kind: DataKind, key: &str) -> Option<SerializedItemDescriptor> {
        self.data.read().get(&(kind, key.to_string())).cloned()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(Error::Store("mock store is failing".to_string()))
        } else {
            Ok(())
        }
    }
}

impl PersistentDataStore for MockPersistentStore {
    fn init(&self, data: SerializedDataSet) -> Result<()> {
        self.check()?;
        let mut map = HashMap::new();
        for (kind, items) in data {
            for (key, item) in items {
                map.insert((kind, key), item);
            }
        }
        *self.data.write() = map;
        self.inited.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<SerializedItemDescriptor>> {
        self.check()?;
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.data.read().get(&(kind, key.to_string())).cloned())
    }

    fn get_all(&self, kind: DataKind) -> Result<Vec<(String, SerializedItemDescriptor)>> {
        self.check()?;
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .data
            .read()
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|((_, key), item)| (key.clone(), item.clone()))
            .collect())
    }

    fn upsert(&self, kind: DataKind, key: &str, item: SerializedItemDescriptor) -> Result<bool> {
        self.check()?;
        let mut data = self.data.write();
        let slot = (kind, key.to_string());
        match data.get(&slot) {
            Some(existing) if existing.version >= item.version => Ok(false),
            _ => {
                data.insert(slot, item);
                Ok(true)
            }
        }
    }

    fn is_initialized(&self) -> Result<bool> {
        self.check()?;
        Ok(self.inited.load(Ordering::SeqCst))
    }
}
