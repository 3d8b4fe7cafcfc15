//! Caching wrapper over a pluggable persistence backend
//!
//! The wrapper speaks typed [`ItemDescriptor`]s upward and serialized item
//! descriptors downward, so backends never parse entities. Three caches sit
//! in front of the backend (per-item, per-kind, init-state), each expiring
//! after write. Two modes:
//!
//! - **Finite TTL**: entries expire after `cache_ttl`; an expired read goes
//!   back to the backend. With [`StaleValuesPolicy::Refresh`], a backend
//!   failure serves the stale entry instead of an error.
//! - **Infinite TTL**: entries never expire and the cache is the source of
//!   truth during a backend outage; when the backend recovers, the full
//!   cached dataset is written back in one `init` before the store reports
//!   available again.
//!
//! Backend failures are broadcast as store-status transitions; a background
//! prober watches for recovery.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::errors::{Error, Result};
use crate::store::sort::sort_all_collections;
use crate::store::status::{DataStoreStatus, DataStoreStatusBroadcaster};
use crate::store::{
    DataKind, DataStore, FullDataSet, ItemDescriptor, KeyedItems, StoreItem,
};

/// A serialized store slot as persistent backends see it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedItemDescriptor {
    pub version: u64,
    pub deleted: bool,
    /// JSON of the entity (or of a tombstone placeholder).
    pub serialized_item: Option<String>,
}

/// A full serialized dataset in write order.
pub type SerializedDataSet = Vec<(DataKind, Vec<(String, SerializedItemDescriptor)>)>;

/// The interface a persistence backend implements. All methods may be called
/// from any thread; implementations do their own connection management.
pub trait PersistentDataStore: Send + Sync {
    /// Atomically (or in the given order) replaces the full dataset.
    fn init(&self, data: SerializedDataSet) -> Result<()>;

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<SerializedItemDescriptor>>;

    fn get_all(&self, kind: DataKind) -> Result<Vec<(String, SerializedItemDescriptor)>>;

    /// Version-gated write. Returns false when the backend kept an
    /// equal-or-newer version.
    fn upsert(&self, kind: DataKind, key: &str, item: SerializedItemDescriptor) -> Result<bool>;

    fn is_initialized(&self) -> Result<bool>;

    /// Cheap liveness probe used by outage recovery polling.
    fn is_available(&self) -> bool {
        self.is_initialized().is_ok()
    }
}

/// How long cached reads are trusted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheTtl {
    /// Expire entries this long after they were written to the cache.
    Finite(Duration),
    /// Never expire; the cache becomes the source of truth during outages.
    Infinite,
    /// No caching; every read hits the backend.
    Off,
}

/// What to do with an expired cache entry when the backend errors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StaleValuesPolicy {
    /// Drop it; the read fails.
    #[default]
    Evict,
    /// Serve the stale value and retry the backend next read.
    Refresh,
}

/// Construction options for [`PersistentDataStoreWrapper`].
#[derive(Clone, Copy, Debug)]
pub struct PersistentStoreConfig {
    pub cache_ttl: CacheTtl,
    pub stale_values_policy: StaleValuesPolicy,
    /// How often the recovery prober checks an unavailable backend.
    pub recovery_poll_interval: Duration,
    /// Count cache hits and misses (cheap, but off by default).
    pub record_cache_stats: bool,
}

impl Default for PersistentStoreConfig {
    fn default() -> Self {
        PersistentStoreConfig {
            cache_ttl: CacheTtl::Finite(Duration::from_secs(15)),
            stale_values_policy: StaleValuesPolicy::default(),
            recovery_poll_interval: Duration::from_millis(500),
            record_cache_stats: false,
        }
    }
}

/// Cache hit/miss counters, exposed when `record_cache_stats` is set.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

enum CacheHit<V> {
    Fresh(V),
    Stale(V),
    Miss,
}

// Expire-after-write cache. `ttl == None` means entries never expire.
struct TtlCache<K: Hash + Eq, V: Clone> {
    entries: Mutex<LruCache<K, (Instant, V)>>,
    ttl: Option<Duration>,
}

impl<K: Hash + Eq, V: Clone> TtlCache<K, V> {
    fn new(ttl: Option<Duration>) -> Self {
        TtlCache {
            // Bounded far above any realistic flag count; TTL is the real
            // eviction mechanism.
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(1 << 20).unwrap_or(NonZeroUsize::MIN),
            )),
            ttl,
        }
    }

    fn get(&self, key: &K) -> CacheHit<V> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            None => CacheHit::Miss,
            Some((written, value)) => match self.ttl {
                Some(ttl) if written.elapsed() >= ttl => CacheHit::Stale(value.clone()),
                _ => CacheHit::Fresh(value.clone()),
            },
        }
    }

    fn insert(&self, key: K, value: V) {
        self.entries.lock().put(key, (Instant::now(), value));
    }

    fn invalidate(&self, key: &K) {
        self.entries.lock().pop(key);
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }
}

pub(crate) fn serialize_descriptor(
    key: &str,
    item: &ItemDescriptor,
) -> Result<SerializedItemDescriptor> {
    let serialized = match &item.item {
        Some(StoreItem::Flag(f)) => serde_json::to_string(f.as_ref())?,
        Some(StoreItem::Segment(s)) => serde_json::to_string(s.as_ref())?,
        None => serde_json::to_string(&serde_json::json!({
            "key": key,
            "version": item.version,
            "deleted": true,
        }))?,
    };
    Ok(SerializedItemDescriptor {
        version: item.version,
        deleted: item.item.is_none(),
        serialized_item: Some(serialized),
    })
}

pub(crate) fn deserialize_descriptor(
    kind: DataKind,
    serialized: &SerializedItemDescriptor,
) -> Result<ItemDescriptor> {
    if serialized.deleted {
        return Ok(ItemDescriptor::tombstone(serialized.version));
    }
    let Some(json) = &serialized.serialized_item else {
        return Ok(ItemDescriptor::tombstone(serialized.version));
    };
    match kind {
        DataKind::Features => {
            let mut flag: crate::model::flag::FeatureFlag = serde_json::from_str(json)?;
            if flag.deleted {
                return Ok(ItemDescriptor::tombstone(flag.version));
            }
            flag.preprocess();
            Ok(ItemDescriptor::flag(flag))
        }
        DataKind::Segments => {
            let mut segment: crate::model::segment::Segment = serde_json::from_str(json)?;
            if segment.deleted {
                return Ok(ItemDescriptor::tombstone(segment.version));
            }
            segment.preprocess();
            Ok(ItemDescriptor::segment(segment))
        }
    }
}

/// The caching store wrapper. See the module docs for behavior; construct
/// with [`PersistentDataStoreWrapper::new`] from inside the client's
/// runtime so the recovery prober has an executor.
pub struct PersistentDataStoreWrapper {
    backend: Arc<dyn PersistentDataStore>,
    item_cache: Option<TtlCache<(DataKind, String), Option<ItemDescriptor>>>,
    all_cache: Option<TtlCache<DataKind, KeyedItems>>,
    init_cache: Mutex<Option<(Instant, bool)>>,
    initialized: AtomicBool,
    infinite: bool,
    policy: StaleValuesPolicy,
    broadcaster: Arc<DataStoreStatusBroadcaster>,
    stats: Option<Arc<CacheStats>>,
    recovery_poll_interval: Duration,
    runtime: Option<tokio::runtime::Handle>,
    self_ref: OnceLock<Weak<PersistentDataStoreWrapper>>,
    cache_ttl: Option<Duration>,
}

impl PersistentDataStoreWrapper {
    pub fn new(
        backend: Arc<dyn PersistentDataStore>,
        config: PersistentStoreConfig,
    ) -> Arc<PersistentDataStoreWrapper> {
        let (caching, ttl, infinite) = match config.cache_ttl {
            CacheTtl::Finite(d) => (true, Some(d), false),
            CacheTtl::Infinite => (true, None, true),
            CacheTtl::Off => (false, None, false),
        };
        let wrapper = Arc::new(PersistentDataStoreWrapper {
            backend,
            item_cache: caching.then(|| TtlCache::new(ttl)),
            all_cache: caching.then(|| TtlCache::new(ttl)),
            init_cache: Mutex::new(None),
            initialized: AtomicBool::new(false),
            infinite,
            policy: config.stale_values_policy,
            broadcaster: Arc::new(DataStoreStatusBroadcaster::new()),
            stats: config.record_cache_stats.then(|| Arc::new(CacheStats::default())),
            recovery_poll_interval: config.recovery_poll_interval,
            runtime: tokio::runtime::Handle::try_current().ok(),
            self_ref: OnceLock::new(),
            cache_ttl: ttl,
        });
        let _ = wrapper.self_ref.set(Arc::downgrade(&wrapper));
        wrapper
    }

    /// Cache counters, present when stats recording was enabled.
    pub fn cache_stats(&self) -> Option<Arc<CacheStats>> {
        self.stats.clone()
    }

    fn count_hit(&self) {
        if let Some(stats) = &self.stats {
            stats.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn count_miss(&self) {
        if let Some(stats) = &self.stats {
            stats.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    // Flags the store unavailable and starts the recovery prober. Gated on
    // the availability transition, so an error burst logs one line.
    fn report_backend_error(&self, e: &Error) {
        if !self.broadcaster.status().available {
            return;
        }
        error!(error = %e, "persistent store is unavailable; monitoring for recovery");
        self.broadcaster.update(DataStoreStatus {
            available: false,
            refresh_needed: false,
        });
        let Some(runtime) = &self.runtime else {
            warn!("no async runtime at hand; persistent store recovery polling is disabled");
            return;
        };
        let Some(weak) = self.self_ref.get().cloned() else {
            return;
        };
        let interval = self.recovery_poll_interval;
        runtime.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(wrapper) = weak.upgrade() else {
                    return;
                };
                let probe = {
                    let w = Arc::clone(&wrapper);
                    tokio::task::spawn_blocking(move || w.backend.is_available()).await
                };
                if matches!(probe, Ok(true)) {
                    let w = Arc::clone(&wrapper);
                    let recovered =
                        tokio::task::spawn_blocking(move || w.on_backend_recovered()).await;
                    if matches!(recovered, Ok(true)) {
                        return;
                    }
                }
            }
        });
    }

    // Returns true when recovery is complete and polling should stop.
    fn on_backend_recovered(&self) -> bool {
        let refresh_needed = if self.infinite {
            // The cache held the truth through the outage; push it back
            // before telling anyone the store is good again.
            match self.flush_cache_to_backend() {
                Ok(()) => {
                    info!("persistent store recovered; cached data written back");
                    false
                }
                Err(e) => {
                    warn!(error = %e, "persistent store recovery write-back failed; will retry");
                    return false;
                }
            }
        } else {
            info!("persistent store recovered; data refresh needed");
            true
        };
        self.broadcaster.update(DataStoreStatus {
            available: true,
            refresh_needed,
        });
        true
    }

    fn flush_cache_to_backend(&self) -> Result<()> {
        let Some(all_cache) = &self.all_cache else {
            return Ok(());
        };
        let mut data = SerializedDataSet::new();
        for kind in DataKind::ALL {
            let items = match all_cache.get(&kind) {
                CacheHit::Fresh(items) | CacheHit::Stale(items) => items,
                CacheHit::Miss => continue,
            };
            let mut serialized = Vec::with_capacity(items.len());
            for (key, item) in &items {
                serialized.push((key.clone(), serialize_descriptor(key, item)?));
            }
            data.push((kind, serialized));
        }
        self.backend.init(data)
    }

    fn backend_get(&self, kind: DataKind, key: &str) -> Result<Option<ItemDescriptor>> {
        match self.backend.get(kind, key) {
            Ok(Some(serialized)) => Ok(Some(deserialize_descriptor(kind, &serialized)?)),
            Ok(None) => Ok(None),
            Err(e) => {
                self.report_backend_error(&e);
                Err(e)
            }
        }
    }

    fn backend_get_all(&self, kind: DataKind) -> Result<KeyedItems> {
        match self.backend.get_all(kind) {
            Ok(items) => items
                .into_iter()
                .map(|(key, serialized)| {
                    Ok((key, deserialize_descriptor(kind, &serialized)?))
                })
                .collect(),
            Err(e) => {
                self.report_backend_error(&e);
                Err(e)
            }
        }
    }

    // In infinite mode the per-kind cache is kept current on every write so
    // the recovery write-back has a complete dataset.
    fn update_all_cache_after_write(&self, kind: DataKind, key: &str, item: &ItemDescriptor) {
        let Some(all_cache) = &self.all_cache else {
            return;
        };
        if !self.infinite {
            all_cache.invalidate(&kind);
            return;
        }
        let mut items = match all_cache.get(&kind) {
            CacheHit::Fresh(items) | CacheHit::Stale(items) => items,
            CacheHit::Miss => KeyedItems::new(),
        };
        match items.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = item.clone(),
            None => items.push((key.to_string(), item.clone())),
        }
        all_cache.insert(kind, items);
    }
}

impl DataStore for PersistentDataStoreWrapper {
    fn init(&self, data: FullDataSet) -> Result<()> {
        let sorted = sort_all_collections(data);
        let mut serialized = SerializedDataSet::new();
        for (kind, items) in &sorted {
            let mut kind_items = Vec::with_capacity(items.len());
            for (key, item) in items {
                kind_items.push((key.clone(), serialize_descriptor(key, item)?));
            }
            serialized.push((*kind, kind_items));
        }

        let backend_result = self.backend.init(serialized);

        match backend_result {
            Ok(()) => {
                self.populate_caches(&sorted);
                self.initialized.store(true, Ordering::SeqCst);
                *self.init_cache.lock() = Some((Instant::now(), true));
                Ok(())
            }
            Err(e) => {
                self.report_backend_error(&e);
                if self.infinite {
                    // Keep serving the new dataset from cache; the recovery
                    // prober writes it back when the backend returns.
                    self.populate_caches(&sorted);
                    self.initialized.store(true, Ordering::SeqCst);
                }
                Err(e)
            }
        }
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<ItemDescriptor>> {
        let Some(item_cache) = &self.item_cache else {
            return self.backend_get(kind, key);
        };
        let cache_key = (kind, key.to_string());
        match item_cache.get(&cache_key) {
            CacheHit::Fresh(item) => {
                self.count_hit();
                Ok(item)
            }
            CacheHit::Stale(stale) => match self.backend_get(kind, key) {
                Ok(item) => {
                    item_cache.insert(cache_key, item.clone());
                    Ok(item)
                }
                Err(e) => match self.policy {
                    StaleValuesPolicy::Refresh => {
                        warn!(
                            kind = %kind, key,
                            "backend read failed; serving stale cached value"
                        );
                        Ok(stale)
                    }
                    StaleValuesPolicy::Evict => {
                        item_cache.invalidate(&cache_key);
                        Err(e)
                    }
                },
            },
            CacheHit::Miss => {
                self.count_miss();
                let item = self.backend_get(kind, key)?;
                item_cache.insert(cache_key, item.clone());
                Ok(item)
            }
        }
    }

    fn get_all(&self, kind: DataKind) -> Result<KeyedItems> {
        let Some(all_cache) = &self.all_cache else {
            return self.backend_get_all(kind);
        };
        match all_cache.get(&kind) {
            CacheHit::Fresh(items) => {
                self.count_hit();
                Ok(items)
            }
            CacheHit::Stale(stale) => match self.backend_get_all(kind) {
                Ok(items) => {
                    all_cache.insert(kind, items.clone());
                    Ok(items)
                }
                Err(e) => match self.policy {
                    StaleValuesPolicy::Refresh => Ok(stale),
                    StaleValuesPolicy::Evict => {
                        all_cache.invalidate(&kind);
                        Err(e)
                    }
                },
            },
            CacheHit::Miss => {
                self.count_miss();
                let items = self.backend_get_all(kind)?;
                all_cache.insert(kind, items.clone());
                Ok(items)
            }
        }
    }

    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> Result<bool> {
        let serialized = serialize_descriptor(key, &item)?;
        match self.backend.upsert(kind, key, serialized) {
            Ok(true) => {
                if let Some(item_cache) = &self.item_cache {
                    item_cache.insert((kind, key.to_string()), Some(item.clone()));
                }
                self.update_all_cache_after_write(kind, key, &item);
                Ok(true)
            }
            Ok(false) => {
                // Lost a version race; whatever won is what readers should
                // see, so refresh from the backend.
                if let Some(item_cache) = &self.item_cache {
                    match self.backend_get(kind, key) {
                        Ok(fresh) => item_cache.insert((kind, key.to_string()), fresh),
                        Err(_) => item_cache.invalidate(&(kind, key.to_string())),
                    }
                }
                if let Some(all_cache) = &self.all_cache {
                    all_cache.invalidate(&kind);
                }
                Ok(false)
            }
            Err(e) => {
                self.report_backend_error(&e);
                if self.infinite {
                    // The cache carries the write until recovery.
                    if let Some(item_cache) = &self.item_cache {
                        item_cache.insert((kind, key.to_string()), Some(item.clone()));
                    }
                    self.update_all_cache_after_write(kind, key, &item);
                }
                Err(e)
            }
        }
    }

    fn is_initialized(&self) -> bool {
        if self.initialized.load(Ordering::SeqCst) {
            return true;
        }
        {
            let cached = self.init_cache.lock();
            if let Some((written, value)) = *cached {
                let fresh = match self.cache_ttl {
                    Some(ttl) => written.elapsed() < ttl,
                    None => true,
                };
                if fresh {
                    return value;
                }
            }
        }
        let value = self.backend.is_initialized().unwrap_or(false);
        if value {
            self.initialized.store(true, Ordering::SeqCst);
        }
        *self.init_cache.lock() = Some((Instant::now(), value));
        value
    }

    fn status_broadcaster(&self) -> Option<Arc<DataStoreStatusBroadcaster>> {
        Some(Arc::clone(&self.broadcaster))
    }

    fn close(&self) {
        if let Some(cache) = &self.item_cache {
            cache.clear();
        }
        if let Some(cache) = &self.all_cache {
            cache.clear();
        }
    }
}

impl PersistentDataStoreWrapper {
    fn populate_caches(&self, sorted: &FullDataSet) {
        if let (Some(item_cache), Some(all_cache)) = (&self.item_cache, &self.all_cache) {
            item_cache.clear();
            for (kind, items) in sorted {
                for (key, item) in items {
                    item_cache.insert((*kind, key.clone()), Some(item.clone()));
                }
                all_cache.insert(*kind, items.clone());
            }
        }
    }
}
