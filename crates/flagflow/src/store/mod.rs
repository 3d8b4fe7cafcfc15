//! Local storage of the rule replica
//!
//! The data store holds the SDK's eventually-consistent copy of all flags
//! and segments, keyed by a [`DataKind`] and a string key. The default store
//! is in-memory ([`memory::InMemoryDataStore`]); deployments that share a
//! replica across processes wrap a pluggable backend with
//! [`persistent::PersistentDataStoreWrapper`].
//!
//! Writes are version gated: an update only lands if its version is higher
//! than what the store already holds, and deletions are retained as
//! versioned tombstones so an out-of-order upsert cannot resurrect an item.

pub mod memory;
pub mod persistent;
pub mod sort;
pub mod status;

use std::sync::Arc;

use crate::errors::Result;
use crate::eval::EvaluationStore;
use crate::model::flag::FeatureFlag;
use crate::model::segment::Segment;

/// The category of a stored item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataKind {
    Features,
    Segments,
}

impl DataKind {
    /// All kinds in dependency order: segments never reference flags, so
    /// they are written first during full-dataset initialization.
    pub const ALL: [DataKind; 2] = [DataKind::Segments, DataKind::Features];

    /// Stable namespace string, used by persistent backends and logs.
    pub fn namespace(self) -> &'static str {
        match self {
            DataKind::Features => "features",
            DataKind::Segments => "segments",
        }
    }
}

impl std::fmt::Display for DataKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.namespace())
    }
}

/// A stored entity.
#[derive(Clone, Debug)]
pub enum StoreItem {
    Flag(Arc<FeatureFlag>),
    Segment(Arc<Segment>),
}

impl StoreItem {
    pub fn version(&self) -> u64 {
        match self {
            StoreItem::Flag(f) => f.version,
            StoreItem::Segment(s) => s.version,
        }
    }
}

/// A versioned store slot: either a live item or a deletion tombstone.
#[derive(Clone, Debug)]
pub struct ItemDescriptor {
    pub version: u64,
    /// `None` marks a tombstone at `version`.
    pub item: Option<StoreItem>,
}

impl ItemDescriptor {
    pub fn flag(flag: FeatureFlag) -> ItemDescriptor {
        ItemDescriptor {
            version: flag.version,
            item: Some(StoreItem::Flag(Arc::new(flag))),
        }
    }

    pub fn segment(segment: Segment) -> ItemDescriptor {
        ItemDescriptor {
            version: segment.version,
            item: Some(StoreItem::Segment(Arc::new(segment))),
        }
    }

    pub fn tombstone(version: u64) -> ItemDescriptor {
        ItemDescriptor {
            version,
            item: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.item.is_none()
    }
}

/// Key/descriptor pairs for one kind, in a meaningful order where the
/// producer guarantees one (see [`sort`]).
pub type KeyedItems = Vec<(String, ItemDescriptor)>;

/// A complete dataset, as delivered by a stream `put` or a poll response.
pub type FullDataSet = Vec<(DataKind, KeyedItems)>;

/// The store interface used by ingestion and evaluation.
///
/// `get`/`get_all` must be safe for concurrent callers; writes arrive
/// serialized from the data-source task.
pub trait DataStore: Send + Sync {
    /// Replaces the entire dataset.
    fn init(&self, data: FullDataSet) -> Result<()>;

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<ItemDescriptor>>;

    fn get_all(&self, kind: DataKind) -> Result<KeyedItems>;

    /// Version-gated upsert. Returns false when the store already held an
    /// equal-or-newer version and the write was discarded.
    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> Result<bool>;

    /// Whether a full dataset has ever been stored.
    fn is_initialized(&self) -> bool;

    /// Availability transitions, for stores that can fail (persistent
    /// wrappers). `None` means the store cannot fail and reports nothing.
    fn status_broadcaster(&self) -> Option<Arc<status::DataStoreStatusBroadcaster>> {
        None
    }

    fn close(&self) {}
}

/// Adapts a [`DataStore`] to the evaluator's read-only view, unwrapping
/// descriptors and hiding tombstones.
pub struct EvaluationStoreAdapter(pub Arc<dyn DataStore>);

impl EvaluationStore for EvaluationStoreAdapter {
    fn get_flag(&self, key: &str) -> Result<Option<Arc<FeatureFlag>>> {
        Ok(match self.0.get(DataKind::Features, key)? {
            Some(ItemDescriptor {
                item: Some(StoreItem::Flag(f)),
                ..
            }) => Some(f),
            _ => None,
        })
    }

    fn get_segment(&self, key: &str) -> Result<Option<Arc<Segment>>> {
        Ok(match self.0.get(DataKind::Segments, key)? {
            Some(ItemDescriptor {
                item: Some(StoreItem::Segment(s)),
                ..
            }) => Some(s),
            _ => None,
        })
    }
}
