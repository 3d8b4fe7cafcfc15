//! Big segments: externally stored membership
//!
//! Segments too large to replicate locally keep their membership in an
//! external store. The wrapper caches per-context membership snapshots in a
//! fixed-size LRU, fetching synchronously on a miss, and a background
//! poller watches the store's metadata to classify it healthy, stale, or
//! erroring. The evaluator tags every result that touched big-segment data
//! with the status it observed.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::eval::{BigSegmentMembership, BigSegmentsQuery, BigSegmentsStatus, MembershipResult};
use crate::events::now_millis;

/// Store metadata used for staleness tracking.
#[derive(Clone, Copy, Debug, Default)]
pub struct BigSegmentStoreMetadata {
    /// When the external process last synced membership, in epoch millis.
    pub last_up_to_date: Option<u64>,
}

/// The interface an external membership store implements.
pub trait BigSegmentStore: Send + Sync {
    fn get_metadata(&self) -> Result<BigSegmentStoreMetadata>;

    /// Membership for one context key, or `None` when the store has no
    /// record of the context.
    fn get_membership(&self, context_key: &str) -> Result<Option<BigSegmentMembership>>;
}

/// Health of the big-segment store as a whole.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BigSegmentStoreStatus {
    pub available: bool,
    /// The external process has not synced within `stale_after`.
    pub stale: bool,
}

/// Options for [`BigSegmentStoreWrapper`].
#[derive(Clone)]
pub struct BigSegmentsConfig {
    /// Store implementation to wrap.
    pub store: Arc<dyn BigSegmentStore>,
    /// Per-context membership cache entries.
    pub context_cache_size: usize,
    pub status_poll_interval: Duration,
    /// How far behind the store's sync timestamp may lag before results are
    /// tagged stale.
    pub stale_after: Duration,
}

impl std::fmt::Debug for BigSegmentsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigSegmentsConfig")
            .field("context_cache_size", &self.context_cache_size)
            .field("status_poll_interval", &self.status_poll_interval)
            .field("stale_after", &self.stale_after)
            .finish()
    }
}

impl BigSegmentsConfig {
    pub fn new(store: Arc<dyn BigSegmentStore>) -> BigSegmentsConfig {
        BigSegmentsConfig {
            store,
            context_cache_size: 1_000,
            status_poll_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(120),
        }
    }
}

pub struct BigSegmentStoreWrapper {
    store: Arc<dyn BigSegmentStore>,
    cache: Mutex<LruCache<String, Arc<BigSegmentMembership>>>,
    stale_after: Duration,
    status: RwLock<Option<BigSegmentStoreStatus>>,
    status_tx: broadcast::Sender<BigSegmentStoreStatus>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl BigSegmentStoreWrapper {
    pub fn new(config: BigSegmentsConfig) -> Arc<BigSegmentStoreWrapper> {
        let (status_tx, _) = broadcast::channel(16);
        let wrapper = Arc::new(BigSegmentStoreWrapper {
            store: Arc::clone(&config.store),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(config.context_cache_size.max(1))
                    .unwrap_or(NonZeroUsize::MIN),
            )),
            stale_after: config.stale_after,
            status: RwLock::new(None),
            status_tx,
            poll_task: Mutex::new(None),
        });

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let weak = Arc::downgrade(&wrapper);
            let interval = config.status_poll_interval.max(Duration::from_millis(10));
            *wrapper.poll_task.lock() = Some(runtime.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(wrapper) = weak.upgrade() else {
                        return;
                    };
                    let _ = tokio::task::spawn_blocking(move || wrapper.poll_store_status()).await;
                }
            }));
        } else {
            warn!("no async runtime at hand; big segment staleness polling is disabled");
        }
        wrapper
    }

    fn compute_status(&self) -> BigSegmentStoreStatus {
        match self.store.get_metadata() {
            Ok(metadata) => {
                let stale = match metadata.last_up_to_date {
                    Some(t) => now_millis().saturating_sub(t) >= self.stale_after.as_millis() as u64,
                    None => true,
                };
                BigSegmentStoreStatus {
                    available: true,
                    stale,
                }
            }
            Err(e) => {
                warn!(error = %e, "big segment store status query failed");
                BigSegmentStoreStatus {
                    available: false,
                    stale: false,
                }
            }
        }
    }

    fn poll_store_status(&self) {
        let new_status = self.compute_status();
        let mut current = self.status.write();
        if *current != Some(new_status) {
            debug!(?new_status, "big segment store status changed");
            *current = Some(new_status);
            drop(current);
            let _ = self.status_tx.send(new_status);
        }
    }

    /// The current store status, probing the store on first use.
    pub fn status(&self) -> BigSegmentStoreStatus {
        if let Some(status) = *self.status.read() {
            return status;
        }
        let status = self.compute_status();
        *self.status.write() = Some(status);
        status
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BigSegmentStoreStatus> {
        self.status_tx.subscribe()
    }

    pub async fn close(&self) {
        if let Some(task) = self.poll_task.lock().take() {
            task.abort();
        }
    }

    fn status_tag(&self) -> BigSegmentsStatus {
        let status = self.status();
        if !status.available {
            BigSegmentsStatus::StoreError
        } else if status.stale {
            BigSegmentsStatus::Stale
        } else {
            BigSegmentsStatus::Healthy
        }
    }
}

impl BigSegmentsQuery for BigSegmentStoreWrapper {
    fn query_membership(&self, context_key: &str) -> MembershipResult {
        if let Some(membership) = self.cache.lock().get(context_key) {
            return MembershipResult {
                membership: Some(Arc::clone(membership)),
                status: self.status_tag(),
            };
        }
        match self.store.get_membership(context_key) {
            Ok(membership) => {
                // Absent membership caches as empty so each unknown context
                // costs one store query per cache lifetime.
                let membership = Arc::new(membership.unwrap_or_default());
                self.cache
                    .lock()
                    .put(context_key.to_string(), Arc::clone(&membership));
                MembershipResult {
                    membership: Some(membership),
                    status: self.status_tag(),
                }
            }
            Err(e) => {
                warn!(error = %e, context_key, "big segment membership query failed");
                MembershipResult {
                    membership: None,
                    status: BigSegmentsStatus::StoreError,
                }
            }
        }
    }
}
