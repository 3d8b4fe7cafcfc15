//! Data sources: how the rule replica is kept in sync
//!
//! Three variants share one status contract and write through the same
//! [`UpdateSink`]:
//!
//! - [`streaming::StreamingDataSource`] (the default): a long-lived
//!   server-sent-events connection delivering full datasets and incremental
//!   patches.
//! - [`polling::PollingDataSource`]: periodic full-dataset fetches, for
//!   environments where streaming connections are not viable.
//! - [`null::NullDataSource`]: no synchronization at all, for offline use or
//!   when another process populates a shared persistent store.

pub mod null;
pub mod polling;
pub mod protocol;
pub mod streaming;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tracing::{error, warn};

use crate::errors::{Error, Result};
use crate::store::status::DataStoreStatusBroadcaster;
use crate::store::{DataKind, DataStore, FullDataSet, ItemDescriptor};

/// Lifecycle state of a data source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataSourceState {
    /// Starting up; no data applied yet.
    Initializing,
    /// Connected and current.
    Valid,
    /// Temporarily disrupted; retrying. The replica may be stale but is
    /// still served.
    Interrupted,
    /// Permanently stopped (unrecoverable error or shutdown).
    Off,
}

/// Classification of a data-source failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorInfoKind {
    /// The service returned an HTTP error status.
    ErrorResponse,
    /// A connection could not be established or died.
    NetworkError,
    /// A payload could not be parsed.
    InvalidData,
    /// The local data store rejected a write.
    StoreError,
    Unknown,
}

/// Details of the most recent failure, carried in the status.
#[derive(Clone, Debug)]
pub struct ErrorInfo {
    pub kind: ErrorInfoKind,
    pub status_code: Option<u16>,
    pub message: String,
    pub time: DateTime<Utc>,
}

impl ErrorInfo {
    pub fn new(kind: ErrorInfoKind, message: impl Into<String>) -> ErrorInfo {
        ErrorInfo {
            kind,
            status_code: None,
            message: message.into(),
            time: Utc::now(),
        }
    }

    pub fn http(status_code: u16, message: impl Into<String>) -> ErrorInfo {
        ErrorInfo {
            kind: ErrorInfoKind::ErrorResponse,
            status_code: Some(status_code),
            message: message.into(),
            time: Utc::now(),
        }
    }
}

/// A data source's externally visible status.
#[derive(Clone, Debug)]
pub struct DataSourceStatus {
    pub state: DataSourceState,
    pub state_since: DateTime<Utc>,
    pub last_error: Option<ErrorInfo>,
}

impl Default for DataSourceStatus {
    fn default() -> Self {
        DataSourceStatus {
            state: DataSourceState::Initializing,
            state_since: Utc::now(),
            last_error: None,
        }
    }
}

/// Holds the current data-source status and fans transitions out.
#[derive(Debug)]
pub struct DataSourceStatusBroadcaster {
    current: RwLock<DataSourceStatus>,
    sender: broadcast::Sender<DataSourceStatus>,
}

impl Default for DataSourceStatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl DataSourceStatusBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        DataSourceStatusBroadcaster {
            current: RwLock::new(DataSourceStatus::default()),
            sender,
        }
    }

    pub fn status(&self) -> DataSourceStatus {
        self.current.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DataSourceStatus> {
        self.sender.subscribe()
    }

    /// Records a state transition, with two normalizations: `Interrupted`
    /// before the first `Valid` stays `Initializing` (a source that never
    /// connected is still initializing), and nothing leaves `Off`.
    pub fn update(&self, state: DataSourceState, error: Option<ErrorInfo>) {
        let mut current = self.current.write();
        let new_state = match (current.state, state) {
            (DataSourceState::Off, _) => DataSourceState::Off,
            (DataSourceState::Initializing, DataSourceState::Interrupted) => {
                DataSourceState::Initializing
            }
            (_, s) => s,
        };
        let changed = new_state != current.state;
        if changed {
            current.state = new_state;
            current.state_since = Utc::now();
        }
        // A repeat of the current state with no new error (e.g. a stream of
        // successful writes while already VALID) is not a transition.
        if !changed && error.is_none() {
            return;
        }
        if let Some(e) = error {
            current.last_error = Some(e);
        }
        let snapshot = current.clone();
        drop(current);
        let _ = self.sender.send(snapshot);
    }
}

/// The write side of the replica, shared by every data-source variant. It
/// owns the store handle and the status broadcaster, and funnels store
/// failures into status transitions.
pub struct UpdateSink {
    store: Arc<dyn DataStore>,
    status: Arc<DataSourceStatusBroadcaster>,
}

impl UpdateSink {
    pub fn new(store: Arc<dyn DataStore>, status: Arc<DataSourceStatusBroadcaster>) -> UpdateSink {
        UpdateSink { store, status }
    }

    /// Replaces the full dataset.
    pub fn init(&self, data: FullDataSet) -> Result<()> {
        self.store.init(data).inspect_err(|e| {
            error!(error = %e, "failed to apply full dataset to data store");
        })
    }

    /// Applies one upsert (entity or tombstone). Discarded stale versions
    /// are not errors.
    pub fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> Result<()> {
        match self.store.upsert(kind, key, item) {
            Ok(_) => Ok(()),
            Err(e) => {
                error!(kind = %kind, key, error = %e, "failed to apply update to data store");
                Err(e)
            }
        }
    }

    pub fn update_status(&self, state: DataSourceState, error: Option<ErrorInfo>) {
        self.status.update(state, error);
    }

    pub fn status_broadcaster(&self) -> Arc<DataSourceStatusBroadcaster> {
        Arc::clone(&self.status)
    }

    /// The store's availability broadcaster, when the store can fail.
    pub fn store_status_broadcaster(&self) -> Option<Arc<DataStoreStatusBroadcaster>> {
        self.store.status_broadcaster()
    }

    pub fn store_is_initialized(&self) -> bool {
        self.store.is_initialized()
    }
}

/// Initialization outcome, published through the watch channel returned by
/// [`DataSource::start`]: `None` while pending, then `Some(true)` on the
/// first applied dataset or `Some(false)` on permanent failure.
pub type InitSignal = watch::Receiver<Option<bool>>;

/// The lifecycle every data-source variant implements.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Starts background synchronization. Idempotent; the same signal is
    /// returned on repeat calls.
    fn start(&self) -> InitSignal;

    /// Whether a full dataset has ever been applied.
    fn is_initialized(&self) -> bool;

    /// Stops synchronization. Idempotent.
    async fn close(&self);
}

/// Waits on an [`InitSignal`] until it resolves.
pub async fn await_init(mut signal: InitSignal) -> bool {
    loop {
        if let Some(result) = *signal.borrow() {
            return result;
        }
        if signal.changed().await.is_err() {
            return false;
        }
    }
}

// Recoverable per the shared classification: 400, 408, 429, and all 5xx
// except 501. Everything else latches the source off.
pub(crate) fn is_http_error_recoverable(status: u16) -> bool {
    match status {
        400 | 408 | 429 => true,
        501 => false,
        s => (500..600).contains(&s),
    }
}

pub(crate) fn log_connection_result(kind: &str, recoverable: bool, status: u16) {
    if recoverable {
        warn!(status, "{kind} request returned a recoverable error; will retry");
    } else {
        error!(
            status,
            "{kind} request returned an unrecoverable error; giving up permanently"
        );
    }
}

pub(crate) fn store_error_info(e: &Error) -> ErrorInfo {
    ErrorInfo::new(ErrorInfoKind::StoreError, e.to_string())
}
