//! Data store availability signalling
//!
//! A persistent store wrapper broadcasts availability transitions here; the
//! data source subscribes so it can force a full refresh when a store comes
//! back without the data it missed.

use parking_lot::RwLock;
use tokio::sync::broadcast;

/// One availability observation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataStoreStatus {
    /// Whether the store is currently usable.
    pub available: bool,
    /// Set on recovery when writes may have been lost while the store was
    /// down, so the replica must be refreshed from the source.
    pub refresh_needed: bool,
}

impl Default for DataStoreStatus {
    fn default() -> Self {
        DataStoreStatus {
            available: true,
            refresh_needed: false,
        }
    }
}

/// Holds the current store status and fans transitions out to subscribers.
#[derive(Debug)]
pub struct DataStoreStatusBroadcaster {
    current: RwLock<DataStoreStatus>,
    sender: broadcast::Sender<DataStoreStatus>,
}

impl Default for DataStoreStatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl DataStoreStatusBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        DataStoreStatusBroadcaster {
            current: RwLock::new(DataStoreStatus::default()),
            sender,
        }
    }

    pub fn status(&self) -> DataStoreStatus {
        *self.current.read()
    }

    /// Subscribes to transitions; the current status must be read
    /// separately with [`Self::status`].
    pub fn subscribe(&self) -> broadcast::Receiver<DataStoreStatus> {
        self.sender.subscribe()
    }

    /// Publishes a status if it differs from the current one.
    pub fn update(&self, status: DataStoreStatus) {
        {
            let mut current = self.current.write();
            if *current == status {
                return;
            }
            *current = status;
        }
        // Send failures just mean nobody is listening.
        let _ = self.sender.send(status);
    }
}
