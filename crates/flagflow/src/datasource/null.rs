//! The do-nothing data source
//!
//! Used when the SDK is offline, or in daemon mode where another process
//! keeps a shared persistent store current and this process only reads.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::info;

use crate::datasource::{DataSource, DataSourceState, InitSignal, UpdateSink};

pub struct NullDataSource {
    sink: Arc<UpdateSink>,
    init_rx: InitSignal,
}

impl NullDataSource {
    pub fn new(sink: Arc<UpdateSink>) -> NullDataSource {
        info!("no data source configured; the SDK will not receive rule updates");
        let (init_tx, init_rx) = watch::channel(Some(true));
        drop(init_tx);
        NullDataSource { sink, init_rx }
    }
}

#[async_trait]
impl DataSource for NullDataSource {
    fn start(&self) -> InitSignal {
        self.sink.update_status(DataSourceState::Valid, None);
        self.init_rx.clone()
    }

    fn is_initialized(&self) -> bool {
        true
    }

    async fn close(&self) {
        self.sink.update_status(DataSourceState::Off, None);
    }
}
