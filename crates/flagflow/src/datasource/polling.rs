//! Polling data source
//!
//! The fallback synchronization mode: fetch the full dataset from `/all` on
//! a fixed interval. Conditional requests keep the common case cheap; a 304
//! means nothing changed and nothing is written.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::datasource::protocol::AllData;
use crate::datasource::{
    is_http_error_recoverable, log_connection_result, store_error_info, DataSource,
    DataSourceState, ErrorInfo, ErrorInfoKind, InitSignal, UpdateSink,
};

/// Intervals below this are ignored (with a warning) to protect the
/// service; tests may bypass via the hidden config field.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Options for [`PollingDataSource`].
#[derive(Clone, Copy, Debug)]
pub struct PollingConfig {
    pub poll_interval: Duration,
    /// Test hook: allow intervals under [`MIN_POLL_INTERVAL`].
    #[doc(hidden)]
    pub bypass_minimum_poll_interval: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        PollingConfig {
            poll_interval: MIN_POLL_INTERVAL,
            bypass_minimum_poll_interval: false,
        }
    }
}

pub struct PollingDataSource {
    sink: Arc<UpdateSink>,
    http: reqwest::Client,
    poll_uri: String,
    interval: Duration,
    init_tx: Arc<watch::Sender<Option<bool>>>,
    init_rx: InitSignal,
    initialized: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingDataSource {
    pub fn new(
        sink: Arc<UpdateSink>,
        http: reqwest::Client,
        polling_base_uri: &str,
        payload_filter: Option<&str>,
        config: PollingConfig,
    ) -> PollingDataSource {
        let interval = if config.poll_interval < MIN_POLL_INTERVAL
            && !config.bypass_minimum_poll_interval
        {
            warn!(
                requested = ?config.poll_interval,
                minimum = ?MIN_POLL_INTERVAL,
                "configured poll interval is below the minimum; using the minimum"
            );
            MIN_POLL_INTERVAL
        } else {
            config.poll_interval
        };
        let mut poll_uri = format!("{}/all", polling_base_uri.trim_end_matches('/'));
        if let Some(filter) = payload_filter {
            poll_uri.push_str("?filter=");
            poll_uri.push_str(filter);
        }
        let (init_tx, init_rx) = watch::channel(None);
        let (shutdown_tx, _) = watch::channel(false);
        PollingDataSource {
            sink,
            http,
            poll_uri,
            interval,
            init_tx: Arc::new(init_tx),
            init_rx,
            initialized: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            started: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl DataSource for PollingDataSource {
    fn start(&self) -> InitSignal {
        if !self.started.swap(true, Ordering::SeqCst) {
            let worker = PollWorker {
                sink: Arc::clone(&self.sink),
                http: self.http.clone(),
                uri: self.poll_uri.clone(),
                init_tx: Arc::clone(&self.init_tx),
                initialized: Arc::clone(&self.initialized),
                etag: None,
            };
            let interval = self.interval;
            let mut shutdown = self.shutdown_tx.subscribe();
            *self.task.lock() = Some(tokio::spawn(async move {
                let mut worker = worker;
                loop {
                    if worker.poll_once().await == PollOutcome::PermanentFailure {
                        return;
                    }
                    tokio::select! {
                        () = tokio::time::sleep(interval) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            }));
        }
        self.init_rx.clone()
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.sink.update_status(DataSourceState::Off, None);
        // Release waiters that never saw an init; a completed init result
        // is left alone.
        self.init_tx.send_if_modified(|value| {
            if value.is_none() {
                *value = Some(false);
                true
            } else {
                false
            }
        });
    }
}

#[derive(PartialEq, Eq)]
enum PollOutcome {
    Continue,
    PermanentFailure,
}

struct PollWorker {
    sink: Arc<UpdateSink>,
    http: reqwest::Client,
    uri: String,
    init_tx: Arc<watch::Sender<Option<bool>>>,
    initialized: Arc<AtomicBool>,
    etag: Option<String>,
}

impl PollWorker {
    async fn poll_once(&mut self) -> PollOutcome {
        let mut request = self.http.get(&self.uri);
        if let Some(etag) = &self.etag {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "poll request failed; will retry");
                self.sink.update_status(
                    DataSourceState::Interrupted,
                    Some(ErrorInfo::new(ErrorInfoKind::NetworkError, e.to_string())),
                );
                return PollOutcome::Continue;
            }
        };

        let status = response.status().as_u16();
        if status == 304 {
            debug!("poll response unchanged");
            self.sink.update_status(DataSourceState::Valid, None);
            return PollOutcome::Continue;
        }
        if !response.status().is_success() {
            let recoverable = is_http_error_recoverable(status);
            log_connection_result("polling", recoverable, status);
            if recoverable {
                self.sink.update_status(
                    DataSourceState::Interrupted,
                    Some(ErrorInfo::http(status, "poll request rejected")),
                );
                return PollOutcome::Continue;
            }
            self.sink.update_status(
                DataSourceState::Off,
                Some(ErrorInfo::http(status, "poll request rejected")),
            );
            let _ = self.init_tx.send(Some(false));
            return PollOutcome::PermanentFailure;
        }

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => {
                self.sink.update_status(
                    DataSourceState::Interrupted,
                    Some(ErrorInfo::new(ErrorInfoKind::NetworkError, e.to_string())),
                );
                return PollOutcome::Continue;
            }
        };
        let all_data: AllData = match serde_json::from_str(&body) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "poll response could not be parsed");
                self.sink.update_status(
                    DataSourceState::Interrupted,
                    Some(ErrorInfo::new(ErrorInfoKind::InvalidData, e.to_string())),
                );
                return PollOutcome::Continue;
            }
        };

        match self.sink.init(all_data.into_full_data_set()) {
            Ok(()) => {
                self.etag = etag;
                self.initialized.store(true, Ordering::SeqCst);
                let _ = self.init_tx.send(Some(true));
                self.sink.update_status(DataSourceState::Valid, None);
                debug!("applied full dataset from poll");
            }
            Err(e) => {
                // Drop the etag so the next poll refetches and re-inits.
                self.etag = None;
                self.sink
                    .update_status(DataSourceState::Interrupted, Some(store_error_info(&e)));
            }
        }
        PollOutcome::Continue
    }
}
