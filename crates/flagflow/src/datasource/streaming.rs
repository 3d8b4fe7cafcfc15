// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Streaming data source
//!
//! Maintains a long-lived server-sent-events connection to the `/all`
//! endpoint and applies `put`/`patch`/`delete` events to the local replica
//! in arrival order. Reconnects with jittered exponential backoff; the
//! backoff resets after a connection survives for a minute. A connection
//! that goes quiet past the read timeout is assumed dead and cycled.
//!
//! If the data store reports availability, the source subscribes and forces
//! a fresh connection (and therefore a full `put`) when the store recovers
//! needing a refresh; if the store cannot report, any store write failure
//! cycles the connection instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::datasource::protocol::{parse_delete, parse_patch, DeleteData, PatchData, PutData};
use crate::datasource::{
    is_http_error_recoverable, log_connection_result, store_error_info, DataSource,
    DataSourceState, ErrorInfo, ErrorInfoKind, InitSignal, UpdateSink,
};
use crate::errors::Error;

/// A connection that produces nothing for this long is assumed dead.
pub const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(300);

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// A connection that lived at least this long resets the backoff.
const BACKOFF_RESET_INTERVAL: Duration = Duration::from_secs(60);

/// Options for [`StreamingDataSource`].
#[derive(Clone, Copy, Debug)]
pub struct StreamingConfig {
    /// First reconnect delay; doubles per failed attempt up to a cap.
    pub initial_reconnect_delay: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        StreamingConfig {
            initial_reconnect_delay: Duration::from_secs(1),
        }
    }
}

pub struct StreamingDataSource {
    sink: Arc<UpdateSink>,
    http: reqwest::Client,
    stream_uri: String,
    initial_reconnect_delay: Duration,
    init_tx: Arc<watch::Sender<Option<bool>>>,
    init_rx: InitSignal,
    initialized: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    restart: Arc<Notify>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamingDataSource {
    pub fn new(
        sink: Arc<UpdateSink>,
        http: reqwest::Client,
        streaming_base_uri: &str,
        payload_filter: Option<&str>,
        config: StreamingConfig,
    ) -> StreamingDataSource {
        let mut stream_uri = format!("{}/all", streaming_base_uri.trim_end_matches('/'));
        if let Some(filter) = payload_filter {
            stream_uri.push_str("?filter=");
            stream_uri.push_str(filter);
        }
        let (init_tx, init_rx) = watch::channel(None);
        let (shutdown_tx, _) = watch::channel(false);
        StreamingDataSource {
            sink,
            http,
            stream_uri,
            initial_reconnect_delay: config.initial_reconnect_delay,
            init_tx: Arc::new(init_tx),
            init_rx,
            initialized: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            restart: Arc::new(Notify::new()),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl DataSource for StreamingDataSource {
    fn start(&self) -> InitSignal {
        if !self.started.swap(true, Ordering::SeqCst) {
            let worker = StreamWorker {
                sink: Arc::clone(&self.sink),
                http: self.http.clone(),
                uri: self.stream_uri.clone(),
                initial_delay: self.initial_reconnect_delay,
                init_tx: Arc::clone(&self.init_tx),
                initialized: Arc::clone(&self.initialized),
                shutdown: self.shutdown_tx.subscribe(),
                restart: Arc::clone(&self.restart),
            };
            let mut tasks = self.tasks.lock();
            tasks.push(tokio::spawn(worker.run()));

            // Store-outage coordination: reconnect when the store recovers
            // and needs the data it missed.
            if let Some(store_status) = self.sink.store_status_broadcaster() {
                let restart = Arc::clone(&self.restart);
                let mut shutdown = self.shutdown_tx.subscribe();
                let mut statuses = store_status.subscribe();
                tasks.push(tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            status = statuses.recv() => match status {
                                Ok(s) if s.available && s.refresh_needed => {
                                    info!("data store recovered and needs refresh; restarting stream");
                                    restart.notify_one();
                                }
                                Ok(_) => {}
                                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                                Err(_) => return,
                            },
                        }
                    }
                }));
            }
        }
        self.init_rx.clone()
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
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

enum ReadOutcome {
    Shutdown,
    Reconnect,
}

enum HandleOutcome {
    Applied,
    InvalidData(String),
    StoreError(Error),
}

struct StreamWorker {
    sink: Arc<UpdateSink>,
    http: reqwest::Client,
    uri: String,
    initial_delay: Duration,
    init_tx: Arc<watch::Sender<Option<bool>>>,
    initialized: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
    restart: Arc<Notify>,
}

impl StreamWorker {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            if *self.shutdown.borrow() {
                return;
            }
            if attempt > 0 {
                let delay = backoff_delay(self.initial_delay, attempt);
                debug!(?delay, attempt, "waiting before stream reconnect");
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    _ = self.shutdown.changed() => return,
                }
            }
            attempt += 1;

            let request = self
                .http
                .get(&self.uri)
                .header(reqwest::header::ACCEPT, "text/event-stream");
            let response = tokio::select! {
                r = request.send() => r,
                _ = self.shutdown.changed() => return,
            };
            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "streaming connection failed; will retry");
                    self.sink.update_status(
                        DataSourceState::Interrupted,
                        Some(ErrorInfo::new(ErrorInfoKind::NetworkError, e.to_string())),
                    );
                    continue;
                }
            };

            let status = response.status().as_u16();
            if !response.status().is_success() {
                let recoverable = is_http_error_recoverable(status);
                log_connection_result("streaming", recoverable, status);
                if recoverable {
                    self.sink.update_status(
                        DataSourceState::Interrupted,
                        Some(ErrorInfo::http(status, "stream connection rejected")),
                    );
                    continue;
                }
                self.sink.update_status(
                    DataSourceState::Off,
                    Some(ErrorInfo::http(status, "stream connection rejected")),
                );
                let _ = self.init_tx.send(Some(false));
                return;
            }

            debug!("stream connection established");
            let connected_at = Instant::now();
            match self.read_stream(response).await {
                ReadOutcome::Shutdown => return,
                ReadOutcome::Reconnect => {}
            }
            if connected_at.elapsed() >= BACKOFF_RESET_INTERVAL {
                attempt = 0;
            }
        }
    }

    async fn read_stream(&mut self, response: reqwest::Response) -> ReadOutcome {
        let mut events = response.bytes_stream().eventsource();
        loop {
            let next = tokio::select! {
                _ = self.shutdown.changed() => return ReadOutcome::Shutdown,
                () = self.restart.notified() => {
                    info!("restarting stream connection to force a fresh dataset");
                    return ReadOutcome::Reconnect;
                }
                next = tokio::time::timeout(STREAM_READ_TIMEOUT, events.next()) => next,
            };
            let event = match next {
                Err(_) => {
                    warn!("stream went quiet past the read timeout; reconnecting");
                    self.note_network_error("read timeout on stream connection");
                    return ReadOutcome::Reconnect;
                }
                Ok(None) => {
                    warn!("stream connection closed by the service; reconnecting");
                    self.note_network_error("stream connection closed");
                    return ReadOutcome::Reconnect;
                }
                Ok(Some(Err(e))) => {
                    // Transport failures mid-event never surface as partial
                    // payloads; they land here and the connection cycles.
                    warn!(error = %e, "stream read error; reconnecting");
                    self.note_network_error(e.to_string());
                    return ReadOutcome::Reconnect;
                }
                Ok(Some(Ok(event))) => event,
            };

            match self.handle_event(event.event.as_str(), &event.data) {
                HandleOutcome::Applied => {}
                HandleOutcome::InvalidData(message) => {
                    error!(%message, "received malformed stream event; restarting connection");
                    self.sink.update_status(
                        DataSourceState::Interrupted,
                        Some(ErrorInfo::new(ErrorInfoKind::InvalidData, message)),
                    );
                    return ReadOutcome::Reconnect;
                }
                HandleOutcome::StoreError(e) => {
                    self.sink
                        .update_status(DataSourceState::Interrupted, Some(store_error_info(&e)));
                    if self.sink.store_status_broadcaster().is_none() {
                        // The store cannot tell us when it recovers, so the
                        // only way back to a complete dataset is a fresh put.
                        return ReadOutcome::Reconnect;
                    }
                    // Otherwise keep reading; the store-status watcher will
                    // force a restart once the store is ready for data.
                }
            }
        }
    }

    fn handle_event(&self, name: &str, data: &str) -> HandleOutcome {
        match name {
            "put" => {
                let put: PutData = match serde_json::from_str(data) {
                    Ok(p) => p,
                    Err(e) => return HandleOutcome::InvalidData(e.to_string()),
                };
                match self.sink.init(put.data.into_full_data_set()) {
                    Ok(()) => {
                        self.initialized.store(true, Ordering::SeqCst);
                        let _ = self.init_tx.send(Some(true));
                        self.sink.update_status(DataSourceState::Valid, None);
                        debug!("applied full dataset from stream");
                        HandleOutcome::Applied
                    }
                    Err(e) => HandleOutcome::StoreError(e),
                }
            }
            "patch" => {
                let patch: PatchData = match serde_json::from_str(data) {
                    Ok(p) => p,
                    Err(e) => return HandleOutcome::InvalidData(e.to_string()),
                };
                let (kind, key, item) = match parse_patch(&patch) {
                    Ok(parsed) => parsed,
                    Err(e) => return HandleOutcome::InvalidData(e.to_string()),
                };
                match self.sink.upsert(kind, &key, item) {
                    Ok(()) => {
                        self.sink.update_status(DataSourceState::Valid, None);
                        HandleOutcome::Applied
                    }
                    Err(e) => HandleOutcome::StoreError(e),
                }
            }
            "delete" => {
                let delete: DeleteData = match serde_json::from_str(data) {
                    Ok(d) => d,
                    Err(e) => return HandleOutcome::InvalidData(e.to_string()),
                };
                let (kind, key, item) = match parse_delete(&delete) {
                    Ok(parsed) => parsed,
                    Err(e) => return HandleOutcome::InvalidData(e.to_string()),
                };
                match self.sink.upsert(kind, &key, item) {
                    Ok(()) => {
                        self.sink.update_status(DataSourceState::Valid, None);
                        HandleOutcome::Applied
                    }
                    Err(e) => HandleOutcome::StoreError(e),
                }
            }
            other => {
                debug!(event = other, "ignoring unrecognized stream event");
                HandleOutcome::Applied
            }
        }
    }

    fn note_network_error(&self, message: impl Into<String>) {
        self.sink.update_status(
            DataSourceState::Interrupted,
            Some(ErrorInfo::new(ErrorInfoKind::NetworkError, message)),
        );
    }
}

// Jittered exponential backoff: half the nominal delay is deterministic,
// half is random, capped at MAX_RECONNECT_DELAY.
fn backoff_delay(initial: Duration, attempt: u32) -> Duration {
    let doublings = attempt.saturating_sub(1).min(16);
    let nominal = initial
        .saturating_mul(1u32 << doublings)
        .min(MAX_RECONNECT_DELAY);
    let half = nominal / 2;
    half + rand::thread_rng().gen_range(Duration::ZERO..=half)
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::DataSourceStatusBroadcaster;
    use crate::store::memory::InMemoryDataStore;
    use crate::store::{DataKind, DataStore};
    use serde_json::json;

    fn worker() -> (StreamWorker, Arc<InMemoryDataStore>, Arc<DataSourceStatusBroadcaster>) {
        let store = Arc::new(InMemoryDataStore::new());
        let status = Arc::new(DataSourceStatusBroadcaster::new());
        let sink = Arc::new(UpdateSink::new(store.clone(), status.clone()));
        let (init_tx, _) = watch::channel(None);
        // The sender side drops immediately; these tests never wait on
        // shutdown, only on handle_event.
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let worker = StreamWorker {
            sink,
            http: reqwest::Client::new(),
            uri: "http://unused/all".to_string(),
            initial_delay: Duration::from_millis(10),
            init_tx: Arc::new(init_tx),
            initialized: Arc::new(AtomicBool::new(false)),
            shutdown,
            restart: Arc::new(Notify::new()),
        };
        (worker, store, status)
    }

    #[tokio::test]
    async fn test_put_initializes_store_and_status() {
        let (worker, store, status) = worker();
        let body = json!({
            "data": {
                "flags": {"f1": {"key": "f1", "version": 1}},
                "segments": {}
            }
        });
        let outcome = worker.handle_event("put", &body.to_string());
        assert!(matches!(outcome, HandleOutcome::Applied));
        assert!(store.is_initialized());
        assert!(worker.initialized.load(Ordering::SeqCst));
        assert_eq!(status.status().state, DataSourceState::Valid);
    }

    #[tokio::test]
    async fn test_patch_and_delete_apply_in_order() {
        let (worker, store, _) = worker();
        let put = json!({"data": {"flags": {
            "f1": {"key": "f1", "version": 1},
            "f2": {"key": "f2", "version": 1}
        }, "segments": {}}});
        worker.handle_event("put", &put.to_string());

        let patch = json!({"path": "/flags/f1", "data": {"key": "f1", "version": 2}});
        assert!(matches!(
            worker.handle_event("patch", &patch.to_string()),
            HandleOutcome::Applied
        ));
        let delete = json!({"path": "/flags/f2", "version": 2});
        assert!(matches!(
            worker.handle_event("delete", &delete.to_string()),
            HandleOutcome::Applied
        ));

        assert_eq!(
            store.get(DataKind::Features, "f1").unwrap().unwrap().version,
            2
        );
        let f2 = store.get(DataKind::Features, "f2").unwrap().unwrap();
        assert!(f2.is_tombstone());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_invalid_data() {
        let (worker, _, _) = worker();
        assert!(matches!(
            worker.handle_event("put", "{not json"),
            HandleOutcome::InvalidData(_)
        ));
        assert!(matches!(
            worker.handle_event("patch", "{\"path\": \"/widgets/x\", \"data\": {}}"),
            HandleOutcome::InvalidData(_)
        ));
    }

    #[tokio::test]
    async fn test_unknown_event_is_ignored() {
        let (worker, store, _) = worker();
        assert!(matches!(
            worker.handle_event("shrug", "whatever"),
            HandleOutcome::Applied
        ));
        assert!(!store.is_initialized());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let initial = Duration::from_secs(1);
        for attempt in 1..20 {
            let d = backoff_delay(initial, attempt);
            assert!(d >= initial / 2, "attempt {attempt}: {d:?}");
            assert!(d <= MAX_RECONNECT_DELAY, "attempt {attempt}: {d:?}");
        }
        // Early attempts are strictly shorter than the cap's floor.
        assert!(backoff_delay(initial, 1) <= Duration::from_secs(1));
    }
}
