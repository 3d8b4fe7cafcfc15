//! Polling data source tests against a mock endpoint
//!
//! Run with: `cargo test -p flagflow --test polling_data_source`

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use flagflow::datasource::polling::{PollingConfig, PollingDataSource};
use flagflow::datasource::{
    await_init, DataSource, DataSourceState, DataSourceStatusBroadcaster, UpdateSink,
};
use flagflow::store::memory::InMemoryDataStore;
use flagflow::store::{DataKind, DataStore};

fn source_for(server_uri: &str, interval: Duration) -> (PollingDataSource, Arc<InMemoryDataStore>, Arc<DataSourceStatusBroadcaster>) {
    let store = Arc::new(InMemoryDataStore::new());
    let status = Arc::new(DataSourceStatusBroadcaster::new());
    let sink = Arc::new(UpdateSink::new(store.clone(), status.clone()));
    let source = PollingDataSource::new(
        sink,
        reqwest::Client::new(),
        server_uri,
        None,
        PollingConfig {
            poll_interval: interval,
            bypass_minimum_poll_interval: true,
        },
    );
    (source, store, status)
}

#[tokio::test(flavor = "multi_thread")]
async fn poll_applies_full_dataset() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/all"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "flags": {"F1": {"key": "F1", "version": 4}},
            "segments": {"S1": {"key": "S1", "version": 2}}
        })))
        .mount(&server)
        .await;

    let (source, store, status) = source_for(&server.uri(), Duration::from_secs(3600));
    assert!(await_init(source.start()).await);
    assert!(source.is_initialized());
    assert_eq!(status.status().state, DataSourceState::Valid);
    assert_eq!(
        store.get(DataKind::Features, "F1").unwrap().unwrap().version,
        4
    );
    assert_eq!(
        store.get(DataKind::Segments, "S1").unwrap().unwrap().version,
        2
    );
    source.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn not_modified_leaves_data_alone() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/all"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"v1\"")
                .set_body_json(json!({
                    "flags": {"F1": {"key": "F1", "version": 1}},
                    "segments": {}
                })),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/all"))
        .and(header("If-None-Match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;

    let (source, store, status) = source_for(&server.uri(), Duration::from_millis(20));
    assert!(await_init(source.start()).await);

    // Give it time for several 304 polls.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(status.status().state, DataSourceState::Valid);
    assert_eq!(
        store.get(DataKind::Features, "F1").unwrap().unwrap().version,
        1
    );
    let requests = server.received_requests().await.unwrap();
    assert!(requests.len() >= 3, "expected repeated polls");
    source.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unrecoverable_status_latches_off() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/all"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let (source, _, status) = source_for(&server.uri(), Duration::from_millis(20));
    assert!(!await_init(source.start()).await);
    assert_eq!(status.status().state, DataSourceState::Off);
    source.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn recoverable_error_keeps_polling() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/all"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/all"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "flags": {}, "segments": {}
        })))
        .mount(&server)
        .await;

    let (source, _, status) = source_for(&server.uri(), Duration::from_millis(20));
    assert!(await_init(source.start()).await);
    assert_eq!(status.status().state, DataSourceState::Valid);
    source.close().await;
}
