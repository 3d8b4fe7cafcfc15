//! End-to-end client tests using the programmable test data source
//!
//! Run with: `cargo test -p flagflow --test client_integration`

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use flagflow::client::AllFlagsStateOptions;
use flagflow::config::{DataSourceConfig, DataStoreConfig, ServiceEndpoints};
use flagflow::context::ContextBuilder;
use flagflow::datasource::streaming::StreamingConfig;
use flagflow::store::persistent::{CacheTtl, PersistentStoreConfig};
use flagflow::{Client, Config, Context, ErrorKind, Reason};
use flagflow_testing::{MockPersistentStore, TestData};

fn test_config(td: &TestData) -> Config {
    let mut config = Config::new("sdk-key");
    config.data_source = td.data_source_config();
    config.events = None;
    config.start_wait = Duration::from_secs(1);
    config
}

#[tokio::test(flavor = "multi_thread")]
async fn evaluates_flags_from_test_data() {
    let td = TestData::new();
    td.update(td.flag("boolean-flag").variation_for_all(true));
    td.update(
        td.flag("string-flag")
            .variations(vec![json!("red"), json!("green")])
            .off_variation(0)
            .fallthrough_variation(1),
    );
    let client = Client::build(test_config(&td)).await.unwrap();
    assert!(client.initialized());

    let context = Context::with_key("u1");
    assert!(client.bool_variation(&context, "boolean-flag", false));
    assert_eq!(
        client.string_variation(&context, "string-flag", "default"),
        "green"
    );
    // Wrong type requested: default comes back.
    assert_eq!(client.int_variation(&context, "string-flag", 7), 7);
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn live_updates_are_visible_immediately() {
    let td = TestData::new();
    td.update(td.flag("rollout-me").variation_for_all(false));
    let client = Client::build(test_config(&td)).await.unwrap();
    let context = Context::with_key("u1");

    assert!(!client.bool_variation(&context, "rollout-me", false));
    td.update(td.flag("rollout-me").variation_for_all(true));
    assert!(client.bool_variation(&context, "rollout-me", false));

    td.delete_flag("rollout-me");
    let detail = client.variation_detail(&context, "rollout-me", json!(false));
    assert_eq!(
        detail.reason,
        Reason::Error {
            error_kind: ErrorKind::FlagNotFound
        }
    );
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn targeting_beats_rules_and_fallthrough() {
    let td = TestData::new();
    td.update(
        td.flag("audience")
            .variations(vec![json!("fallthrough"), json!("targeted"), json!("ruled")])
            .off_variation(0)
            .fallthrough_variation(0)
            .target(1, vec!["vip"])
            .rule_match("group", vec![json!("beta")], 2),
    );
    let client = Client::build(test_config(&td)).await.unwrap();

    let vip = ContextBuilder::new("vip").set("group", json!("beta")).build();
    let detail = client.variation_detail(&vip, "audience", json!("?"));
    assert_eq!(detail.value, Some(json!("targeted")));
    assert_eq!(detail.reason, Reason::TargetMatch);

    let beta = ContextBuilder::new("u2").set("group", json!("beta")).build();
    let detail = client.variation_detail(&beta, "audience", json!("?"));
    assert_eq!(detail.value, Some(json!("ruled")));
    assert!(matches!(detail.reason, Reason::RuleMatch { rule_index: 0, .. }));

    let nobody = Context::with_key("u3");
    let detail = client.variation_detail(&nobody, "audience", json!("?"));
    assert_eq!(detail.value, Some(json!("fallthrough")));
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn prerequisite_failure_serves_off_variation() {
    let td = TestData::new();
    td.update(td.flag("gatekeeper").variation_for_all(false));
    td.update(
        td.flag("dependent")
            .variations(vec![json!("off"), json!("on")])
            .off_variation(0)
            .fallthrough_variation(1)
            .prerequisite("gatekeeper", 0),
    );
    let client = Client::build(test_config(&td)).await.unwrap();
    let context = Context::with_key("u1");

    // gatekeeper serves variation 1 (false), prerequisite wants 0.
    let detail = client.variation_detail(&context, "dependent", json!("?"));
    assert_eq!(detail.value, Some(json!("off")));
    assert_eq!(
        detail.reason,
        Reason::PrerequisiteFailed {
            prerequisite_key: "gatekeeper".to_string()
        }
    );

    // Satisfy the prerequisite and the dependent opens up.
    td.update(td.flag("gatekeeper").variation_for_all(true));
    let detail = client.variation_detail(&context, "dependent", json!("?"));
    assert_eq!(detail.value, Some(json!("on")));
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn segment_membership_drives_rules() {
    let td = TestData::new();
    td.update_segment(td.segment("beta-testers").included(vec!["tester-1"]));
    td.update(
        td.flag("beta-feature")
            .variations(vec![json!(false), json!(true)])
            .off_variation(0)
            .fallthrough_variation(0)
            .rule_segment_match("beta-testers", 1),
    );
    let client = Client::build(test_config(&td)).await.unwrap();

    assert!(client.bool_variation(&Context::with_key("tester-1"), "beta-feature", false));
    assert!(!client.bool_variation(&Context::with_key("someone"), "beta-feature", false));
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn all_flags_state_snapshot() {
    let td = TestData::new();
    td.update(td.flag("a").variation_for_all(true));
    td.update(td.flag("b").variation_for_all(false).track_events(true));
    let client = Client::build(test_config(&td)).await.unwrap();

    let state = client.all_flags_state(&Context::with_key("u1"), AllFlagsStateOptions::default());
    assert!(state.valid());
    assert_eq!(state.value("a"), Some(&json!(true)));
    assert_eq!(state.value("b"), Some(&json!(false)));

    let serialized = serde_json::to_value(&state).unwrap();
    assert_eq!(serialized["$valid"], json!(true));
    assert_eq!(serialized["a"], json!(true));
    assert_eq!(serialized["$flagsState"]["a"]["variation"], json!(0));
    assert_eq!(serialized["$flagsState"]["b"]["trackEvents"], json!(true));
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn events_are_delivered_to_the_bulk_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bulk"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let td = TestData::new();
    td.update(td.flag("tracked").variation_for_all(true).track_events(true));

    let mut config = test_config(&td);
    config.events = Some(flagflow::events::EventsConfig {
        flush_interval: Duration::from_secs(3600),
        ..flagflow::events::EventsConfig::default()
    });
    config.service_endpoints = ServiceEndpoints::relay_proxy(&server.uri());
    config.diagnostic_opt_out = true;
    let client = Client::build(config).await.unwrap();

    let context = ContextBuilder::new("u1").name("Sandy").build();
    client.bool_variation(&context, "tracked", false);
    client.track(&context, "purchase", Some(json!({"sku": "A1"})), Some(9.99));
    client.identify(&context);
    client.flush_and_wait().await;

    let mut kinds: Vec<String> = Vec::new();
    for request in server.received_requests().await.unwrap() {
        if request.url.path() == "/bulk" {
            let body: Value = serde_json::from_slice(&request.body).unwrap();
            for event in body.as_array().unwrap() {
                kinds.push(event["kind"].as_str().unwrap().to_string());
            }
        }
    }
    kinds.sort();
    assert_eq!(kinds, vec!["custom", "feature", "identify", "index", "summary"]);
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn daemon_mode_reads_a_store_populated_elsewhere() {
    // A "writer" process fills the persistent backend...
    let backend = Arc::new(MockPersistentStore::new());
    {
        let td = TestData::new();
        td.update(td.flag("shared").variation_for_all(true));
        let writer_config = Config {
            data_source: td.data_source_config(),
            data_store: DataStoreConfig::Persistent {
                backend: backend.clone(),
                config: PersistentStoreConfig::default(),
            },
            events: None,
            start_wait: Duration::from_secs(1),
            ..Config::new("sdk-key")
        };
        let writer = Client::build(writer_config).await.unwrap();
        writer.close().await;
    }

    // ...and a reader with no data source of its own picks it up.
    let reader_config = Config {
        data_source: DataSourceConfig::External,
        data_store: DataStoreConfig::Persistent {
            backend: backend.clone(),
            config: PersistentStoreConfig {
                cache_ttl: CacheTtl::Finite(Duration::from_millis(50)),
                ..PersistentStoreConfig::default()
            },
        },
        events: None,
        start_wait: Duration::from_secs(1),
        ..Config::new("sdk-key")
    };
    let reader = Client::build(reader_config).await.unwrap();
    assert!(reader.initialized());
    assert!(reader.bool_variation(&Context::with_key("u1"), "shared", false));
    reader.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn start_wait_timeout_leaves_client_usable() {
    // Point streaming at a port nothing listens on.
    let mut config = Config::new("sdk-key");
    config.service_endpoints = ServiceEndpoints::relay_proxy("http://127.0.0.1:9");
    config.data_source = DataSourceConfig::Streaming(StreamingConfig {
        initial_reconnect_delay: Duration::from_millis(50),
    });
    config.events = None;
    config.start_wait = Duration::from_millis(200);

    let client = Client::build(config).await.unwrap();
    assert!(!client.initialized());
    let detail = client.variation_detail(&Context::with_key("u1"), "any", json!("d"));
    assert_eq!(detail.value, Some(json!("d")));
    assert_eq!(
        detail.reason,
        Reason::Error {
            error_kind: ErrorKind::ClientNotReady
        }
    );
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn persistent_store_round_trips_flag_data() {
    let backend = Arc::new(MockPersistentStore::new());
    let td = TestData::new();
    td.update(
        td.flag("persisted")
            .variations(vec![json!("a"), json!("b")])
            .off_variation(0)
            .fallthrough_variation(1),
    );
    let config = Config {
        data_source: td.data_source_config(),
        data_store: DataStoreConfig::Persistent {
            backend: backend.clone(),
            config: PersistentStoreConfig::default(),
        },
        events: None,
        start_wait: Duration::from_secs(1),
        ..Config::new("sdk-key")
    };
    let client = Client::build(config).await.unwrap();

    assert_eq!(
        client.string_variation(&Context::with_key("u1"), "persisted", "?"),
        "b"
    );
    // The serialized form in the backend is real wire JSON.
    let raw = backend
        .raw_get(flagflow::store::DataKind::Features, "persisted")
        .unwrap();
    let parsed: Value = serde_json::from_str(raw.serialized_item.as_deref().unwrap()).unwrap();
    assert_eq!(parsed["key"], json!("persisted"));
    assert_eq!(parsed["variations"], json!(["a", "b"]));
    client.close().await;
}
