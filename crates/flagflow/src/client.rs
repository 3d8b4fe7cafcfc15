// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The client: one long-lived object wiring the data store, data source,
//! evaluator, event pipeline, and big-segment wrapper together.
//!
//! # Example
//!
//! ```rust,no_run
//! use flagflow::client::Client;
//! use flagflow::config::Config;
//! use flagflow::context::ContextBuilder;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::build(Config::new("sdk-key")).await?;
//!     let context = ContextBuilder::new("user-123").build();
//!     if client.bool_variation(&context, "new-checkout", false) {
//!         // new code path
//!     }
//!     client.close().await;
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::ser::SerializeMap;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::bigsegments::BigSegmentStoreWrapper;
use crate::config::{Config, DataSourceConfig, DataStoreConfig};
use crate::context::Context;
use crate::datasource::null::NullDataSource;
use crate::datasource::polling::PollingDataSource;
use crate::datasource::streaming::StreamingDataSource;
use crate::datasource::{
    await_init, DataSource, DataSourceStatus, DataSourceStatusBroadcaster, InitSignal, UpdateSink,
};
use crate::errors::Result;
use crate::eval::{
    Detail, ErrorKind, EvalResult, Evaluator, PrerequisiteEvent, PrerequisiteEventRecorder,
    Reason,
};
use crate::events::diagnostics::DiagnosticsManager;
use crate::events::processor::EventProcessor;
use crate::events::sender::EventSender;
use crate::events::{BaseEvent, CustomEvent, FeatureRequestEvent, IdentifyEvent, InputEvent};
use crate::model::flag::FeatureFlag;
use crate::store::memory::InMemoryDataStore;
use crate::store::persistent::PersistentDataStoreWrapper;
use crate::store::status::DataStoreStatusBroadcaster;
use crate::store::{DataKind, DataStore, EvaluationStoreAdapter, StoreItem};

/// Options for [`Client::all_flags_state`].
#[derive(Clone, Copy, Debug, Default)]
pub struct AllFlagsStateOptions {
    /// Only include flags marked available to client-side SDKs.
    pub client_side_only: bool,
    /// Include evaluation reasons in the metadata.
    pub with_reasons: bool,
    /// Omit per-flag metadata that is only needed for event tracking unless
    /// the flag actually tracks events.
    pub details_only_for_tracked_flags: bool,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FlagState {
    #[serde(skip_serializing_if = "Option::is_none")]
    variation: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<Reason>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    track_events: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    track_reason: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    debug_events_until_date: Option<u64>,
}

/// A snapshot of all flag values for one context, suitable for
/// bootstrapping a front end. Serializes to the standard bootstrap format:
/// flag values at the top level plus `$flagsState` metadata and `$valid`.
#[derive(Clone, Debug)]
pub struct FlagsState {
    valid: bool,
    values: Vec<(String, Value, FlagState)>,
}

impl FlagsState {
    fn invalid() -> FlagsState {
        FlagsState {
            valid: false,
            values: Vec::new(),
        }
    }

    /// False when the snapshot could not be produced (store unavailable,
    /// invalid context, client not initialized).
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// The evaluated value of one flag, if present.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(k, ..)| k == key)
            .map(|(_, value, _)| value)
    }
}

impl Serialize for FlagsState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len() + 2))?;
        for (key, value, _) in &self.values {
            map.serialize_entry(key, value)?;
        }
        let metadata: std::collections::BTreeMap<&str, &FlagState> = self
            .values
            .iter()
            .map(|(key, _, state)| (key.as_str(), state))
            .collect();
        map.serialize_entry("$flagsState", &metadata)?;
        map.serialize_entry("$valid", &self.valid)?;
        map.end()
    }
}

/// The server-side SDK client. One per process; cheap to share behind an
/// `Arc`. All evaluation methods are synchronous and never fail: any
/// problem yields the caller's default value and is reported through
/// analytics and logs instead.
pub struct Client {
    store: Arc<dyn DataStore>,
    evaluator: Evaluator,
    data_source: Arc<dyn DataSource>,
    data_source_status: Arc<DataSourceStatusBroadcaster>,
    events: Option<Arc<EventProcessor>>,
    big_segments: Option<Arc<BigSegmentStoreWrapper>>,
    init_signal: InitSignal,
    closed: AtomicBool,
}

impl Client {
    /// Constructs and starts the client, blocking up to
    /// [`Config::start_wait`] for the first dataset. A client that times
    /// out is still usable; it continues initializing in the background and
    /// serves defaults meanwhile.
    pub async fn build(config: Config) -> Result<Client> {
        let store: Arc<dyn DataStore> = match &config.data_store {
            DataStoreConfig::InMemory => Arc::new(InMemoryDataStore::new()),
            DataStoreConfig::Persistent { backend, config } => {
                PersistentDataStoreWrapper::new(Arc::clone(backend), *config)
            }
        };

        let big_segments = config
            .big_segments
            .clone()
            .map(BigSegmentStoreWrapper::new);
        let evaluator = Evaluator::new(
            Arc::new(EvaluationStoreAdapter(Arc::clone(&store))),
            big_segments
                .clone()
                .map(|w| w as Arc<dyn crate::eval::BigSegmentsQuery>),
        );

        let http = config.http.build_client(&config.sdk_key)?;
        let timed_http = config.http.build_timed_client(&config.sdk_key)?;
        let status = Arc::new(DataSourceStatusBroadcaster::new());
        let sink = Arc::new(UpdateSink::new(Arc::clone(&store), Arc::clone(&status)));

        let events = if config.offline {
            None
        } else {
            config.events.clone().map(|events_config| {
                let sender = Arc::new(EventSender::new(
                    timed_http.clone(),
                    &config.service_endpoints.events_base_uri,
                ));
                let diagnostics = (!config.diagnostic_opt_out).then(|| {
                    Arc::new(parking_lot::Mutex::new(DiagnosticsManager::new(
                        &config.sdk_key,
                        diagnostic_configuration_summary(&config, &events_config),
                    )))
                });
                Arc::new(EventProcessor::new(events_config, sender, diagnostics))
            })
        };

        let data_source: Arc<dyn DataSource> = if config.offline {
            Arc::new(NullDataSource::new(sink))
        } else {
            match &config.data_source {
                DataSourceConfig::Streaming(streaming_config) => {
                    Arc::new(StreamingDataSource::new(
                        sink,
                        http.clone(),
                        &config.service_endpoints.streaming_base_uri,
                        config.payload_filter.as_deref(),
                        *streaming_config,
                    ))
                }
                DataSourceConfig::Polling(polling_config) => Arc::new(PollingDataSource::new(
                    sink,
                    timed_http.clone(),
                    &config.service_endpoints.polling_base_uri,
                    config.payload_filter.as_deref(),
                    *polling_config,
                )),
                DataSourceConfig::External => Arc::new(NullDataSource::new(sink)),
                DataSourceConfig::Custom(factory) => factory.create(sink),
            }
        };

        let init_signal = data_source.start();
        let client = Client {
            store,
            evaluator,
            data_source,
            data_source_status: status,
            events,
            big_segments,
            init_signal,
            closed: AtomicBool::new(false),
        };

        if !config.start_wait.is_zero() {
            info!(
                "waiting up to {:?} for the client to initialize",
                config.start_wait
            );
            if !client.wait_for_initialization(config.start_wait).await {
                warn!(
                    "client initialization did not complete within the start wait; continuing in the background"
                );
            }
        }
        Ok(client)
    }

    /// Waits up to `timeout` for initialization; true once the first
    /// dataset has been applied.
    pub async fn wait_for_initialization(&self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, await_init(self.init_signal.clone())).await,
            Ok(true)
        ) || self.initialized()
    }

    /// Whether the data source has ever applied a full dataset.
    pub fn initialized(&self) -> bool {
        self.data_source.is_initialized()
    }

    /// The data source's current status.
    pub fn data_source_status(&self) -> DataSourceStatus {
        self.data_source_status.status()
    }

    /// Subscribes to data-source status transitions.
    pub fn data_source_status_broadcaster(&self) -> Arc<DataSourceStatusBroadcaster> {
        Arc::clone(&self.data_source_status)
    }

    /// The store's availability broadcaster, when the store can fail.
    pub fn data_store_status_broadcaster(&self) -> Option<Arc<DataStoreStatusBroadcaster>> {
        self.store.status_broadcaster()
    }

    /// Evaluates a flag to a boolean.
    pub fn bool_variation(&self, context: &Context, key: &str, default: bool) -> bool {
        self.typed(context, key, Value::Bool(default), Value::is_boolean)
            .as_bool()
            .unwrap_or(default)
    }

    /// Evaluates a flag to a string.
    pub fn string_variation(&self, context: &Context, key: &str, default: &str) -> String {
        match self.typed(context, key, Value::String(default.to_string()), Value::is_string) {
            Value::String(s) => s,
            _ => default.to_string(),
        }
    }

    /// Evaluates a flag to a float.
    pub fn float_variation(&self, context: &Context, key: &str, default: f64) -> f64 {
        self.typed(context, key, json!(default), Value::is_number)
            .as_f64()
            .unwrap_or(default)
    }

    /// Evaluates a flag to an integer. A float variation is truncated.
    pub fn int_variation(&self, context: &Context, key: &str, default: i64) -> i64 {
        let value = self.typed(context, key, json!(default), Value::is_number);
        value
            .as_i64()
            .or_else(|| value.as_f64().map(|f| f as i64))
            .unwrap_or(default)
    }

    /// Evaluates a flag to an arbitrary JSON value.
    pub fn json_variation(&self, context: &Context, key: &str, default: Value) -> Value {
        self.evaluate_with_events(context, key, default, false, None)
            .value
            .unwrap_or(Value::Null)
    }

    /// Evaluates a flag and reports why the value was chosen.
    pub fn variation_detail(&self, context: &Context, key: &str, default: Value) -> Detail {
        self.evaluate_with_events(context, key, default, true, None)
    }

    fn typed(
        &self,
        context: &Context,
        key: &str,
        default: Value,
        type_check: fn(&Value) -> bool,
    ) -> Value {
        self.evaluate_with_events(context, key, default, false, Some(type_check))
            .value
            .unwrap_or(Value::Null)
    }

    // The single evaluation path behind every variation method. Always
    // produces a Detail whose value is Some (the default fills in for
    // errors), and reports the evaluation to analytics.
    fn evaluate_with_events(
        &self,
        context: &Context,
        key: &str,
        default: Value,
        with_reasons: bool,
        type_check: Option<fn(&Value) -> bool>,
    ) -> Detail {
        if self.closed.load(Ordering::SeqCst) {
            return error_detail(ErrorKind::ClientNotReady, default);
        }
        if !context.valid() {
            warn!(
                key,
                error = context.error().unwrap_or("unknown"),
                "variation called with an invalid context; returning default value"
            );
            return error_detail(ErrorKind::UserNotSpecified, default);
        }

        let flag = match self.store.get(DataKind::Features, key) {
            Ok(Some(descriptor)) => match descriptor.item {
                Some(StoreItem::Flag(flag)) => Some(flag),
                _ => None,
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "data store error during evaluation; returning default value");
                self.send_unknown_flag_event(context, key, &default, ErrorKind::Exception, with_reasons);
                return error_detail(ErrorKind::Exception, default);
            }
        };

        if !self.initialized() {
            if self.store.is_initialized() {
                warn!(key, "client has not finished initializing; using last known flag data");
            } else {
                warn!(key, "client has not finished initializing; returning default value");
                self.send_unknown_flag_event(
                    context,
                    key,
                    &default,
                    ErrorKind::ClientNotReady,
                    with_reasons,
                );
                return error_detail(ErrorKind::ClientNotReady, default);
            }
        }

        let Some(flag) = flag else {
            warn!(key, "unknown feature flag; returning default value");
            self.send_unknown_flag_event(context, key, &default, ErrorKind::FlagNotFound, with_reasons);
            return error_detail(ErrorKind::FlagNotFound, default);
        };

        let mut recorder = PrereqEventRecorder {
            events: self.events.as_deref(),
            with_reasons,
        };
        let result = self.evaluator.evaluate(&flag, context, &mut recorder);

        let mut detail = Detail {
            value: Some(
                result
                    .detail
                    .value
                    .clone()
                    .unwrap_or_else(|| default.clone()),
            ),
            variation_index: result.detail.variation_index,
            reason: result.detail.reason.clone(),
        };
        if let (Some(check), Some(value)) = (type_check, result.detail.value.as_ref()) {
            if !check(value) {
                detail = error_detail(ErrorKind::WrongType, default.clone());
            }
        }

        self.send_feature_event(context, &flag, &detail, &result, default, with_reasons);
        detail
    }

    fn send_feature_event(
        &self,
        context: &Context,
        flag: &FeatureFlag,
        detail: &Detail,
        result: &EvalResult,
        default: Value,
        with_reasons: bool,
    ) {
        let Some(events) = &self.events else {
            return;
        };
        let reason = (with_reasons || result.force_reason_tracking)
            .then(|| detail.reason.clone());
        events.send_event(InputEvent::FeatureRequest(FeatureRequestEvent {
            base: BaseEvent::new(context.clone()),
            key: flag.key.clone(),
            version: Some(flag.version),
            variation: detail.variation_index,
            value: detail.value.clone().unwrap_or(Value::Null),
            default,
            reason,
            prereq_of: None,
            track_events: flag.track_events || result.force_reason_tracking,
            debug_events_until_date: flag.debug_events_until_date,
            sampling_ratio: flag.effective_sampling_ratio(),
            exclude_from_summaries: flag.exclude_from_summaries,
        }));
    }

    fn send_unknown_flag_event(
        &self,
        context: &Context,
        key: &str,
        default: &Value,
        error_kind: ErrorKind,
        with_reasons: bool,
    ) {
        let Some(events) = &self.events else {
            return;
        };
        events.send_event(InputEvent::FeatureRequest(FeatureRequestEvent {
            base: BaseEvent::new(context.clone()),
            key: key.to_string(),
            version: None,
            variation: None,
            value: default.clone(),
            default: default.clone(),
            reason: with_reasons.then_some(Reason::Error { error_kind }),
            prereq_of: None,
            track_events: false,
            debug_events_until_date: None,
            sampling_ratio: 1,
            exclude_from_summaries: false,
        }));
    }

    /// Evaluates every flag for the context and returns a serializable
    /// snapshot. Emits no analytics events.
    pub fn all_flags_state(&self, context: &Context, options: AllFlagsStateOptions) -> FlagsState {
        if self.closed.load(Ordering::SeqCst) || !context.valid() {
            return FlagsState::invalid();
        }
        if !self.initialized() && !self.store.is_initialized() {
            warn!("all_flags_state requested before initialization");
            return FlagsState::invalid();
        }
        let all = match self.store.get_all(DataKind::Features) {
            Ok(all) => all,
            Err(e) => {
                warn!(error = %e, "data store error while reading all flags");
                return FlagsState::invalid();
            }
        };

        let mut values = Vec::new();
        for (key, descriptor) in all {
            let Some(StoreItem::Flag(flag)) = descriptor.item else {
                continue;
            };
            if options.client_side_only && !flag.client_side {
                continue;
            }
            let result = self
                .evaluator
                .evaluate(&flag, context, &mut crate::eval::NoopRecorder);
            let tracked = flag.track_events || result.force_reason_tracking;
            let now = crate::events::now_millis();
            let debugging = flag
                .debug_events_until_date
                .is_some_and(|until| until > now);
            let wanted = !options.details_only_for_tracked_flags || tracked || debugging;
            let state = FlagState {
                variation: result.detail.variation_index,
                version: wanted.then_some(flag.version),
                reason: (options.with_reasons && wanted || result.force_reason_tracking)
                    .then(|| result.detail.reason.clone()),
                track_events: tracked,
                track_reason: result.force_reason_tracking,
                debug_events_until_date: flag.debug_events_until_date,
            };
            values.push((
                key,
                result.detail.value.clone().unwrap_or(Value::Null),
                state,
            ));
        }
        FlagsState {
            valid: true,
            values,
        }
    }

    /// Records a custom event for the context.
    pub fn track(
        &self,
        context: &Context,
        key: impl Into<String>,
        data: Option<Value>,
        metric_value: Option<f64>,
    ) {
        let Some(events) = &self.events else {
            return;
        };
        if !context.valid() {
            warn!("track called with an invalid context; ignoring");
            return;
        }
        events.send_event(InputEvent::Custom(CustomEvent {
            base: BaseEvent::new(context.clone()),
            key: key.into(),
            data,
            metric_value,
        }));
    }

    /// Registers the context's attributes with analytics.
    pub fn identify(&self, context: &Context) {
        let Some(events) = &self.events else {
            return;
        };
        if !context.valid() {
            warn!("identify called with an invalid context; ignoring");
            return;
        }
        events.send_event(InputEvent::Identify(IdentifyEvent {
            base: BaseEvent::new(context.clone()),
        }));
    }

    /// Requests delivery of all buffered analytics.
    pub fn flush(&self) {
        if let Some(events) = &self.events {
            events.flush();
        }
    }

    /// Flushes and waits for delivery workers to go idle.
    pub async fn flush_and_wait(&self) {
        if let Some(events) = &self.events {
            events.flush_and_wait().await;
        }
    }

    /// Shuts the client down: final event flush, then components in
    /// reverse construction order. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing client");
        if let Some(events) = &self.events {
            events.close().await;
        }
        self.data_source.close().await;
        if let Some(big_segments) = &self.big_segments {
            big_segments.close().await;
        }
        self.store.close();
    }
}

struct PrereqEventRecorder<'a> {
    events: Option<&'a EventProcessor>,
    with_reasons: bool,
}

impl PrerequisiteEventRecorder for PrereqEventRecorder<'_> {
    fn record(&mut self, event: PrerequisiteEvent<'_>) {
        let Some(events) = self.events else {
            return;
        };
        let flag = event.flag;
        let reason = (self.with_reasons || event.result.force_reason_tracking)
            .then(|| event.result.detail.reason.clone());
        events.send_event(InputEvent::FeatureRequest(FeatureRequestEvent {
            base: BaseEvent::new(event.context.clone()),
            key: flag.key.clone(),
            version: Some(flag.version),
            variation: event.result.detail.variation_index,
            value: event.result.detail.value.clone().unwrap_or(Value::Null),
            default: Value::Null,
            reason,
            prereq_of: Some(event.prereq_of.key.clone()),
            track_events: flag.track_events || event.result.force_reason_tracking,
            debug_events_until_date: flag.debug_events_until_date,
            sampling_ratio: flag.effective_sampling_ratio(),
            exclude_from_summaries: flag.exclude_from_summaries,
        }));
    }
}

fn error_detail(kind: ErrorKind, default: Value) -> Detail {
    Detail {
        value: Some(default),
        variation_index: None,
        reason: Reason::Error { error_kind: kind },
    }
}

fn diagnostic_configuration_summary(
    config: &Config,
    events: &crate::events::EventsConfig,
) -> Value {
    let defaults = crate::config::ServiceEndpoints::default();
    json!({
        "customStreamURI":
            config.service_endpoints.streaming_base_uri != defaults.streaming_base_uri,
        "customBaseURI": config.service_endpoints.polling_base_uri != defaults.polling_base_uri,
        "customEventsURI": config.service_endpoints.events_base_uri != defaults.events_base_uri,
        "eventsCapacity": events.capacity,
        "eventsFlushIntervalMillis": events.flush_interval.as_millis() as u64,
        "contextKeysCapacity": events.context_keys_capacity,
        "contextKeysFlushIntervalMillis": events.context_keys_flush_interval.as_millis() as u64,
        "connectTimeoutMillis": config.http.connect_timeout.as_millis() as u64,
        "allAttributesPrivate": events.all_attributes_private,
        "offline": config.offline,
        "dataStoreType": match &config.data_store {
            DataStoreConfig::InMemory => "memory",
            DataStoreConfig::Persistent { .. } => "custom",
        },
        "streamingDisabled": !matches!(config.data_source, DataSourceConfig::Streaming(_)),
        "usingRelayDaemon": matches!(config.data_source, DataSourceConfig::External),
        "diagnosticRecordingIntervalMillis":
            events.diagnostic_recording_interval.as_millis() as u64,
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextBuilder;

    async fn offline_client() -> Client {
        let mut config = Config::new("sdk-key");
        config.offline = true;
        config.start_wait = Duration::from_millis(100);
        Client::build(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_offline_client_initializes_and_serves_defaults() {
        let client = offline_client().await;
        assert!(client.initialized());
        let context = Context::with_key("u1");
        assert!(!client.bool_variation(&context, "missing", false));
        assert!(client.bool_variation(&context, "missing", true));
        let detail = client.variation_detail(&context, "missing", json!("d"));
        assert_eq!(detail.value, Some(json!("d")));
        assert_eq!(
            detail.reason,
            Reason::Error {
                error_kind: ErrorKind::FlagNotFound
            }
        );
        client.close().await;
    }

    #[tokio::test]
    async fn test_invalid_context_returns_default() {
        let client = offline_client().await;
        let invalid = ContextBuilder::new("").build();
        let detail = client.variation_detail(&invalid, "any", json!(42));
        assert_eq!(detail.value, Some(json!(42)));
        assert_eq!(
            detail.reason,
            Reason::Error {
                error_kind: ErrorKind::UserNotSpecified
            }
        );
        client.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_latches() {
        let client = offline_client().await;
        client.close().await;
        client.close().await;
        let context = Context::with_key("u1");
        let detail = client.variation_detail(&context, "any", json!(1));
        assert_eq!(
            detail.reason,
            Reason::Error {
                error_kind: ErrorKind::ClientNotReady
            }
        );
    }

    #[tokio::test]
    async fn test_all_flags_state_invalid_for_invalid_context() {
        let client = offline_client().await;
        let state = client.all_flags_state(
            &ContextBuilder::new("").build(),
            AllFlagsStateOptions::default(),
        );
        assert!(!state.valid());
        let serialized = serde_json::to_value(&state).unwrap();
        assert_eq!(serialized["$valid"], json!(false));
        client.close().await;
    }
}
