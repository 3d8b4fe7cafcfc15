//! The programmable test data source

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;

use flagflow::config::{DataSourceConfig, DataSourceFactory};
use flagflow::datasource::{DataSource, DataSourceState, InitSignal, UpdateSink};
use flagflow::model::flag::FeatureFlag;
use flagflow::model::segment::Segment;
use flagflow::store::{DataKind, FullDataSet, ItemDescriptor};

#[derive(Default)]
struct TestDataInner {
    flags: HashMap<String, FeatureFlag>,
    segments: HashMap<String, Segment>,
    sinks: Vec<Arc<UpdateSink>>,
}

/// A shared, mutable flag configuration that doubles as a data source.
/// Clones share state; see the crate docs for usage.
#[derive(Clone, Default)]
pub struct TestData {
    inner: Arc<Mutex<TestDataInner>>,
}

impl TestData {
    pub fn new() -> TestData {
        TestData::default()
    }

    /// The config entry that attaches this instance to a client.
    pub fn data_source_config(&self) -> DataSourceConfig {
        DataSourceConfig::Custom(Arc::new(self.clone()))
    }

    /// Starts (or continues) building a flag. An existing flag's current
    /// configuration is the starting point, so incremental updates compose.
    pub fn flag(&self, key: &str) -> FlagBuilder {
        let existing = self.inner.lock().flags.get(key).cloned();
        match existing {
            Some(flag) => FlagBuilder::from_existing(flag),
            None => FlagBuilder::new(key),
        }
    }

    /// Starts (or continues) building a segment.
    pub fn segment(&self, key: &str) -> SegmentBuilder {
        let existing = self.inner.lock().segments.get(key).cloned();
        match existing {
            Some(segment) => SegmentBuilder::from_existing(segment),
            None => SegmentBuilder::new(key),
        }
    }

    /// Applies a flag configuration, bumping its version, and propagates it
    /// to every attached client.
    pub fn update(&self, builder: FlagBuilder) {
        let mut inner = self.inner.lock();
        let version = inner
            .flags
            .get(&builder.key)
            .map(|f| f.version + 1)
            .unwrap_or(1);
        let flag = builder.build(version);
        inner.flags.insert(flag.key.clone(), flag.clone());
        for sink in &inner.sinks {
            let _ = sink.upsert(
                DataKind::Features,
                &flag.key,
                ItemDescriptor::flag(flag.clone()),
            );
        }
    }

    /// Applies a segment configuration; the segment counterpart of
    /// [`TestData::update`].
    pub fn update_segment(&self, builder: SegmentBuilder) {
        let mut inner = self.inner.lock();
        let version = inner
            .segments
            .get(&builder.key)
            .map(|s| s.version + 1)
            .unwrap_or(1);
        let segment = builder.build(version);
        inner.segments.insert(segment.key.clone(), segment.clone());
        for sink in &inner.sinks {
            let _ = sink.upsert(
                DataKind::Segments,
                &segment.key,
                ItemDescriptor::segment(segment.clone()),
            );
        }
    }

    /// Deletes a flag (a versioned tombstone, as the live service would).
    pub fn delete_flag(&self, key: &str) {
        let mut inner = self.inner.lock();
        let version = inner.flags.get(key).map(|f| f.version + 1).unwrap_or(1);
        inner.flags.remove(key);
        for sink in &inner.sinks {
            let _ = sink.upsert(DataKind::Features, key, ItemDescriptor::tombstone(version));
        }
    }

    fn full_data_set(&self) -> FullDataSet {
        let inner = self.inner.lock();
        vec![
            (
                DataKind::Segments,
                inner
                    .segments
                    .values()
                    .map(|s| (s.key.clone(), ItemDescriptor::segment(s.clone())))
                    .collect(),
            ),
            (
                DataKind::Features,
                inner
                    .flags
                    .values()
                    .map(|f| (f.key.clone(), ItemDescriptor::flag(f.clone())))
                    .collect(),
            ),
        ]
    }
}

impl DataSourceFactory for TestData {
    fn create(&self, sink: Arc<UpdateSink>) -> Arc<dyn DataSource> {
        self.inner.lock().sinks.push(Arc::clone(&sink));
        Arc::new(TestDataSource {
            data: self.clone(),
            sink,
            init: Mutex::new(None),
        })
    }
}

struct TestDataSource {
    data: TestData,
    sink: Arc<UpdateSink>,
    init: Mutex<Option<InitSignal>>,
}

#[async_trait]
impl DataSource for TestDataSource {
    fn start(&self) -> InitSignal {
        let mut init = self.init.lock();
        if let Some(signal) = init.as_ref() {
            return signal.clone();
        }
        let ok = self.sink.init(self.data.full_data_set()).is_ok();
        self.sink.update_status(DataSourceState::Valid, None);
        let (tx, rx) = watch::channel(Some(ok));
        drop(tx);
        *init = Some(rx.clone());
        rx
    }

    fn is_initialized(&self) -> bool {
        self.init.lock().is_some()
    }

    async fn close(&self) {
        self.sink.update_status(DataSourceState::Off, None);
    }
}

/// Builds one flag configuration for [`TestData`].
///
/// A new flag starts as an `on` boolean flag with variations
/// `[true, false]`, serving `true` on fallthrough and `false` when off.
#[derive(Clone, Debug)]
pub struct FlagBuilder {
    pub(crate) key: String,
    on: bool,
    variations: Vec<Value>,
    off_variation: Option<usize>,
    fallthrough: Value,
    targets: Vec<Value>,
    context_targets: Vec<Value>,
    rules: Vec<Value>,
    prerequisites: Vec<Value>,
    salt: String,
    track_events: bool,
    debug_events_until_date: Option<u64>,
}

impl FlagBuilder {
    fn new(key: &str) -> FlagBuilder {
        FlagBuilder {
            key: key.to_string(),
            on: true,
            variations: vec![json!(true), json!(false)],
            off_variation: Some(1),
            fallthrough: json!({"variation": 0}),
            targets: Vec::new(),
            context_targets: Vec::new(),
            rules: Vec::new(),
            prerequisites: Vec::new(),
            salt: "salt".to_string(),
            track_events: false,
            debug_events_until_date: None,
        }
    }

    fn from_existing(flag: FeatureFlag) -> FlagBuilder {
        // Round-trip through the wire form so the builder need not mirror
        // every field.
        let value = serde_json::to_value(&flag).unwrap();
        FlagBuilder {
            key: flag.key.clone(),
            on: flag.on,
            variations: flag.variations.clone(),
            off_variation: flag.off_variation,
            fallthrough: value.get("fallthrough").cloned().unwrap_or(json!({})),
            targets: value
                .get("targets")
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default(),
            context_targets: value
                .get("contextTargets")
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default(),
            rules: value
                .get("rules")
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default(),
            prerequisites: value
                .get("prerequisites")
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default(),
            salt: flag.salt.clone(),
            track_events: flag.track_events,
            debug_events_until_date: flag.debug_events_until_date,
        }
    }

    pub fn on(mut self, on: bool) -> FlagBuilder {
        self.on = on;
        self
    }

    /// Replaces the variation list with arbitrary JSON values.
    pub fn variations(mut self, variations: Vec<Value>) -> FlagBuilder {
        self.variations = variations;
        self
    }

    pub fn off_variation(mut self, index: usize) -> FlagBuilder {
        self.off_variation = Some(index);
        self
    }

    pub fn fallthrough_variation(mut self, index: usize) -> FlagBuilder {
        self.fallthrough = json!({ "variation": index });
        self
    }

    /// A percentage rollout on fallthrough; weights are parts per 100000,
    /// one per variation index.
    pub fn fallthrough_rollout(mut self, weights: Vec<(usize, u32)>) -> FlagBuilder {
        let variations: Vec<Value> = weights
            .into_iter()
            .map(|(variation, weight)| json!({"variation": variation, "weight": weight}))
            .collect();
        self.fallthrough = json!({ "rollout": { "variations": variations } });
        self
    }

    /// Shorthand: a boolean flag serving `value` to everyone.
    pub fn variation_for_all(mut self, value: bool) -> FlagBuilder {
        self.variations = vec![json!(true), json!(false)];
        self.off_variation = Some(1);
        self.fallthrough = json!({"variation": if value { 0 } else { 1 }});
        self.on = true;
        self
    }

    /// Targets specific context keys (default kind) to a variation.
    pub fn target(mut self, variation: usize, keys: Vec<&str>) -> FlagBuilder {
        self.targets
            .push(json!({"variation": variation, "values": keys}));
        self
    }

    /// Adds a rule matching `attribute in values` serving `variation`.
    pub fn rule_match(
        mut self,
        attribute: &str,
        values: Vec<Value>,
        variation: usize,
    ) -> FlagBuilder {
        let index = self.rules.len();
        self.rules.push(json!({
            "id": format!("rule{index}"),
            "clauses": [{"attribute": attribute, "op": "in", "values": values, "contextKind": "user"}],
            "variation": variation,
        }));
        self
    }

    /// Adds a rule matching membership in a segment.
    pub fn rule_segment_match(mut self, segment_key: &str, variation: usize) -> FlagBuilder {
        let index = self.rules.len();
        self.rules.push(json!({
            "id": format!("rule{index}"),
            "clauses": [{"attribute": "", "op": "segmentMatch", "values": [segment_key]}],
            "variation": variation,
        }));
        self
    }

    pub fn prerequisite(mut self, key: &str, variation: usize) -> FlagBuilder {
        self.prerequisites
            .push(json!({"key": key, "variation": variation}));
        self
    }

    pub fn salt(mut self, salt: &str) -> FlagBuilder {
        self.salt = salt.to_string();
        self
    }

    pub fn track_events(mut self, track: bool) -> FlagBuilder {
        self.track_events = track;
        self
    }

    pub fn debug_events_until_date(mut self, until_ms: u64) -> FlagBuilder {
        self.debug_events_until_date = Some(until_ms);
        self
    }

    fn build(&self, version: u64) -> FeatureFlag {
        let mut value = json!({
            "key": self.key,
            "version": version,
            "on": self.on,
            "variations": self.variations,
            "fallthrough": self.fallthrough,
            "targets": self.targets,
            "contextTargets": self.context_targets,
            "rules": self.rules,
            "prerequisites": self.prerequisites,
            "salt": self.salt,
            "trackEvents": self.track_events,
        });
        if let Some(off) = self.off_variation {
            value["offVariation"] = json!(off);
        }
        if let Some(until) = self.debug_events_until_date {
            value["debugEventsUntilDate"] = json!(until);
        }
        let mut flag: FeatureFlag = serde_json::from_value(value).unwrap();
        flag.preprocess();
        flag
    }
}

/// Builds one segment configuration for [`TestData`].
#[derive(Clone, Debug)]
pub struct SegmentBuilder {
    pub(crate) key: String,
    included: Vec<String>,
    excluded: Vec<String>,
    rules: Vec<Value>,
    unbounded: bool,
    generation: Option<u64>,
    salt: String,
}

impl SegmentBuilder {
    fn new(key: &str) -> SegmentBuilder {
        SegmentBuilder {
            key: key.to_string(),
            included: Vec::new(),
            excluded: Vec::new(),
            rules: Vec::new(),
            unbounded: false,
            generation: None,
            salt: "salt".to_string(),
        }
    }

    fn from_existing(segment: Segment) -> SegmentBuilder {
        let value = serde_json::to_value(&segment).unwrap();
        SegmentBuilder {
            key: segment.key.clone(),
            included: segment.included.clone(),
            excluded: segment.excluded.clone(),
            rules: value
                .get("rules")
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default(),
            unbounded: segment.unbounded,
            generation: segment.generation,
            salt: segment.salt.clone(),
        }
    }

    pub fn included(mut self, keys: Vec<&str>) -> SegmentBuilder {
        self.included = keys.into_iter().map(String::from).collect();
        self
    }

    pub fn excluded(mut self, keys: Vec<&str>) -> SegmentBuilder {
        self.excluded = keys.into_iter().map(String::from).collect();
        self
    }

    /// Adds a rule matching `attribute in values`, optionally weighted
    /// (parts per 100000).
    pub fn rule_match(
        mut self,
        attribute: &str,
        values: Vec<Value>,
        weight: Option<u32>,
    ) -> SegmentBuilder {
        let mut rule = json!({
            "clauses": [{"attribute": attribute, "op": "in", "values": values, "contextKind": "user"}],
        });
        if let Some(weight) = weight {
            rule["weight"] = json!(weight);
        }
        self.rules.push(rule);
        self
    }

    pub fn unbounded(mut self, generation: u64) -> SegmentBuilder {
        self.unbounded = true;
        self.generation = Some(generation);
        self
    }

    fn build(&self, version: u64) -> Segment {
        let mut value = json!({
            "key": self.key,
            "version": version,
            "included": self.included,
            "excluded": self.excluded,
            "rules": self.rules,
            "salt": self.salt,
            "unbounded": self.unbounded,
        });
        if let Some(generation) = self.generation {
            value["generation"] = json!(generation);
        }
        let mut segment: Segment = serde_json::from_value(value).unwrap();
        segment.preprocess();
        segment
    }
}
