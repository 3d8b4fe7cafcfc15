//! Feature flag data model
//!
//! These types mirror the wire JSON delivered by the configuration service.
//! After deserialization (and before a flag is visible to the evaluator) the
//! ingestion path calls [`FeatureFlag::preprocess`], which resolves clause
//! comparands and precomputes every result object the evaluator can serve,
//! so the evaluation hot path allocates nothing.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{AttributeRef, Kind};
use crate::eval::detail::Detail;
use crate::model::clause::Clause;
use crate::model::preprocessed::{FlagPreprocessed, RulePreprocessed};

/// A feature flag: a named rule set mapping evaluation contexts to one of a
/// list of variation values.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub key: String,
    pub version: u64,
    /// Tombstone marker carried in serialized form for persistent stores.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(default)]
    pub on: bool,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    /// Legacy individual targets for the default context kind.
    #[serde(default)]
    pub targets: Vec<Target>,
    /// Individual targets carrying explicit context kinds. When present,
    /// these drive target evaluation; default-kind entries delegate their
    /// value lists back to `targets` (see evaluator).
    #[serde(default)]
    pub context_targets: Vec<Target>,
    #[serde(default)]
    pub rules: Vec<FlagRule>,
    #[serde(default)]
    pub fallthrough: VariationOrRollout,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub off_variation: Option<usize>,
    #[serde(default)]
    pub variations: Vec<Value>,
    /// Seed string mixed into bucket hashing for this flag.
    #[serde(default)]
    pub salt: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub client_side: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub track_events: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub track_events_fallthrough: bool,
    /// If set and in the future, full-fidelity debug copies of evaluation
    /// events are emitted until this time (milliseconds since epoch).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_events_until_date: Option<u64>,
    /// 1-in-n sampling for individually emitted evaluation events. Absent
    /// means 1 (emit all); 0 suppresses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_ratio: Option<u32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exclude_from_summaries: bool,
    #[serde(skip)]
    pub(crate) preprocessed: FlagPreprocessed,
}

impl FeatureFlag {
    /// The variation value at `index`, if in range.
    pub fn variation_value(&self, index: usize) -> Option<&Value> {
        self.variations.get(index)
    }

    /// Effective sampling ratio (see `sampling_ratio`).
    pub fn effective_sampling_ratio(&self) -> u32 {
        self.sampling_ratio.unwrap_or(1)
    }

    /// Whether the debug window is open relative to the given times.
    ///
    /// Both the local clock and the last server-reported time must be before
    /// the cutoff; the server time is authoritative for closing the window
    /// when local clocks drift.
    pub fn debugging_until(&self, now_ms: u64, last_known_server_time_ms: u64) -> bool {
        match self.debug_events_until_date {
            Some(until) => until > now_ms && until > last_known_server_time_ms,
            None => false,
        }
    }
}

/// Another flag whose evaluation must land on a required variation before
/// this flag evaluates normally.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prerequisite {
    pub key: String,
    pub variation: usize,
    #[serde(skip)]
    pub(crate) failed_result: Option<Arc<Detail>>,
}

/// An explicit key-to-variation mapping that bypasses rules.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Absent on legacy (`targets`) entries; those apply to the default kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_kind: Option<Kind>,
    pub variation: usize,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(skip)]
    pub(crate) values_set: HashSet<String>,
    #[serde(skip)]
    pub(crate) match_result: Option<Arc<Detail>>,
}

impl Target {
    pub(crate) fn contains(&self, key: &str) -> bool {
        if self.values_set.is_empty() && !self.values.is_empty() {
            // Built without preprocessing (test data); linear scan.
            self.values.iter().any(|v| v == key)
        } else {
            self.values_set.contains(key)
        }
    }
}

/// An ordered rule: all clauses must match, first matching rule wins.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub track_events: bool,
    #[serde(skip)]
    pub(crate) preprocessed: RulePreprocessed,
}

/// Either a fixed variation index or a weighted rollout. Exactly one side
/// should be present; neither present makes the flag malformed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariationOrRollout {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<Rollout>,
}

/// How a rollout distributes contexts across variations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RolloutKind {
    /// Percentage rollout; participation is not individually tracked.
    #[default]
    Rollout,
    /// Experiment; participants are tracked unless the selected bucket is
    /// marked untracked.
    Experiment,
}

/// A weighted distribution of contexts across variations.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    #[serde(default)]
    pub kind: RolloutKind,
    /// Which individual context supplies the bucketing attribute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_kind: Option<Kind>,
    /// Attribute used for bucketing; defaults to the context key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_by: Option<AttributeRef>,
    #[serde(default)]
    pub variations: Vec<WeightedVariation>,
    /// Optional fixed hash seed; replaces the flag key + salt prefix so
    /// experiments can share bucket assignments across flags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

impl Rollout {
    pub fn is_experiment(&self) -> bool {
        self.kind == RolloutKind::Experiment
    }
}

/// One slice of a rollout: `weight` is parts per 100000.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedVariation {
    pub variation: usize,
    pub weight: u32,
    /// Experiment buckets marked untracked do not report participation.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub untracked: bool,
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flag_deserialization_minimal() {
        let flag: FeatureFlag =
            serde_json::from_value(json!({"key": "f1", "version": 3})).unwrap();
        assert_eq!(flag.key, "f1");
        assert_eq!(flag.version, 3);
        assert!(!flag.on);
        assert!(flag.variations.is_empty());
        assert!(flag.off_variation.is_none());
        assert_eq!(flag.effective_sampling_ratio(), 1);
    }

    #[test]
    fn test_rule_variation_is_flattened() {
        let flag: FeatureFlag = serde_json::from_value(json!({
            "key": "f1",
            "version": 1,
            "rules": [
                {"id": "r0", "clauses": [], "variation": 2},
                {"id": "r1", "clauses": [], "rollout": {
                    "variations": [{"variation": 0, "weight": 100000}]
                }}
            ]
        }))
        .unwrap();
        assert_eq!(flag.rules[0].variation_or_rollout.variation, Some(2));
        let rollout = flag.rules[1].variation_or_rollout.rollout.as_ref().unwrap();
        assert_eq!(rollout.variations[0].weight, 100000);
        assert_eq!(rollout.kind, RolloutKind::Rollout);
    }

    #[test]
    fn test_experiment_rollout_kind() {
        let rollout: Rollout = serde_json::from_value(json!({
            "kind": "experiment",
            "seed": 61,
            "variations": [{"variation": 0, "weight": 50000, "untracked": true}]
        }))
        .unwrap();
        assert!(rollout.is_experiment());
        assert_eq!(rollout.seed, Some(61));
        assert!(rollout.variations[0].untracked);
    }

    #[test]
    fn test_debug_window_respects_server_time() {
        let flag: FeatureFlag = serde_json::from_value(
            json!({"key": "f1", "version": 1, "debugEventsUntilDate": 2000}),
        )
        .unwrap();
        assert!(flag.debugging_until(1000, 1000));
        // Local clock is behind, but the server already saw the cutoff pass.
        assert!(!flag.debugging_until(1000, 3000));
        assert!(!flag.debugging_until(3000, 1000));
    }

    #[test]
    fn test_flag_round_trips_without_preprocessed_state() {
        let original = json!({
            "key": "f1",
            "version": 2,
            "on": true,
            "salt": "abc",
            "variations": [true, false],
            "offVariation": 1,
            "fallthrough": {"variation": 0},
            "targets": [{"variation": 0, "values": ["u1"]}]
        });
        let flag: FeatureFlag = serde_json::from_value(original.clone()).unwrap();
        let back = serde_json::to_value(&flag).unwrap();
        assert_eq!(back["key"], original["key"]);
        assert_eq!(back["targets"], original["targets"]);
        assert!(back.get("preprocessed").is_none());
    }
}
