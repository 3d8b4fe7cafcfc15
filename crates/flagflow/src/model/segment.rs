//! User segment data model

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::context::{AttributeRef, Kind};
use crate::model::clause::Clause;

/// A segment: a named membership predicate over evaluation contexts,
/// referenced from flag rules via the `segmentMatch` operator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub key: String,
    pub version: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    /// Explicitly included keys for the default context kind.
    #[serde(default)]
    pub included: Vec<String>,
    /// Explicitly excluded keys for the default context kind.
    #[serde(default)]
    pub excluded: Vec<String>,
    /// Included keys per non-default context kind.
    #[serde(default)]
    pub included_contexts: Vec<SegmentTarget>,
    /// Excluded keys per non-default context kind.
    #[serde(default)]
    pub excluded_contexts: Vec<SegmentTarget>,
    #[serde(default)]
    pub rules: Vec<SegmentRule>,
    #[serde(default)]
    pub salt: String,
    /// True when membership is held in an external big-segment store rather
    /// than in this entity.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unbounded: bool,
    /// Context kind whose key is looked up in the big-segment store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unbounded_context_kind: Option<Kind>,
    /// Increments each time external membership is re-synced; part of the
    /// membership lookup key. An unbounded segment without a generation is
    /// unqueryable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
    #[serde(skip)]
    pub(crate) included_set: HashSet<String>,
    #[serde(skip)]
    pub(crate) excluded_set: HashSet<String>,
}

impl Segment {
    /// The big-segment membership lookup key, `"{key}.g{generation}"`.
    pub fn unbounded_segment_ref(&self) -> Option<String> {
        self.generation.map(|g| format!("{}.g{}", self.key, g))
    }

    pub(crate) fn included_contains(&self, key: &str) -> bool {
        if self.included_set.is_empty() && !self.included.is_empty() {
            self.included.iter().any(|v| v == key)
        } else {
            self.included_set.contains(key)
        }
    }

    pub(crate) fn excluded_contains(&self, key: &str) -> bool {
        if self.excluded_set.is_empty() && !self.excluded.is_empty() {
            self.excluded.iter().any(|v| v == key)
        } else {
            self.excluded_set.contains(key)
        }
    }
}

/// A per-kind list of explicitly included or excluded context keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_kind: Option<Kind>,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(skip)]
    pub(crate) values_set: HashSet<String>,
}

impl SegmentTarget {
    pub(crate) fn contains(&self, key: &str) -> bool {
        if self.values_set.is_empty() && !self.values.is_empty() {
            self.values.iter().any(|v| v == key)
        } else {
            self.values_set.contains(key)
        }
    }
}

/// A segment rule: clauses plus an optional weighted "bucket in" gate.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRule {
    #[serde(default)]
    pub clauses: Vec<Clause>,
    /// If set, a matching context is only in the segment when its bucket
    /// (parts per 100000) falls under this weight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_by: Option<AttributeRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_context_kind: Option<Kind>,
}
