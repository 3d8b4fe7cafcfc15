//! Clauses: the predicates inside flag and segment rules

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{AttributeRef, Kind};
use crate::eval::operators;

/// A clause operator.
///
/// Unrecognized operator names deserialize to [`Operator::Unknown`], which
/// matches nothing; this keeps newly introduced server-side operators from
/// breaking older SDK versions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    In,
    StartsWith,
    EndsWith,
    Matches,
    Contains,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Before,
    After,
    SemVerEqual,
    SemVerLessThan,
    SemVerGreaterThan,
    SegmentMatch,
    #[serde(other)]
    Unknown,
}

/// A single predicate over one context attribute.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clause {
    /// Which individual context the attribute is read from. Absent in data
    /// written before context kinds existed; treated as the default kind,
    /// with `attribute` interpreted as a literal name rather than a path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_kind: Option<Kind>,
    /// The attribute reference, in its string form.
    pub attribute: String,
    pub op: Operator,
    #[serde(default)]
    pub values: Vec<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub negate: bool,
    #[serde(skip)]
    pub(crate) preprocessed: ClausePreprocessed,
}

impl Clause {
    /// The parsed attribute reference, borrowed from the preprocessed form
    /// on the hot path. Falls back to parsing on the spot if the clause was
    /// built without [`Clause::preprocess`] (test data).
    pub(crate) fn attribute_ref(&self) -> std::borrow::Cow<'_, AttributeRef> {
        match &self.preprocessed.attr {
            Some(r) => std::borrow::Cow::Borrowed(r),
            None => std::borrow::Cow::Owned(self.parse_attribute()),
        }
    }

    fn parse_attribute(&self) -> AttributeRef {
        if self.context_kind.is_some() {
            AttributeRef::new(self.attribute.clone())
        } else {
            AttributeRef::literal(self.attribute.clone())
        }
    }

    /// Resolves comparand forms once at ingestion so the evaluation hot path
    /// never re-parses them:
    /// `in` with two or more values gets a constant-time lookup set; regex,
    /// date, and semver operators get their parsed comparands (unparsable
    /// values are kept as `None` and never match).
    pub(crate) fn preprocess(&mut self) {
        let mut pre = ClausePreprocessed {
            attr: Some(self.parse_attribute()),
            values_set: None,
            parsed: None,
        };
        match self.op {
            Operator::In if self.values.len() >= 2 => {
                let mut set = HashSet::with_capacity(self.values.len());
                let mut all_scalar = true;
                for v in &self.values {
                    match ScalarKey::from_value(v) {
                        Some(k) => {
                            set.insert(k);
                        }
                        None => all_scalar = false,
                    }
                }
                // Non-scalar comparands fall back to the linear path; mixing
                // them with a partial set would change negation semantics.
                if all_scalar {
                    pre.values_set = Some(set);
                }
            }
            Operator::Matches => {
                pre.parsed = Some(
                    self.values
                        .iter()
                        .map(|v| PreparsedValue::Regex(v.as_str().and_then(operators::parse_regex)))
                        .collect(),
                );
            }
            Operator::Before | Operator::After => {
                pre.parsed = Some(
                    self.values
                        .iter()
                        .map(|v| PreparsedValue::Date(operators::parse_date_millis(v)))
                        .collect(),
                );
            }
            Operator::SemVerEqual | Operator::SemVerLessThan | Operator::SemVerGreaterThan => {
                pre.parsed = Some(
                    self.values
                        .iter()
                        .map(|v| {
                            PreparsedValue::SemVer(v.as_str().and_then(operators::parse_semver))
                        })
                        .collect(),
                );
            }
            _ => {}
        }
        self.preprocessed = pre;
    }
}

/// Ingestion-time derived clause data; never serialized.
#[derive(Clone, Debug, Default)]
pub(crate) struct ClausePreprocessed {
    pub attr: Option<AttributeRef>,
    pub values_set: Option<HashSet<ScalarKey>>,
    pub parsed: Option<Vec<PreparsedValue>>,
}

/// One preparsed comparand, aligned by index with `Clause::values`.
#[derive(Clone, Debug)]
pub(crate) enum PreparsedValue {
    Regex(Option<regex::Regex>),
    /// Milliseconds since the Unix epoch.
    Date(Option<f64>),
    SemVer(Option<semver::Version>),
}

/// A hashable key for scalar JSON values, used by the `in` lookup set.
///
/// Numbers compare by numeric value, so `1` and `1.0` collide as required.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum ScalarKey {
    Null,
    Bool(bool),
    Num(u64),
    Str(String),
}

impl ScalarKey {
    pub(crate) fn from_value(v: &Value) -> Option<ScalarKey> {
        match v {
            Value::Null => Some(ScalarKey::Null),
            Value::Bool(b) => Some(ScalarKey::Bool(*b)),
            Value::Number(n) => {
                let f = n.as_f64()?;
                // Collapse -0.0 onto 0.0 so the two forms collide.
                let f = if f == 0.0 { 0.0 } else { f };
                Some(ScalarKey::Num(f.to_bits()))
            }
            Value::String(s) => Some(ScalarKey::Str(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }
}
