//! Ingestion-time precomputation
//!
//! Every result object the evaluator can serve for a flag is built once,
//! when the flag enters the local store, and shared thereafter. Repeated
//! evaluations of the same flag state return the *same* `Arc<Detail>`, which
//! also lets callers detect unchanged results by pointer identity.

use std::sync::Arc;

use crate::eval::detail::{Detail, ErrorKind, Reason};
use crate::model::flag::FeatureFlag;
use crate::model::segment::Segment;

/// A precomputed result in both its regular and in-experiment forms.
#[derive(Clone, Debug)]
pub(crate) struct ResultPair {
    pub regular: Arc<Detail>,
    pub in_experiment: Arc<Detail>,
}

impl ResultPair {
    pub fn get(&self, in_experiment: bool) -> Arc<Detail> {
        if in_experiment {
            Arc::clone(&self.in_experiment)
        } else {
            Arc::clone(&self.regular)
        }
    }
}

/// Precomputed per-flag results; never serialized.
#[derive(Clone, Debug, Default)]
pub(crate) struct FlagPreprocessed {
    /// Result served whenever the flag is off.
    pub off_result: Option<Arc<Detail>>,
    /// Fallthrough results indexed by variation.
    pub fallthrough_results: Vec<ResultPair>,
}

/// Precomputed per-rule results; never serialized.
#[derive(Clone, Debug, Default)]
pub(crate) struct RulePreprocessed {
    /// Indexed by variation; populated only for variations this rule can
    /// select via its fixed variation or rollout entries.
    pub results: Vec<Option<ResultPair>>,
}

/// Builds a result for serving `index`, or a malformed-flag error when the
/// index is out of range for the flag's variation list. The evaluator falls
/// back to this for data that skipped preprocessing.
pub(crate) fn variation_result(flag: &FeatureFlag, index: Option<usize>, reason: Reason) -> Detail {
    match index {
        None => Detail {
            value: None,
            variation_index: None,
            reason,
        },
        Some(i) => match flag.variation_value(i) {
            Some(value) => Detail {
                value: Some(value.clone()),
                variation_index: Some(i),
                reason,
            },
            None => Detail::error(ErrorKind::MalformedFlag),
        },
    }
}

impl FeatureFlag {
    /// Resolves all derived state after deserialization. Must run before the
    /// flag is handed to the evaluator; the ingestion paths (stream, poll,
    /// persistent-store reads, test fixtures) all call it.
    pub fn preprocess(&mut self) {
        let off = Arc::new(variation_result(self, self.off_variation, Reason::Off));

        let fallthrough_results = (0..self.variations.len())
            .map(|i| ResultPair {
                regular: Arc::new(variation_result(
                    self,
                    Some(i),
                    Reason::Fallthrough {
                        in_experiment: false,
                    },
                )),
                in_experiment: Arc::new(variation_result(
                    self,
                    Some(i),
                    Reason::Fallthrough {
                        in_experiment: true,
                    },
                )),
            })
            .collect();

        let prereq_results: Vec<Arc<Detail>> = self
            .prerequisites
            .iter()
            .map(|p| {
                Arc::new(variation_result(
                    self,
                    self.off_variation,
                    Reason::PrerequisiteFailed {
                        prerequisite_key: p.key.clone(),
                    },
                ))
            })
            .collect();

        let target_results: Vec<(std::collections::HashSet<String>, Arc<Detail>)> = self
            .targets
            .iter()
            .map(|t| {
                (
                    t.values.iter().cloned().collect(),
                    Arc::new(variation_result(self, Some(t.variation), Reason::TargetMatch)),
                )
            })
            .collect();
        let context_target_results: Vec<(std::collections::HashSet<String>, Arc<Detail>)> = self
            .context_targets
            .iter()
            .map(|t| {
                (
                    t.values.iter().cloned().collect(),
                    Arc::new(variation_result(self, Some(t.variation), Reason::TargetMatch)),
                )
            })
            .collect();

        let rule_results: Vec<RulePreprocessed> = self
            .rules
            .iter()
            .enumerate()
            .map(|(rule_index, rule)| {
                let mut results = vec![None; self.variations.len()];
                let mut add = |i: usize| {
                    if i < self.variations.len() {
                        let reason = |in_experiment| Reason::RuleMatch {
                            rule_index,
                            rule_id: rule.id.clone(),
                            in_experiment,
                        };
                        results[i] = Some(ResultPair {
                            regular: Arc::new(variation_result(self, Some(i), reason(false))),
                            in_experiment: Arc::new(variation_result(self, Some(i), reason(true))),
                        });
                    }
                };
                if let Some(v) = rule.variation_or_rollout.variation {
                    add(v);
                }
                if let Some(rollout) = &rule.variation_or_rollout.rollout {
                    for wv in &rollout.variations {
                        add(wv.variation);
                    }
                }
                RulePreprocessed { results }
            })
            .collect();

        self.preprocessed = FlagPreprocessed {
            off_result: Some(off),
            fallthrough_results,
        };
        for (p, result) in self.prerequisites.iter_mut().zip(prereq_results) {
            p.failed_result = Some(result);
        }
        for (t, (set, result)) in self.targets.iter_mut().zip(target_results) {
            t.values_set = set;
            t.match_result = Some(result);
        }
        for (t, (set, result)) in self.context_targets.iter_mut().zip(context_target_results) {
            t.values_set = set;
            t.match_result = Some(result);
        }
        for (rule, pre) in self.rules.iter_mut().zip(rule_results) {
            rule.preprocessed = pre;
            for clause in &mut rule.clauses {
                clause.preprocess();
            }
        }
    }
}

impl Segment {
    /// Resolves all derived state after deserialization; the counterpart of
    /// [`FeatureFlag::preprocess`].
    pub fn preprocess(&mut self) {
        self.included_set = self.included.iter().cloned().collect();
        self.excluded_set = self.excluded.iter().cloned().collect();
        for target in &mut self.included_contexts {
            target.values_set = target.values.iter().cloned().collect();
        }
        for target in &mut self.excluded_contexts {
            target.values_set = target.values.iter().cloned().collect();
        }
        for rule in &mut self.rules {
            for clause in &mut rule.clauses {
                clause.preprocess();
            }
        }
    }
}
