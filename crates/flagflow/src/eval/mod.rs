//! The flag evaluator
//!
//! A pure, allocation-averse engine: given a flag, a context, and read access
//! to the local rule replica, it deterministically produces an evaluation
//! result. Results for every reachable outcome are precomputed at ingestion
//! (see [`crate::model::preprocessed`]), so the hot path hands back shared
//! `Arc<Detail>` objects instead of building new ones.
//!
//! Prerequisite evaluations are pushed to a caller-supplied recorder as they
//! happen; nothing is collected into intermediate lists. All failures become
//! result objects with an error reason. The evaluator never returns `Err` to
//! the application and never panics on malformed data.

pub mod bucketing;
pub mod detail;
pub mod operators;

pub use detail::{BigSegmentsStatus, Detail, ErrorKind, Reason};

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::context::{Context, Kind};
use crate::model::clause::{Clause, Operator};
use crate::model::flag::{FeatureFlag, FlagRule, Target};
use crate::model::preprocessed::variation_result;
use crate::model::segment::Segment;

/// Read access to the rule replica during an evaluation.
///
/// Implemented by the data stores; errors surface as `EXCEPTION` results.
pub trait EvaluationStore: Send + Sync {
    fn get_flag(&self, key: &str) -> Result<Option<Arc<FeatureFlag>>, crate::errors::Error>;
    fn get_segment(&self, key: &str) -> Result<Option<Arc<Segment>>, crate::errors::Error>;
}

/// Membership of one context in external (big) segments, keyed by
/// `"{segmentKey}.g{generation}"`: `true` include, `false` exclude.
pub type BigSegmentMembership = HashMap<String, bool>;

/// One big-segment lookup outcome.
#[derive(Clone, Debug)]
pub struct MembershipResult {
    pub membership: Option<Arc<BigSegmentMembership>>,
    pub status: BigSegmentsStatus,
}

/// Big-segment lookups as seen from the evaluator; implemented by the
/// big-segment store wrapper.
pub trait BigSegmentsQuery: Send + Sync {
    fn query_membership(&self, context_key: &str) -> MembershipResult;
}

/// A prerequisite evaluation, reported as a side channel while the parent
/// flag is being evaluated.
pub struct PrerequisiteEvent<'a> {
    /// The prerequisite flag that was evaluated.
    pub flag: &'a FeatureFlag,
    /// The flag whose evaluation required it.
    pub prereq_of: &'a FeatureFlag,
    pub context: &'a Context,
    pub result: EvalResult,
}

/// Receives prerequisite evaluations during [`Evaluator::evaluate`].
pub trait PrerequisiteEventRecorder {
    fn record(&mut self, event: PrerequisiteEvent<'_>);
}

/// Discards prerequisite events.
pub struct NoopRecorder;

impl PrerequisiteEventRecorder for NoopRecorder {
    fn record(&mut self, _event: PrerequisiteEvent<'_>) {}
}

/// The full outcome of one evaluation.
#[derive(Clone, Debug)]
pub struct EvalResult {
    pub detail: Arc<Detail>,
    /// True when analytics must report the reason for this evaluation even
    /// if the caller did not ask for reasons: experiment participation, or a
    /// matched rule / fallthrough with event tracking enabled.
    pub force_reason_tracking: bool,
    /// Present when the evaluation consulted big-segment data.
    pub big_segments_status: Option<BigSegmentsStatus>,
}

impl EvalResult {
    fn from_detail(detail: Arc<Detail>, force_reason_tracking: bool) -> EvalResult {
        EvalResult {
            detail,
            force_reason_tracking,
            big_segments_status: None,
        }
    }

    /// An error result with no value; the caller substitutes its default.
    pub fn error(kind: ErrorKind) -> EvalResult {
        EvalResult::from_detail(Arc::new(Detail::error(kind)), false)
    }
}

// Failures that abort the walk and become a single error result at the top.
enum EvalErr {
    Malformed,
    Exception,
}

// Per-evaluation scratch: cycle stacks and the big-segment lookups already
// performed for this context. Deliberately plain vectors; depth is bounded
// and expected small.
struct Scratch {
    prereq_stack: Vec<String>,
    segment_stack: Vec<String>,
    big_segments_status: Option<BigSegmentsStatus>,
    membership: HashMap<String, MembershipResult>,
}

impl Scratch {
    fn new() -> Scratch {
        Scratch {
            prereq_stack: Vec::new(),
            segment_stack: Vec::new(),
            big_segments_status: None,
            membership: HashMap::new(),
        }
    }

    fn note_big_segments_status(&mut self, status: BigSegmentsStatus) {
        self.big_segments_status = Some(match self.big_segments_status {
            Some(current) => current.merge(status),
            None => status,
        });
    }
}

/// Evaluates flags against a read-only view of the rule replica.
pub struct Evaluator {
    store: Arc<dyn EvaluationStore>,
    big_segments: Option<Arc<dyn BigSegmentsQuery>>,
}

impl Evaluator {
    pub fn new(
        store: Arc<dyn EvaluationStore>,
        big_segments: Option<Arc<dyn BigSegmentsQuery>>,
    ) -> Evaluator {
        Evaluator {
            store,
            big_segments,
        }
    }

    /// Evaluates `flag` for `context`, reporting prerequisite evaluations to
    /// `recorder` as they happen.
    pub fn evaluate(
        &self,
        flag: &FeatureFlag,
        context: &Context,
        recorder: &mut dyn PrerequisiteEventRecorder,
    ) -> EvalResult {
        if !context.valid() {
            warn!(
                flag_key = %flag.key,
                error = context.error().unwrap_or("unknown"),
                "evaluation requested with an invalid context"
            );
            return EvalResult::error(ErrorKind::UserNotSpecified);
        }
        let mut scratch = Scratch::new();
        let mut result = match self.evaluate_internal(flag, context, recorder, &mut scratch) {
            Ok(result) => result,
            Err(EvalErr::Malformed) => EvalResult::error(ErrorKind::MalformedFlag),
            Err(EvalErr::Exception) => EvalResult::error(ErrorKind::Exception),
        };
        result.big_segments_status = scratch.big_segments_status;
        result
    }

    fn evaluate_internal(
        &self,
        flag: &FeatureFlag,
        context: &Context,
        recorder: &mut dyn PrerequisiteEventRecorder,
        scratch: &mut Scratch,
    ) -> Result<EvalResult, EvalErr> {
        if !flag.on {
            return Ok(self.off_result(flag));
        }

        if let Some(failed) = self.check_prerequisites(flag, context, recorder, scratch)? {
            return Ok(failed);
        }

        if let Some(detail) = self.match_targets(flag, context) {
            return Ok(EvalResult::from_detail(detail, false));
        }

        for (rule_index, rule) in flag.rules.iter().enumerate() {
            if self.rule_matches(rule, context, scratch)? {
                return self.rule_result(flag, rule_index, rule, context);
            }
        }

        self.fallthrough_result(flag, context)
    }

    fn off_result(&self, flag: &FeatureFlag) -> EvalResult {
        let detail = match &flag.preprocessed.off_result {
            Some(detail) => Arc::clone(detail),
            None => Arc::new(variation_result(flag, flag.off_variation, Reason::Off)),
        };
        EvalResult::from_detail(detail, false)
    }

    // Returns Ok(Some(result)) when a prerequisite failed and the off result
    // must be served; Ok(None) when all prerequisites are satisfied.
    fn check_prerequisites(
        &self,
        flag: &FeatureFlag,
        context: &Context,
        recorder: &mut dyn PrerequisiteEventRecorder,
        scratch: &mut Scratch,
    ) -> Result<Option<EvalResult>, EvalErr> {
        if flag.prerequisites.is_empty() {
            return Ok(None);
        }
        scratch.prereq_stack.push(flag.key.clone());
        let outcome = self.walk_prerequisites(flag, context, recorder, scratch);
        scratch.prereq_stack.pop();
        outcome
    }

    fn walk_prerequisites(
        &self,
        flag: &FeatureFlag,
        context: &Context,
        recorder: &mut dyn PrerequisiteEventRecorder,
        scratch: &mut Scratch,
    ) -> Result<Option<EvalResult>, EvalErr> {
        for (index, prereq) in flag.prerequisites.iter().enumerate() {
            if scratch.prereq_stack.iter().any(|k| *k == prereq.key) {
                warn!(
                    flag_key = %flag.key,
                    prerequisite = %prereq.key,
                    "prerequisite relationship to itself or a circular reference; flag is treated as malformed"
                );
                return Err(EvalErr::Malformed);
            }
            let prereq_flag = match self.store.get_flag(&prereq.key) {
                Ok(Some(f)) => f,
                Ok(None) => return Ok(Some(self.prerequisite_failed_result(flag, index))),
                Err(e) => {
                    warn!(
                        flag_key = %flag.key,
                        prerequisite = %prereq.key,
                        error = %e,
                        "data store error while fetching prerequisite"
                    );
                    return Err(EvalErr::Exception);
                }
            };

            let result = self.evaluate_internal(&prereq_flag, context, recorder, scratch)?;
            let satisfied =
                prereq_flag.on && result.detail.variation_index == Some(prereq.variation);
            recorder.record(PrerequisiteEvent {
                flag: &prereq_flag,
                prereq_of: flag,
                context,
                result,
            });
            if !satisfied {
                return Ok(Some(self.prerequisite_failed_result(flag, index)));
            }
        }
        Ok(None)
    }

    fn prerequisite_failed_result(&self, flag: &FeatureFlag, index: usize) -> EvalResult {
        let prereq = &flag.prerequisites[index];
        let detail = match &prereq.failed_result {
            Some(detail) => Arc::clone(detail),
            None => Arc::new(variation_result(
                flag,
                flag.off_variation,
                Reason::PrerequisiteFailed {
                    prerequisite_key: prereq.key.clone(),
                },
            )),
        };
        EvalResult::from_detail(detail, false)
    }

    fn target_match_detail(&self, flag: &FeatureFlag, target: &Target) -> Arc<Detail> {
        match &target.match_result {
            Some(detail) => Arc::clone(detail),
            None => Arc::new(variation_result(
                flag,
                Some(target.variation),
                Reason::TargetMatch,
            )),
        }
    }

    fn match_targets(&self, flag: &FeatureFlag, context: &Context) -> Option<Arc<Detail>> {
        if flag.context_targets.is_empty() {
            let user = context.as_kind(&Kind::user())?;
            return flag
                .targets
                .iter()
                .find(|t| t.contains(user.key()))
                .map(|t| self.target_match_detail(flag, t));
        }
        for context_target in &flag.context_targets {
            let default_kind = Kind::user();
            let kind = context_target.context_kind.as_ref().unwrap_or(&default_kind);
            let Some(individual) = context.as_kind(kind) else {
                continue;
            };
            if kind.is_user() {
                // Default-kind entries delegate their value lists to the
                // legacy targets with the same variation.
                if flag
                    .targets
                    .iter()
                    .any(|t| t.variation == context_target.variation && t.contains(individual.key()))
                {
                    return Some(self.target_match_detail(flag, context_target));
                }
            } else if context_target.contains(individual.key()) {
                return Some(self.target_match_detail(flag, context_target));
            }
        }
        None
    }

    fn rule_matches(
        &self,
        rule: &FlagRule,
        context: &Context,
        scratch: &mut Scratch,
    ) -> Result<bool, EvalErr> {
        for clause in &rule.clauses {
            if !self.clause_matches(clause, context, scratch)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn clause_matches(
        &self,
        clause: &Clause,
        context: &Context,
        scratch: &mut Scratch,
    ) -> Result<bool, EvalErr> {
        if clause.op == Operator::SegmentMatch {
            let matched = self.clause_matches_segments(clause, context, scratch)?;
            return Ok(matched != clause.negate);
        }

        let reference = clause.attribute_ref();
        if !reference.is_valid() {
            warn!(
                attribute = %clause.attribute,
                "clause has an invalid attribute reference; flag is treated as malformed"
            );
            return Err(EvalErr::Malformed);
        }

        // `kind` matches against every individual context's kind name.
        if reference.depth() == 1 && reference.component(0) == Some("kind") {
            let matched = context.individual_contexts().any(|c| {
                operators::match_any(clause, &Value::String(c.kind().as_str().to_string()))
            });
            return Ok(matched != clause.negate);
        }

        let default_kind = Kind::user();
        let kind = clause.context_kind.as_ref().unwrap_or(&default_kind);
        let Some(individual) = context.as_kind(kind) else {
            // No context of the clause's kind: no match, and negation does
            // not apply to an absent value.
            return Ok(false);
        };
        let Some(value) = individual.get_value(&reference) else {
            return Ok(false);
        };

        let matched = match &value {
            Value::Array(items) => items.iter().any(|item| operators::match_any(clause, item)),
            scalar => operators::match_any(clause, scalar),
        };
        Ok(matched != clause.negate)
    }

    fn clause_matches_segments(
        &self,
        clause: &Clause,
        context: &Context,
        scratch: &mut Scratch,
    ) -> Result<bool, EvalErr> {
        for value in &clause.values {
            let Some(segment_key) = value.as_str() else {
                continue;
            };
            if scratch.segment_stack.iter().any(|k| k == segment_key) {
                warn!(
                    segment_key,
                    "segment rule referencing segment caused a circular reference; flag is treated as malformed"
                );
                return Err(EvalErr::Malformed);
            }
            let segment = match self.store.get_segment(segment_key) {
                Ok(Some(s)) => s,
                // Unknown segments are skipped, not errors.
                Ok(None) => continue,
                Err(e) => {
                    warn!(segment_key, error = %e, "data store error while fetching segment");
                    return Err(EvalErr::Exception);
                }
            };
            scratch.segment_stack.push(segment.key.clone());
            let matched = self.segment_matches_context(&segment, context, scratch);
            scratch.segment_stack.pop();
            if matched? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn segment_matches_context(
        &self,
        segment: &Segment,
        context: &Context,
        scratch: &mut Scratch,
    ) -> Result<bool, EvalErr> {
        if segment.unbounded {
            return self.big_segment_matches_context(segment, context, scratch);
        }

        for individual in context.individual_contexts() {
            if individual.kind().is_user() && segment.included_contains(individual.key()) {
                return Ok(true);
            }
            for target in &segment.included_contexts {
                let default_kind = Kind::user();
                let kind = target.context_kind.as_ref().unwrap_or(&default_kind);
                if kind == individual.kind() && target.contains(individual.key()) {
                    return Ok(true);
                }
            }
        }
        for individual in context.individual_contexts() {
            if individual.kind().is_user() && segment.excluded_contains(individual.key()) {
                return Ok(false);
            }
            for target in &segment.excluded_contexts {
                let default_kind = Kind::user();
                let kind = target.context_kind.as_ref().unwrap_or(&default_kind);
                if kind == individual.kind() && target.contains(individual.key()) {
                    return Ok(false);
                }
            }
        }

        for rule in &segment.rules {
            let mut clauses_match = true;
            for clause in &rule.clauses {
                if !self.clause_matches(clause, context, scratch)? {
                    clauses_match = false;
                    break;
                }
            }
            if !clauses_match {
                continue;
            }
            match bucketing::segment_rule_weight_matches(rule, context, &segment.key, &segment.salt)
            {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(_) => return Err(EvalErr::Malformed),
            }
        }
        Ok(false)
    }

    fn big_segment_matches_context(
        &self,
        segment: &Segment,
        context: &Context,
        scratch: &mut Scratch,
    ) -> Result<bool, EvalErr> {
        let Some(segment_ref) = segment.unbounded_segment_ref() else {
            // Unqueryable without a generation; the result is tagged so the
            // caller can see membership data was unavailable.
            warn!(
                segment_key = %segment.key,
                "big segment has no generation; cannot query membership"
            );
            scratch.note_big_segments_status(BigSegmentsStatus::NotConfigured);
            return Ok(false);
        };
        let Some(query) = &self.big_segments else {
            scratch.note_big_segments_status(BigSegmentsStatus::NotConfigured);
            return Ok(false);
        };
        let default_kind = Kind::user();
        let kind = segment.unbounded_context_kind.as_ref().unwrap_or(&default_kind);
        let Some(individual) = context.as_kind(kind) else {
            return Ok(false);
        };

        let result = scratch
            .membership
            .entry(individual.key().to_string())
            .or_insert_with(|| query.query_membership(individual.key()))
            .clone();
        scratch.note_big_segments_status(result.status);

        match result.membership.and_then(|m| m.get(&segment_ref).copied()) {
            Some(included) => Ok(included),
            // No explicit membership entry: fall back to the segment rules.
            None => {
                for rule in &segment.rules {
                    let mut clauses_match = true;
                    for clause in &rule.clauses {
                        if !self.clause_matches(clause, context, scratch)? {
                            clauses_match = false;
                            break;
                        }
                    }
                    if clauses_match {
                        match bucketing::segment_rule_weight_matches(
                            rule,
                            context,
                            &segment.key,
                            &segment.salt,
                        ) {
                            Ok(true) => return Ok(true),
                            Ok(false) => {}
                            Err(_) => return Err(EvalErr::Malformed),
                        }
                    }
                }
                Ok(false)
            }
        }
    }

    fn rule_result(
        &self,
        flag: &FeatureFlag,
        rule_index: usize,
        rule: &FlagRule,
        context: &Context,
    ) -> Result<EvalResult, EvalErr> {
        let resolved = bucketing::resolve_variation_or_rollout(
            &rule.variation_or_rollout,
            context,
            &flag.key,
            &flag.salt,
        )
        .map_err(|_| EvalErr::Malformed)?;

        let detail = if rule.preprocessed.results.is_empty() {
            Arc::new(variation_result(
                flag,
                Some(resolved.variation_index),
                Reason::RuleMatch {
                    rule_index,
                    rule_id: rule.id.clone(),
                    in_experiment: resolved.in_experiment,
                },
            ))
        } else {
            match rule
                .preprocessed
                .results
                .get(resolved.variation_index)
                .and_then(Option::as_ref)
            {
                Some(pair) => pair.get(resolved.in_experiment),
                None => return Err(EvalErr::Malformed),
            }
        };
        if matches!(detail.reason, Reason::Error { .. }) {
            return Err(EvalErr::Malformed);
        }
        Ok(EvalResult::from_detail(
            detail,
            rule.track_events || resolved.in_experiment,
        ))
    }

    fn fallthrough_result(
        &self,
        flag: &FeatureFlag,
        context: &Context,
    ) -> Result<EvalResult, EvalErr> {
        let resolved = bucketing::resolve_variation_or_rollout(
            &flag.fallthrough,
            context,
            &flag.key,
            &flag.salt,
        )
        .map_err(|_| EvalErr::Malformed)?;

        let detail = if flag.preprocessed.fallthrough_results.is_empty() {
            Arc::new(variation_result(
                flag,
                Some(resolved.variation_index),
                Reason::Fallthrough {
                    in_experiment: resolved.in_experiment,
                },
            ))
        } else {
            match flag
                .preprocessed
                .fallthrough_results
                .get(resolved.variation_index)
            {
                Some(pair) => pair.get(resolved.in_experiment),
                None => return Err(EvalErr::Malformed),
            }
        };
        if matches!(detail.reason, Reason::Error { .. }) {
            return Err(EvalErr::Malformed);
        }
        Ok(EvalResult::from_detail(
            detail,
            flag.track_events_fallthrough || resolved.in_experiment,
        ))
    }
}
