//! Deterministic bucketing for rollouts and experiments
//!
//! A context's bucket is a float in `[0, 1)` derived from SHA-1 over
//! `prefix.attributeValue`, where the prefix is either `flagKey.salt` or an
//! explicit rollout seed. The first 15 lowercase hex digits of the digest are
//! read as a big-endian integer and divided by `0xFFFFFFFFFFFFFFF`. The
//! algorithm is part of the wire contract: assignments must be bit-identical
//! across SDK implementations, so do not touch this without cross-checking
//! the published reference vectors.

use sha1::{Digest, Sha1};
use serde_json::Value;

use crate::context::{AttributeRef, Context, Kind};
use crate::model::flag::VariationOrRollout;
use crate::model::segment::SegmentRule;

const BUCKET_SCALE: f64 = 0xFFF_FFFF_FFFF_FFFF_u64 as f64;

/// Bucketing failures that make the flag malformed (as opposed to merely
/// not matching).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BucketingError {
    Malformed,
}

/// The outcome of hashing one context against one rollout.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Bucket {
    /// `None` when the bucketing attribute had no usable value (missing, or
    /// a non-string non-integer type); such contexts never pass a weight
    /// gate, and in a rollout they land on the first slice.
    pub value: Option<f64>,
    /// False when the context had no individual context of the bucketing
    /// kind; experiments do not track such contexts.
    pub matched_context: bool,
}

/// The variation selected by a [`VariationOrRollout`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RolloutResult {
    pub variation_index: usize,
    pub in_experiment: bool,
}

fn bucket_of_hash_input(input: &str) -> f64 {
    let digest = Sha1::digest(input.as_bytes());
    let hexed = hex::encode(digest);
    // 40 hex digits out of SHA-1; the contract reads the first 15.
    let n = u64::from_str_radix(&hexed[..15], 16).unwrap_or(0);
    n as f64 / BUCKET_SCALE
}

// The bucketing attribute as a string: strings verbatim, integers in decimal
// form, anything else unusable.
fn bucketable_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => n.as_i64().map(|i| i.to_string()),
        _ => None,
    }
}

pub(crate) fn compute_bucket(
    context: &Context,
    kind: Option<&Kind>,
    bucket_by: Option<&AttributeRef>,
    key: &str,
    salt: &str,
    seed: Option<i64>,
) -> Result<Bucket, BucketingError> {
    if let Some(r) = bucket_by {
        if !r.is_valid() {
            return Err(BucketingError::Malformed);
        }
    }
    let default_kind = Kind::user();
    let kind = kind.unwrap_or(&default_kind);
    let Some(individual) = context.as_kind(kind) else {
        return Ok(Bucket {
            value: Some(0.0),
            matched_context: false,
        });
    };

    let key_ref = AttributeRef::literal("key");
    let reference = bucket_by.unwrap_or(&key_ref);
    let attr_value = individual.get_value(reference);
    let Some(id) = attr_value.as_ref().and_then(bucketable_value) else {
        return Ok(Bucket {
            value: None,
            matched_context: true,
        });
    };

    let input = match seed {
        Some(seed) => format!("{seed}.{id}"),
        None => format!("{key}.{salt}.{id}"),
    };
    Ok(Bucket {
        value: Some(bucket_of_hash_input(&input)),
        matched_context: true,
    })
}

/// Resolves a fixed variation or rollout to a variation index.
///
/// Returns `Err` for malformed data: neither side present, an empty rollout,
/// or an unparseable `bucketBy` reference.
pub(crate) fn resolve_variation_or_rollout(
    vr: &VariationOrRollout,
    context: &Context,
    flag_key: &str,
    salt: &str,
) -> Result<RolloutResult, BucketingError> {
    if let Some(index) = vr.variation {
        return Ok(RolloutResult {
            variation_index: index,
            in_experiment: false,
        });
    }
    let Some(rollout) = &vr.rollout else {
        return Err(BucketingError::Malformed);
    };
    if rollout.variations.is_empty() {
        return Err(BucketingError::Malformed);
    }

    let experiment = rollout.is_experiment();
    // Experiments always bucket by key so assignments stay comparable across
    // the experiment's flags.
    let bucket_by = if experiment {
        None
    } else {
        rollout.bucket_by.as_ref()
    };
    let bucket = compute_bucket(
        context,
        rollout.context_kind.as_ref(),
        bucket_by,
        flag_key,
        salt,
        rollout.seed,
    )?;
    let bucket_value = bucket.value.unwrap_or(-1.0);

    let mut cumulative = 0.0_f64;
    let mut selected = None;
    for wv in &rollout.variations {
        cumulative += f64::from(wv.weight) / 100_000.0;
        if bucket_value < cumulative {
            selected = Some(wv);
            break;
        }
    }
    // Rounding or under-committed weights can leave a bucket past the last
    // threshold; it belongs to the last slice, never an error.
    let selected = match selected {
        Some(wv) => wv,
        None => &rollout.variations[rollout.variations.len() - 1],
    };

    Ok(RolloutResult {
        variation_index: selected.variation,
        in_experiment: experiment && !selected.untracked && bucket.matched_context,
    })
}

/// Applies a segment rule's weight gate: whether the context's bucket falls
/// under `weight` parts per 100000. Rules without a weight always pass.
pub(crate) fn segment_rule_weight_matches(
    rule: &SegmentRule,
    context: &Context,
    segment_key: &str,
    salt: &str,
) -> Result<bool, BucketingError> {
    let Some(weight) = rule.weight else {
        return Ok(true);
    };
    let bucket = compute_bucket(
        context,
        rule.rollout_context_kind.as_ref(),
        rule.bucket_by.as_ref(),
        segment_key,
        salt,
        None,
    )?;
    Ok(match bucket.value {
        Some(v) if bucket.matched_context => v < f64::from(weight) / 100_000.0,
        _ => false,
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextBuilder;
    use crate::model::flag::{Rollout, RolloutKind, WeightedVariation};
    use serde_json::json;

    fn wv(variation: usize, weight: u32) -> WeightedVariation {
        WeightedVariation {
            variation,
            weight,
            untracked: false,
        }
    }

    fn rollout_vr(variations: Vec<WeightedVariation>) -> VariationOrRollout {
        VariationOrRollout {
            variation: None,
            rollout: Some(Rollout {
                kind: RolloutKind::Rollout,
                context_kind: None,
                bucket_by: None,
                variations,
                seed: None,
            }),
        }
    }

    #[test]
    fn test_bucket_is_stable_for_same_inputs() {
        let context = Context::with_key("user-key-123");
        let a = compute_bucket(&context, None, None, "F5", "s", None).unwrap();
        let b = compute_bucket(&context, None, None, "F5", "s", None).unwrap();
        assert_eq!(a, b);
        let v = a.value.unwrap();
        assert!((0.0..1.0).contains(&v));
    }

    #[test]
    fn test_bucket_differs_by_salt_and_key() {
        let context = Context::with_key("user-key-123");
        let a = compute_bucket(&context, None, None, "F5", "s", None).unwrap();
        let b = compute_bucket(&context, None, None, "F5", "t", None).unwrap();
        let c = compute_bucket(&context, None, None, "F6", "s", None).unwrap();
        assert_ne!(a.value, b.value);
        assert_ne!(a.value, c.value);
    }

    #[test]
    fn test_seed_replaces_key_and_salt_prefix() {
        let context = Context::with_key("user-key-123");
        let seeded_a = compute_bucket(&context, None, None, "F5", "s", Some(42)).unwrap();
        let seeded_b = compute_bucket(&context, None, None, "other", "x", Some(42)).unwrap();
        assert_eq!(seeded_a.value, seeded_b.value);
    }

    #[test]
    fn test_integer_attribute_buckets_as_decimal_string() {
        let by_int = ContextBuilder::new("k").set("team", json!(42)).build();
        let by_str = ContextBuilder::new("k").set("team", json!("42")).build();
        let r = AttributeRef::new("team");
        let a = compute_bucket(&by_int, None, Some(&r), "f", "s", None).unwrap();
        let b = compute_bucket(&by_str, None, Some(&r), "f", "s", None).unwrap();
        assert_eq!(a.value, b.value);
    }

    #[test]
    fn test_non_string_attribute_yields_no_bucket() {
        let context = ContextBuilder::new("k").set("team", json!(1.5)).build();
        let r = AttributeRef::new("team");
        let bucket = compute_bucket(&context, None, Some(&r), "f", "s", None).unwrap();
        assert_eq!(bucket.value, None);
        assert!(bucket.matched_context);
    }

    #[test]
    fn test_missing_context_kind_buckets_to_zero_untracked() {
        let context = Context::with_key("k");
        let org = Kind::from("org");
        let bucket = compute_bucket(&context, Some(&org), None, "f", "s", None).unwrap();
        assert_eq!(bucket.value, Some(0.0));
        assert!(!bucket.matched_context);
    }

    #[test]
    fn test_fixed_variation_resolves_directly() {
        let vr = VariationOrRollout {
            variation: Some(2),
            rollout: None,
        };
        let context = Context::with_key("k");
        let r = resolve_variation_or_rollout(&vr, &context, "f", "s").unwrap();
        assert_eq!(r.variation_index, 2);
        assert!(!r.in_experiment);
    }

    #[test]
    fn test_empty_variation_or_rollout_is_malformed() {
        let context = Context::with_key("k");
        let vr = VariationOrRollout::default();
        assert!(resolve_variation_or_rollout(&vr, &context, "f", "s").is_err());
        assert!(resolve_variation_or_rollout(&rollout_vr(vec![]), &context, "f", "s").is_err());
    }

    #[test]
    fn test_rollout_past_last_threshold_uses_last_variation() {
        // Weights sum to far less than 100000, so most buckets overflow.
        let vr = rollout_vr(vec![wv(0, 1), wv(1, 1)]);
        for i in 0..50 {
            let context = Context::with_key(format!("key-{i}"));
            let r = resolve_variation_or_rollout(&vr, &context, "f", "s").unwrap();
            assert!(r.variation_index == 0 || r.variation_index == 1);
        }
        // A full-weight single slice always wins.
        let vr = rollout_vr(vec![wv(3, 100_000)]);
        let context = Context::with_key("anything");
        let r = resolve_variation_or_rollout(&vr, &context, "f", "s").unwrap();
        assert_eq!(r.variation_index, 3);
    }

    #[test]
    fn test_even_split_is_roughly_even() {
        let vr = rollout_vr(vec![wv(0, 50_000), wv(1, 50_000)]);
        let mut counts = [0usize; 2];
        for i in 0..1000 {
            let context = Context::with_key(format!("stable-key-{i}"));
            let r = resolve_variation_or_rollout(&vr, &context, "flag", "salt").unwrap();
            counts[r.variation_index] += 1;
        }
        // Binomial(1000, 0.5): five sigma is about 80.
        assert!((420..=580).contains(&counts[0]), "counts={counts:?}");
    }

    #[test]
    fn test_experiment_marks_in_experiment_unless_untracked() {
        let tracked = VariationOrRollout {
            variation: None,
            rollout: Some(Rollout {
                kind: RolloutKind::Experiment,
                context_kind: None,
                bucket_by: None,
                variations: vec![wv(0, 100_000)],
                seed: Some(7),
            }),
        };
        let context = Context::with_key("k");
        let r = resolve_variation_or_rollout(&tracked, &context, "f", "s").unwrap();
        assert!(r.in_experiment);

        let mut untracked = tracked.clone();
        untracked.rollout.as_mut().unwrap().variations[0].untracked = true;
        let r = resolve_variation_or_rollout(&untracked, &context, "f", "s").unwrap();
        assert!(!r.in_experiment);

        // Context lookup failure also suppresses experiment tracking.
        let mut org_kind = tracked.clone();
        org_kind.rollout.as_mut().unwrap().context_kind = Some(Kind::from("org"));
        let r = resolve_variation_or_rollout(&org_kind, &context, "f", "s").unwrap();
        assert!(!r.in_experiment);
    }

    #[test]
    fn test_invalid_bucket_by_is_malformed() {
        let mut vr = rollout_vr(vec![wv(0, 100_000)]);
        vr.rollout.as_mut().unwrap().bucket_by = Some(AttributeRef::new("//"));
        let context = Context::with_key("k");
        assert!(resolve_variation_or_rollout(&vr, &context, "f", "s").is_err());
    }

    #[test]
    fn test_segment_rule_weight_gate() {
        let all: SegmentRule = serde_json::from_value(json!({"clauses": []})).unwrap();
        let context = Context::with_key("k");
        assert!(segment_rule_weight_matches(&all, &context, "s1", "salt").unwrap());

        let none: SegmentRule =
            serde_json::from_value(json!({"clauses": [], "weight": 0})).unwrap();
        assert!(!segment_rule_weight_matches(&none, &context, "s1", "salt").unwrap());

        let full: SegmentRule =
            serde_json::from_value(json!({"clauses": [], "weight": 100000})).unwrap();
        assert!(segment_rule_weight_matches(&full, &context, "s1", "salt").unwrap());
    }
}
