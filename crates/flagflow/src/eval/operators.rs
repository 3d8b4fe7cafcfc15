//! Clause operator application
//!
//! Operators compare one attribute value from the context against a clause's
//! comparand list. The ingestion path preparses regex, date, and semver
//! comparands (see the clause preprocessing); when a clause arrives without
//! that step (hand-built fixtures), comparands are parsed on the fly with the
//! same rules.

use std::sync::LazyLock;

use regex::Regex;
use semver::Version;
use serde_json::Value;

use crate::model::clause::{Clause, Operator, PreparsedValue, ScalarKey};

#[allow(clippy::unwrap_used)]
static LOOSE_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)(\.(\d+))?(\.(\d+))?(.*)$").unwrap());

pub(crate) fn parse_regex(pattern: &str) -> Option<Regex> {
    Regex::new(pattern).ok()
}

/// Parses a clause or context date value to milliseconds since the epoch:
/// numbers are taken as millis, strings as RFC3339.
pub(crate) fn parse_date_millis(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|d| d.timestamp_millis() as f64),
        _ => None,
    }
}

/// Parses a semantic version, tolerating omitted minor/patch components
/// ("2" and "2.1" parse as "2.0.0" and "2.1.0").
pub(crate) fn parse_semver(s: &str) -> Option<Version> {
    let s = s.trim();
    if let Ok(v) = Version::parse(s) {
        return Some(v);
    }
    let caps = LOOSE_VERSION.captures(s)?;
    let major = caps.get(1)?.as_str();
    let minor = caps.get(3).map_or("0", |m| m.as_str());
    let patch = caps.get(5).map_or("0", |m| m.as_str());
    let rest = caps.get(6).map_or("", |m| m.as_str());
    Version::parse(&format!("{major}.{minor}.{patch}{rest}")).ok()
}

// Numeric equality across integer and float JSON representations.
fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        _ => a == b,
    }
}

/// Whether a single (scalar) context value satisfies the clause against any
/// of its comparands. Negation and `segmentMatch` are handled by the caller.
pub(crate) fn match_any(clause: &Clause, context_value: &Value) -> bool {
    match clause.op {
        Operator::SegmentMatch | Operator::Unknown => false,
        Operator::In => match (&clause.preprocessed.values_set, ScalarKey::from_value(context_value)) {
            (Some(set), Some(key)) => set.contains(&key),
            _ => clause.values.iter().any(|v| value_eq(v, context_value)),
        },
        _ => clause
            .values
            .iter()
            .enumerate()
            .any(|(i, comparand)| apply(clause, i, comparand, context_value)),
    }
}

fn apply(clause: &Clause, index: usize, comparand: &Value, context_value: &Value) -> bool {
    let preparsed = clause
        .preprocessed
        .parsed
        .as_ref()
        .and_then(|p| p.get(index));
    match clause.op {
        Operator::StartsWith => str_op(context_value, comparand, |c, v| c.starts_with(v)),
        Operator::EndsWith => str_op(context_value, comparand, |c, v| c.ends_with(v)),
        Operator::Contains => str_op(context_value, comparand, |c, v| c.contains(v)),
        Operator::Matches => {
            let Some(context_str) = context_value.as_str() else {
                return false;
            };
            match preparsed {
                Some(PreparsedValue::Regex(re)) => {
                    re.as_ref().is_some_and(|re| re.is_match(context_str))
                }
                _ => comparand
                    .as_str()
                    .and_then(parse_regex)
                    .is_some_and(|re| re.is_match(context_str)),
            }
        }
        Operator::LessThan => num_op(context_value, comparand, |c, v| c < v),
        Operator::LessThanOrEqual => num_op(context_value, comparand, |c, v| c <= v),
        Operator::GreaterThan => num_op(context_value, comparand, |c, v| c > v),
        Operator::GreaterThanOrEqual => num_op(context_value, comparand, |c, v| c >= v),
        Operator::Before | Operator::After => {
            let Some(context_ms) = parse_date_millis(context_value) else {
                return false;
            };
            let comparand_ms = match preparsed {
                Some(PreparsedValue::Date(d)) => *d,
                _ => parse_date_millis(comparand),
            };
            match comparand_ms {
                Some(v) if clause.op == Operator::Before => context_ms < v,
                Some(v) => context_ms > v,
                None => false,
            }
        }
        Operator::SemVerEqual | Operator::SemVerLessThan | Operator::SemVerGreaterThan => {
            let Some(context_version) = context_value.as_str().and_then(parse_semver) else {
                return false;
            };
            let comparand_version = match preparsed {
                Some(PreparsedValue::SemVer(v)) => v.clone(),
                _ => comparand.as_str().and_then(parse_semver),
            };
            match comparand_version {
                Some(v) => match clause.op {
                    Operator::SemVerEqual => context_version == v,
                    Operator::SemVerLessThan => context_version < v,
                    _ => context_version > v,
                },
                None => false,
            }
        }
        // In / SegmentMatch / Unknown are routed in match_any.
        _ => false,
    }
}

fn str_op(context_value: &Value, comparand: &Value, f: impl Fn(&str, &str) -> bool) -> bool {
    match (context_value.as_str(), comparand.as_str()) {
        (Some(c), Some(v)) => f(c, v),
        _ => false,
    }
}

fn num_op(context_value: &Value, comparand: &Value, f: impl Fn(f64, f64) -> bool) -> bool {
    match (context_value.as_f64(), comparand.as_f64()) {
        (Some(c), Some(v)) => f(c, v),
        _ => false,
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn clause(op: &str, values: Value) -> Clause {
        let mut c: Clause =
            serde_json::from_value(json!({"attribute": "x", "op": op, "values": values}))
                .unwrap();
        c.preprocess();
        c
    }

    #[test]
    fn test_in_operator_deep_and_numeric_equality() {
        let c = clause("in", json!(["a", 99]));
        assert!(match_any(&c, &json!("a")));
        assert!(match_any(&c, &json!(99)));
        assert!(match_any(&c, &json!(99.0)));
        assert!(!match_any(&c, &json!("b")));
    }

    #[test]
    fn test_in_operator_same_truth_values_at_any_cardinality() {
        // One value stays on the linear path, the rest use the lookup set.
        for n in [1usize, 2, 10, 10_000] {
            let values: Vec<Value> = (0..n).map(|i| json!(format!("v{i}"))).collect();
            let c = clause("in", Value::Array(values));
            assert!(match_any(&c, &json!("v0")), "n={n}");
            assert!(match_any(&c, &json!(format!("v{}", n - 1))), "n={n}");
            assert!(!match_any(&c, &json!("missing")), "n={n}");
        }
    }

    #[test]
    fn test_string_operators() {
        assert!(match_any(&clause("startsWith", json!(["ab"])), &json!("abc")));
        assert!(!match_any(&clause("startsWith", json!(["bc"])), &json!("abc")));
        assert!(match_any(&clause("endsWith", json!(["bc"])), &json!("abc")));
        assert!(match_any(&clause("contains", json!(["b"])), &json!("abc")));
        // Non-string context values never match string operators.
        assert!(!match_any(&clause("contains", json!(["1"])), &json!(12)));
    }

    #[test]
    fn test_regex_match_operator() {
        let c = clause("matches", json!(["^h.*o$"]));
        assert!(match_any(&c, &json!("hello")));
        assert!(!match_any(&c, &json!("world")));
        // Unparsable pattern matches nothing rather than erroring.
        assert!(!match_any(&clause("matches", json!(["("])), &json!("(")));
    }

    #[test]
    fn test_numeric_comparisons() {
        assert!(match_any(&clause("lessThan", json!([10])), &json!(9.5)));
        assert!(!match_any(&clause("lessThan", json!([10])), &json!(10)));
        assert!(match_any(&clause("lessThanOrEqual", json!([10])), &json!(10)));
        assert!(match_any(&clause("greaterThan", json!([10])), &json!(11)));
        assert!(match_any(&clause("greaterThanOrEqual", json!([10])), &json!(10)));
    }

    #[test]
    fn test_date_comparisons_accept_millis_and_rfc3339() {
        let c = clause("before", json!(["2024-06-01T00:00:00Z"]));
        assert!(match_any(&c, &json!("2024-05-31T00:00:00Z")));
        assert!(!match_any(&c, &json!("2024-06-02T00:00:00Z")));

        let cutoff_ms = chrono::DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
            .unwrap()
            .timestamp_millis();
        assert!(match_any(&c, &json!(cutoff_ms - 1)));
        let c = clause("after", json!([cutoff_ms]));
        assert!(match_any(&c, &json!("2024-06-02T00:00:00+02:00")));
        // Garbage dates never match.
        assert!(!match_any(&c, &json!("not a date")));
    }

    #[test]
    fn test_semver_comparisons() {
        assert!(match_any(&clause("semVerEqual", json!(["2.0.0"])), &json!("2")));
        assert!(match_any(&clause("semVerLessThan", json!(["2.1"])), &json!("2.0.9")));
        assert!(match_any(&clause("semVerGreaterThan", json!(["2.0"])), &json!("2.0.1")));
        // Pre-release sorts before the release.
        assert!(match_any(
            &clause("semVerLessThan", json!(["2.0.0"])),
            &json!("2.0.0-rc.1")
        ));
        assert!(!match_any(&clause("semVerEqual", json!(["2.0.0"])), &json!("bogus")));
    }

    #[test]
    fn test_loose_semver_parsing() {
        assert_eq!(parse_semver("2").unwrap(), Version::parse("2.0.0").unwrap());
        assert_eq!(parse_semver("2.3").unwrap(), Version::parse("2.3.0").unwrap());
        assert_eq!(
            parse_semver("2-beta.1").unwrap(),
            Version::parse("2.0.0-beta.1").unwrap()
        );
        assert!(parse_semver("v2.0.0").is_none());
        assert!(parse_semver("").is_none());
    }

    #[test]
    fn test_unknown_operator_matches_nothing() {
        let c = clause("someFutureOp", json!(["x"]));
        assert!(!match_any(&c, &json!("x")));
    }
}
