//! Evaluation results and reasons

use serde::Serialize;
use serde_json::Value;

/// Why an evaluation produced the value it did.
///
/// Serializes to the analytics wire form, e.g.
/// `{"kind":"RULE_MATCH","ruleIndex":1,"ruleId":"a3f"}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    /// The flag was off; the off variation was served.
    Off,
    /// No target or rule matched; the fallthrough variation was served.
    #[serde(rename_all = "camelCase")]
    Fallthrough {
        /// True when the fallthrough rollout is an experiment and this
        /// context is a tracked participant.
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        in_experiment: bool,
    },
    /// The context key was individually targeted.
    TargetMatch,
    /// A rule matched.
    #[serde(rename_all = "camelCase")]
    RuleMatch {
        /// Index of the rule within the flag.
        rule_index: usize,
        /// The rule's unique id, stable across rule reordering.
        rule_id: String,
        /// True when the rule rollout is an experiment and this context is a
        /// tracked participant.
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        in_experiment: bool,
    },
    /// A prerequisite flag was off or served the wrong variation.
    #[serde(rename_all = "camelCase")]
    PrerequisiteFailed {
        /// Key of the failed prerequisite flag.
        prerequisite_key: String,
    },
    /// The evaluation could not be completed; the default value was served.
    #[serde(rename_all = "camelCase")]
    Error {
        /// What went wrong.
        error_kind: ErrorKind,
    },
}

impl Reason {
    /// True for experiment participation (forces reason tracking upstream).
    pub fn is_in_experiment(&self) -> bool {
        matches!(
            self,
            Reason::Fallthrough { in_experiment: true }
                | Reason::RuleMatch {
                    in_experiment: true,
                    ..
                }
        )
    }
}

/// The failure classes an evaluation can report.
///
/// These are kinds, not error types: every one of them still yields a result
/// carrying the caller's default value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The client has not yet ingested any flag data.
    ClientNotReady,
    /// No flag with the requested key exists.
    FlagNotFound,
    /// The flag data is self-contradictory (e.g. a prerequisite cycle or a
    /// rollout with no variations).
    MalformedFlag,
    /// The evaluation context was missing or invalid.
    UserNotSpecified,
    /// The flag value does not have the requested type.
    WrongType,
    /// An unexpected error, such as a data store read failure.
    Exception,
}

/// Health of big-segment data as observed during a single evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BigSegmentsStatus {
    /// Membership data was available and current.
    Healthy,
    /// Membership data was available but past its staleness threshold.
    Stale,
    /// A segment referenced external membership but no big-segment store is
    /// configured.
    NotConfigured,
    /// The big-segment store returned an error.
    StoreError,
}

impl BigSegmentsStatus {
    // Ordering for merging statuses across several segment lookups within one
    // evaluation: keep the least healthy observation.
    fn rank(self) -> u8 {
        match self {
            BigSegmentsStatus::Healthy => 0,
            BigSegmentsStatus::Stale => 1,
            BigSegmentsStatus::NotConfigured => 2,
            BigSegmentsStatus::StoreError => 3,
        }
    }

    /// Combines two observations, keeping the less healthy one.
    pub fn merge(self, other: BigSegmentsStatus) -> BigSegmentsStatus {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

/// The outcome of a single flag evaluation.
///
/// `value` is `None` only for error results, in which case the caller
/// substitutes its default.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Detail {
    /// The evaluated flag value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Index of the served variation, if a variation was selected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation_index: Option<usize>,
    /// Why this value was served.
    pub reason: Reason,
}

impl Detail {
    /// An error result with no value.
    pub fn error(kind: ErrorKind) -> Detail {
        Detail {
            value: None,
            variation_index: None,
            reason: Reason::Error { error_kind: kind },
        }
    }

    /// The value, or `default` for error results.
    pub fn value_or<'a>(&'a self, default: &'a Value) -> &'a Value {
        self.value.as_ref().unwrap_or(default)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reason_serialization() {
        assert_eq!(serde_json::to_value(Reason::Off).unwrap(), json!({"kind": "OFF"}));
        assert_eq!(
            serde_json::to_value(Reason::Fallthrough {
                in_experiment: false
            })
            .unwrap(),
            json!({"kind": "FALLTHROUGH"})
        );
        assert_eq!(
            serde_json::to_value(Reason::Fallthrough {
                in_experiment: true
            })
            .unwrap(),
            json!({"kind": "FALLTHROUGH", "inExperiment": true})
        );
        assert_eq!(
            serde_json::to_value(Reason::RuleMatch {
                rule_index: 2,
                rule_id: "r2".to_string(),
                in_experiment: false,
            })
            .unwrap(),
            json!({"kind": "RULE_MATCH", "ruleIndex": 2, "ruleId": "r2"})
        );
        assert_eq!(
            serde_json::to_value(Reason::PrerequisiteFailed {
                prerequisite_key: "other".to_string()
            })
            .unwrap(),
            json!({"kind": "PREREQUISITE_FAILED", "prerequisiteKey": "other"})
        );
        assert_eq!(
            serde_json::to_value(Reason::Error {
                error_kind: ErrorKind::FlagNotFound
            })
            .unwrap(),
            json!({"kind": "ERROR", "errorKind": "FLAG_NOT_FOUND"})
        );
    }

    #[test]
    fn test_big_segments_status_merge_keeps_least_healthy() {
        use BigSegmentsStatus::*;
        assert_eq!(Healthy.merge(Stale), Stale);
        assert_eq!(Stale.merge(Healthy), Stale);
        assert_eq!(Stale.merge(StoreError), StoreError);
        assert_eq!(Healthy.merge(Healthy), Healthy);
    }

    #[test]
    fn test_detail_value_or() {
        let default = json!("fallback");
        let detail = Detail::error(ErrorKind::Exception);
        assert_eq!(detail.value_or(&default), &default);

        let detail = Detail {
            value: Some(json!("served")),
            variation_index: Some(0),
            reason: Reason::Off,
        };
        assert_eq!(detail.value_or(&default), &json!("served"));
    }
}
