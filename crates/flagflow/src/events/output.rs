//! Wire formatting of output events
//!
//! Events go out as a JSON array of envelopes: `feature`, `debug`, `index`,
//! `identify`, `custom`, and `summary`. Contexts are serialized with
//! private-attribute redaction applied; redacted references are listed in
//! the output's `_meta.redactedAttributes` so downstream tooling knows what
//! was withheld.

use serde_json::{json, Map, Value};

use crate::context::{AttributeRef, Context};
use crate::events::summarizer::EventSummarizer;
use crate::events::{CustomEvent, FeatureRequestEvent, IdentifyEvent};

/// Formats output events according to the privacy configuration.
pub struct EventOutputFormatter {
    all_attributes_private: bool,
    private_attributes: Vec<AttributeRef>,
}

impl EventOutputFormatter {
    pub fn new(all_attributes_private: bool, private_attributes: Vec<AttributeRef>) -> Self {
        EventOutputFormatter {
            all_attributes_private,
            private_attributes,
        }
    }

    /// Map of kind name to key for every individual context; identifies a
    /// context in events that do not carry its attributes.
    fn context_keys(context: &Context) -> Value {
        let mut keys = Map::new();
        for individual in context.individual_contexts() {
            keys.insert(
                individual.kind().as_str().to_string(),
                Value::String(individual.key().to_string()),
            );
        }
        Value::Object(keys)
    }

    /// Serializes a context with redaction.
    pub fn context_json(&self, context: &Context) -> Value {
        if context.is_multi() {
            let mut out = Map::new();
            out.insert("kind".to_string(), json!("multi"));
            for individual in context.individual_contexts() {
                out.insert(
                    individual.kind().as_str().to_string(),
                    self.single_context_json(individual, false),
                );
            }
            Value::Object(out)
        } else {
            self.single_context_json(context, true)
        }
    }

    fn single_context_json(&self, context: &Context, include_kind: bool) -> Value {
        let mut out = Map::new();
        if include_kind {
            out.insert("kind".to_string(), json!(context.kind().as_str()));
        }
        out.insert("key".to_string(), json!(context.key()));
        if context.anonymous() {
            out.insert("anonymous".to_string(), json!(true));
        }

        let mut redacted: Vec<String> = Vec::new();
        let private: Vec<&AttributeRef> = self
            .private_attributes
            .iter()
            .chain(context.private_attributes().iter())
            .collect();

        if let Some(name) = context.name() {
            let name_ref = AttributeRef::literal("name");
            if self.all_attributes_private || private.iter().any(|r| **r == name_ref) {
                redacted.push("name".to_string());
            } else {
                out.insert("name".to_string(), json!(name));
            }
        }

        for (attr_name, value) in context.attributes() {
            if self.all_attributes_private {
                redacted.push(AttributeRef::literal(attr_name).as_str().to_string());
                continue;
            }
            let top_level = AttributeRef::literal(attr_name);
            if private.iter().any(|r| **r == top_level) {
                redacted.push(top_level.as_str().to_string());
                continue;
            }
            // Nested redactions apply inside object-valued attributes.
            let nested: Vec<&AttributeRef> = private
                .iter()
                .copied()
                .filter(|r| r.is_valid() && r.depth() > 1 && r.component(0) == Some(attr_name))
                .collect();
            if nested.is_empty() {
                out.insert(attr_name.to_string(), value.clone());
            } else {
                let mut copy = value.clone();
                for r in nested {
                    if redact_path(&mut copy, r, 1) {
                        redacted.push(r.as_str().to_string());
                    }
                }
                out.insert(attr_name.to_string(), copy);
            }
        }

        if !redacted.is_empty() {
            out.insert(
                "_meta".to_string(),
                json!({ "redactedAttributes": redacted }),
            );
        }
        Value::Object(out)
    }

    pub fn feature_event_json(&self, event: &FeatureRequestEvent, debug: bool) -> Value {
        let mut out = Map::new();
        out.insert(
            "kind".to_string(),
            json!(if debug { "debug" } else { "feature" }),
        );
        out.insert("creationDate".to_string(), json!(event.base.creation_date));
        out.insert("key".to_string(), json!(event.key));
        if let Some(version) = event.version {
            out.insert("version".to_string(), json!(version));
        }
        if let Some(variation) = event.variation {
            out.insert("variation".to_string(), json!(variation));
        }
        out.insert("value".to_string(), event.value.clone());
        out.insert("default".to_string(), event.default.clone());
        if let Some(reason) = &event.reason {
            out.insert("reason".to_string(), json!(reason));
        }
        if let Some(prereq_of) = &event.prereq_of {
            out.insert("prereqOf".to_string(), json!(prereq_of));
        }
        if debug {
            // Debug copies carry the full context for troubleshooting.
            out.insert("context".to_string(), self.context_json(&event.base.context));
        } else {
            out.insert(
                "contextKeys".to_string(),
                Self::context_keys(&event.base.context),
            );
        }
        Value::Object(out)
    }

    pub fn index_event_json(&self, creation_date: u64, context: &Context) -> Value {
        json!({
            "kind": "index",
            "creationDate": creation_date,
            "context": self.context_json(context),
        })
    }

    pub fn identify_event_json(&self, event: &IdentifyEvent) -> Value {
        json!({
            "kind": "identify",
            "creationDate": event.base.creation_date,
            "context": self.context_json(&event.base.context),
        })
    }

    pub fn custom_event_json(&self, event: &CustomEvent) -> Value {
        let mut out = Map::new();
        out.insert("kind".to_string(), json!("custom"));
        out.insert("creationDate".to_string(), json!(event.base.creation_date));
        out.insert("key".to_string(), json!(event.key));
        out.insert(
            "contextKeys".to_string(),
            Self::context_keys(&event.base.context),
        );
        if let Some(data) = &event.data {
            out.insert("data".to_string(), data.clone());
        }
        if let Some(metric) = event.metric_value {
            out.insert("metricValue".to_string(), json!(metric));
        }
        Value::Object(out)
    }

    pub fn summary_event_json(&self, summary: &EventSummarizer) -> Value {
        let mut features = Map::new();
        for (key, flag) in summary.flags() {
            let mut counters = Vec::new();
            for (counter_key, counter) in &flag.counters {
                let mut c = Map::new();
                match counter_key.version {
                    Some(version) => {
                        c.insert("version".to_string(), json!(version));
                    }
                    None => {
                        c.insert("unknown".to_string(), json!(true));
                    }
                }
                if let Some(variation) = counter_key.variation {
                    c.insert("variation".to_string(), json!(variation));
                }
                c.insert("value".to_string(), counter.value.clone());
                c.insert("count".to_string(), json!(counter.count));
                counters.push(Value::Object(c));
            }
            let mut kinds: Vec<&String> = flag.context_kinds.iter().collect();
            kinds.sort();
            features.insert(
                key.clone(),
                json!({
                    "default": flag.default,
                    "contextKinds": kinds,
                    "counters": counters,
                }),
            );
        }
        json!({
            "kind": "summary",
            "startDate": summary.start_date(),
            "endDate": summary.end_date(),
            "features": features,
        })
    }
}

// Removes the value addressed by components[depth..] from a nested object.
// Returns true if something was removed.
fn redact_path(value: &mut Value, reference: &AttributeRef, depth: usize) -> bool {
    let Some(component) = reference.component(depth) else {
        return false;
    };
    let Some(object) = value.as_object_mut() else {
        return false;
    };
    if depth + 1 == reference.depth() {
        return object.remove(component).is_some();
    }
    match object.get_mut(component) {
        Some(inner) => redact_path(inner, reference, depth + 1),
        None => false,
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextBuilder, MultiContextBuilder};
    use crate::events::BaseEvent;

    fn formatter() -> EventOutputFormatter {
        EventOutputFormatter::new(false, vec![])
    }

    #[test]
    fn test_single_context_serialization() {
        let context = ContextBuilder::new("u1")
            .name("Sandy")
            .set("email", json!("s@example.com"))
            .build();
        let out = formatter().context_json(&context);
        assert_eq!(
            out,
            json!({
                "kind": "user",
                "key": "u1",
                "name": "Sandy",
                "email": "s@example.com"
            })
        );
    }

    #[test]
    fn test_multi_context_serialization() {
        let context = MultiContextBuilder::new()
            .add(ContextBuilder::new("u1").build())
            .add(ContextBuilder::new("acme").kind("org").build())
            .build();
        let out = formatter().context_json(&context);
        assert_eq!(
            out,
            json!({
                "kind": "multi",
                "user": {"key": "u1"},
                "org": {"key": "acme"}
            })
        );
    }

    #[test]
    fn test_private_attribute_redaction() {
        let f = EventOutputFormatter::new(false, vec![AttributeRef::new("email")]);
        let context = ContextBuilder::new("u1")
            .set("email", json!("secret@example.com"))
            .set("plan", json!("pro"))
            .build();
        let out = f.context_json(&context);
        assert_eq!(out["plan"], json!("pro"));
        assert!(out.get("email").is_none());
        assert_eq!(out["_meta"]["redactedAttributes"], json!(["email"]));
    }

    #[test]
    fn test_nested_private_attribute_redaction() {
        let f = EventOutputFormatter::new(false, vec![AttributeRef::new("/address/street")]);
        let context = ContextBuilder::new("u1")
            .set("address", json!({"street": "12 Elm St", "city": "Oakland"}))
            .build();
        let out = f.context_json(&context);
        assert_eq!(out["address"], json!({"city": "Oakland"}));
        assert_eq!(out["_meta"]["redactedAttributes"], json!(["/address/street"]));
    }

    #[test]
    fn test_all_attributes_private_keeps_key_kind_anonymous() {
        let f = EventOutputFormatter::new(true, vec![]);
        let context = ContextBuilder::new("u1")
            .name("Sandy")
            .anonymous(true)
            .set("email", json!("x"))
            .build();
        let out = f.context_json(&context);
        assert_eq!(out["key"], json!("u1"));
        assert_eq!(out["kind"], json!("user"));
        assert_eq!(out["anonymous"], json!(true));
        assert!(out.get("name").is_none());
        assert!(out.get("email").is_none());
        let redacted = out["_meta"]["redactedAttributes"].as_array().unwrap();
        assert_eq!(redacted.len(), 2);
    }

    #[test]
    fn test_per_context_private_attributes() {
        let context = ContextBuilder::new("u1")
            .set("ssn", json!("000-00-0000"))
            .private_attribute("ssn")
            .build();
        let out = formatter().context_json(&context);
        assert!(out.get("ssn").is_none());
    }

    #[test]
    fn test_feature_event_uses_context_keys() {
        let event = FeatureRequestEvent {
            base: BaseEvent {
                creation_date: 99,
                context: ContextBuilder::new("u1").set("email", json!("x")).build(),
            },
            key: "f".to_string(),
            version: Some(2),
            variation: Some(1),
            value: json!("b"),
            default: json!("d"),
            reason: None,
            prereq_of: None,
            track_events: true,
            debug_events_until_date: None,
            sampling_ratio: 1,
            exclude_from_summaries: false,
        };
        let out = formatter().feature_event_json(&event, false);
        assert_eq!(out["kind"], json!("feature"));
        assert_eq!(out["contextKeys"], json!({"user": "u1"}));
        assert!(out.get("context").is_none());

        let debug = formatter().feature_event_json(&event, true);
        assert_eq!(debug["kind"], json!("debug"));
        assert_eq!(debug["context"]["key"], json!("u1"));
    }

    #[test]
    fn test_summary_event_shape() {
        use crate::context::Context;
        let mut summarizer = EventSummarizer::new();
        summarizer.summarize(&FeatureRequestEvent {
            base: BaseEvent {
                creation_date: 1000,
                context: Context::with_key("u1"),
            },
            key: "f".to_string(),
            version: None,
            variation: None,
            value: json!("d"),
            default: json!("d"),
            reason: None,
            prereq_of: None,
            track_events: false,
            debug_events_until_date: None,
            sampling_ratio: 1,
            exclude_from_summaries: false,
        });
        let out = formatter().summary_event_json(&summarizer);
        assert_eq!(out["kind"], json!("summary"));
        let counter = &out["features"]["f"]["counters"][0];
        // Unknown flag: no version, flagged as unknown.
        assert_eq!(counter["unknown"], json!(true));
        assert_eq!(counter["count"], json!(1));
    }
}
