//! Evaluation contexts
//!
//! A [`Context`] identifies the subject of a flag evaluation. Every context
//! has one or more named *kinds* (the default kind is `user`), each carrying
//! a key and optional attributes. Multi-kind contexts bundle several
//! single-kind contexts so one evaluation can target, say, a user and the
//! device they are on.
//!
//! Contexts are cheap to clone and immutable once built. Invalid input
//! (empty key, malformed kind) does not panic and does not fail the build;
//! it produces a context whose [`Context::valid`] is false, which every
//! evaluation treats as a `USER_NOT_SPECIFIED` error result.
//!
//! # Example
//!
//! ```rust
//! use flagflow::context::ContextBuilder;
//!
//! let context = ContextBuilder::new("user-key-123")
//!     .name("Sandy")
//!     .set("groups", serde_json::json!(["beta_testers"]))
//!     .build();
//! assert!(context.valid());
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind name reserved for multi-kind contexts.
pub const MULTI_KIND: &str = "multi";

/// The default context kind.
pub const DEFAULT_KIND: &str = "user";

/// The name of a context kind, e.g. `user`, `device`, `organization`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Kind(String);

impl Kind {
    /// The default `user` kind.
    pub fn user() -> Self {
        Kind(DEFAULT_KIND.to_string())
    }

    /// The reserved `multi` kind.
    pub fn multi() -> Self {
        Kind(MULTI_KIND.to_string())
    }

    /// Whether this is the default `user` kind.
    pub fn is_user(&self) -> bool {
        self.0 == DEFAULT_KIND
    }

    /// Whether this is the reserved `multi` kind.
    pub fn is_multi(&self) -> bool {
        self.0 == MULTI_KIND
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    // Kind names share the character set of URL path segments so they can be
    // embedded in canonical keys and stream paths unescaped.
    fn validate(name: &str) -> Result<(), String> {
        if name.is_empty() {
            return Err("context kind must not be empty".to_string());
        }
        if name == "kind" {
            return Err("\"kind\" is not a valid context kind".to_string());
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
        {
            return Err(format!("context kind contains invalid characters: {name:?}"));
        }
        Ok(())
    }
}

impl Default for Kind {
    fn default() -> Self {
        Kind::user()
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Kind {
    fn from(s: &str) -> Self {
        Kind(s.to_string())
    }
}

impl PartialEq<str> for Kind {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

/// A parsed reference to a context attribute.
///
/// References address either a top-level attribute (`"email"`) or, with a
/// leading slash, a path into nested JSON objects (`"/address/city"`). Inside
/// a slash-delimited path, `~1` escapes a literal `/` and `~0` a literal `~`.
///
/// An unparseable reference is retained with its error; using it in a clause
/// makes the flag malformed rather than panicking.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AttributeRef {
    raw: String,
    components: Vec<String>,
    error: Option<&'static str>,
}

impl AttributeRef {
    /// Parses an attribute reference from its string form.
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if raw.is_empty() || raw == "/" {
            return AttributeRef {
                raw,
                components: Vec::new(),
                error: Some("attribute reference is empty"),
            };
        }
        if let Some(path) = raw.strip_prefix('/') {
            let mut components = Vec::new();
            for part in path.split('/') {
                if part.is_empty() {
                    return AttributeRef {
                        raw,
                        components: Vec::new(),
                        error: Some("attribute reference has an empty path component"),
                    };
                }
                components.push(part.replace("~1", "/").replace("~0", "~"));
            }
            AttributeRef {
                raw,
                components,
                error: None,
            }
        } else {
            AttributeRef {
                components: vec![raw.clone()],
                raw,
                error: None,
            }
        }
    }

    /// A reference to a single top-level attribute, without path parsing.
    pub fn literal(name: impl Into<String>) -> Self {
        let name = name.into();
        if name.is_empty() {
            return AttributeRef::new("");
        }
        AttributeRef {
            raw: if name.starts_with('/') {
                format!("/{}", name.replace('~', "~0").replace('/', "~1"))
            } else {
                name.clone()
            },
            components: vec![name],
            error: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&self) -> Option<&'static str> {
        self.error
    }

    /// Number of path components (0 if invalid).
    pub fn depth(&self) -> usize {
        self.components.len()
    }

    /// The `i`th path component.
    pub fn component(&self, i: usize) -> Option<&str> {
        self.components.get(i).map(String::as_str)
    }

    /// The original string form.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for AttributeRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> serde::Deserialize<'de> for AttributeRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(AttributeRef::new(raw))
    }
}

/// The subject of a flag evaluation: one or more kinds, each with a key and
/// optional attributes.
///
/// Built with [`ContextBuilder`] or [`MultiContextBuilder`]. See the module
/// docs for validity semantics.
#[derive(Clone, Debug, PartialEq)]
pub struct Context {
    kind: Kind,
    key: String,
    name: Option<String>,
    anonymous: bool,
    attributes: HashMap<String, Value>,
    private_attributes: Vec<AttributeRef>,
    // Non-empty only for multi-kind contexts; members are single-kind and
    // sorted by kind so canonical keys are order independent.
    contexts: Vec<Context>,
    full_key: String,
    error: Option<String>,
}

impl Context {
    /// Shorthand for a default-kind context with no attributes.
    pub fn with_key(key: impl Into<String>) -> Self {
        ContextBuilder::new(key).build()
    }

    /// False if the context was built from invalid input and will produce
    /// `USER_NOT_SPECIFIED` evaluation results.
    pub fn valid(&self) -> bool {
        self.error.is_none()
    }

    /// The validation failure, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    /// The context key. Empty for multi-kind contexts.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn anonymous(&self) -> bool {
        self.anonymous
    }

    pub fn is_multi(&self) -> bool {
        self.kind.is_multi()
    }

    /// The canonical key identifying this context across all kinds.
    ///
    /// For a default-kind context this is the key itself; otherwise kind/key
    /// pairs are joined with `:` (kinds sorted), with `%` and `:` inside keys
    /// escaped as `%25` and `%3A`.
    pub fn fully_qualified_key(&self) -> &str {
        &self.full_key
    }

    /// Attributes set via [`ContextBuilder::set`] (not `key`/`kind`/built-ins).
    pub fn attributes(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Attribute references marked private for this context.
    pub fn private_attributes(&self) -> &[AttributeRef] {
        &self.private_attributes
    }

    /// The kinds present in this context.
    pub fn kinds(&self) -> Vec<&Kind> {
        if self.is_multi() {
            self.contexts.iter().map(|c| &c.kind).collect()
        } else {
            vec![&self.kind]
        }
    }

    /// The individual contexts within this one: the members of a multi-kind
    /// context, or just this context itself.
    pub fn individual_contexts(&self) -> impl Iterator<Item = &Context> {
        if self.is_multi() {
            self.contexts.iter()
        } else {
            std::slice::from_ref(self).iter()
        }
    }

    /// Selects the individual context of the given kind, if present.
    pub fn as_kind(&self, kind: &Kind) -> Option<&Context> {
        if self.is_multi() {
            self.contexts.iter().find(|c| &c.kind == kind)
        } else if &self.kind == kind {
            Some(self)
        } else {
            None
        }
    }

    /// Looks up an attribute value by reference on this individual context.
    ///
    /// `kind`, `key`, `name` and `anonymous` resolve as built-ins (top-level
    /// references only); anything else is looked up in the attribute map,
    /// descending through nested objects for multi-component references.
    /// Returns `None` for invalid references, missing attributes, and any
    /// lookup on a multi-kind context.
    pub fn get_value(&self, reference: &AttributeRef) -> Option<Value> {
        if !reference.is_valid() || self.is_multi() {
            return None;
        }
        let first = reference.component(0)?;
        if reference.depth() == 1 {
            match first {
                "kind" => return Some(Value::String(self.kind.0.clone())),
                "key" => return Some(Value::String(self.key.clone())),
                "name" => return self.name.clone().map(Value::String),
                "anonymous" => return Some(Value::Bool(self.anonymous)),
                _ => {}
            }
        }
        let mut current = self.attributes.get(first)?;
        for i in 1..reference.depth() {
            let component = reference.component(i)?;
            current = current.as_object()?.get(component)?;
        }
        Some(current.clone())
    }

    fn escape_key(key: &str) -> String {
        key.replace('%', "%25").replace(':', "%3A")
    }

    fn canonical_key(kind: &Kind, key: &str) -> String {
        if kind.is_user() {
            key.to_string()
        } else {
            format!("{}:{}", kind, Self::escape_key(key))
        }
    }
}

/// Builds a single-kind [`Context`].
#[derive(Clone, Debug)]
pub struct ContextBuilder {
    kind: Kind,
    key: String,
    name: Option<String>,
    anonymous: bool,
    attributes: HashMap<String, Value>,
    private_attributes: Vec<AttributeRef>,
}

impl ContextBuilder {
    /// Starts a builder for a default-kind (`user`) context with this key.
    pub fn new(key: impl Into<String>) -> Self {
        ContextBuilder {
            kind: Kind::user(),
            key: key.into(),
            name: None,
            anonymous: false,
            attributes: HashMap::new(),
            private_attributes: Vec::new(),
        }
    }

    /// Sets the context kind. Defaults to `user`.
    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Kind(kind.into());
        self
    }

    /// Sets the human-readable name attribute.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Marks the context as anonymous.
    pub fn anonymous(mut self, anonymous: bool) -> Self {
        self.anonymous = anonymous;
        self
    }

    /// Sets an arbitrary attribute. Setting `kind`, `key`, `name` or
    /// `anonymous` here is ignored in favor of the dedicated setters.
    pub fn set(mut self, name: impl Into<String>, value: Value) -> Self {
        let name = name.into();
        match name.as_str() {
            "kind" | "key" | "name" | "anonymous" => self,
            _ => {
                self.attributes.insert(name, value);
                self
            }
        }
    }

    /// Marks an attribute reference as private for this context; private
    /// attributes are redacted from analytics output but still evaluated.
    pub fn private_attribute(mut self, reference: impl Into<String>) -> Self {
        self.private_attributes.push(AttributeRef::new(reference));
        self
    }

    /// Builds the context. Never fails; invalid input yields an invalid
    /// context (see [`Context::valid`]).
    pub fn build(self) -> Context {
        let mut error = None;
        if self.key.is_empty() {
            error = Some("context key must not be empty".to_string());
        }
        if let Err(e) = Kind::validate(self.kind.as_str()) {
            error = Some(e);
        } else if self.kind.is_multi() {
            error = Some("single-kind context cannot have kind \"multi\"".to_string());
        }
        let full_key = Context::canonical_key(&self.kind, &self.key);
        Context {
            kind: self.kind,
            key: self.key,
            name: self.name,
            anonymous: self.anonymous,
            attributes: self.attributes,
            private_attributes: self.private_attributes,
            contexts: Vec::new(),
            full_key,
            error,
        }
    }
}

/// Builds a multi-kind [`Context`] from single-kind parts.
#[derive(Clone, Debug, Default)]
pub struct MultiContextBuilder {
    contexts: Vec<Context>,
}

impl MultiContextBuilder {
    pub fn new() -> Self {
        MultiContextBuilder::default()
    }

    /// Adds an individual context. Multi-kind inputs are rejected at build.
    pub fn add(mut self, context: Context) -> Self {
        self.contexts.push(context);
        self
    }

    /// Builds the combined context.
    ///
    /// A multi-kind context of exactly one part collapses to that part.
    pub fn build(mut self) -> Context {
        let mut error = None;
        if self.contexts.is_empty() {
            error = Some("multi-kind context must contain at least one context".to_string());
        }
        for c in &self.contexts {
            if c.is_multi() {
                error = Some("multi-kind context cannot nest another multi-kind context".to_string());
            } else if let Some(e) = c.error() {
                error = Some(e.to_string());
            }
        }
        self.contexts.sort_by(|a, b| a.kind.cmp(&b.kind));
        if self.contexts.windows(2).any(|w| w[0].kind == w[1].kind) {
            error = Some("multi-kind context has duplicate kinds".to_string());
        }

        if error.is_none() && self.contexts.len() == 1 {
            return self.contexts.remove(0);
        }

        let full_key = self
            .contexts
            .iter()
            .map(|c| format!("{}:{}", c.kind, Context::escape_key(&c.key)))
            .collect::<Vec<_>>()
            .join(":");
        Context {
            kind: Kind::multi(),
            key: String::new(),
            name: None,
            anonymous: false,
            attributes: HashMap::new(),
            private_attributes: Vec::new(),
            contexts: self.contexts,
            full_key,
            error,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_simple_context_is_valid() {
        let context = Context::with_key("u1");
        assert!(context.valid());
        assert_eq!(context.key(), "u1");
        assert_eq!(context.kind().as_str(), "user");
        assert_eq!(context.fully_qualified_key(), "u1");
    }

    #[test]
    fn test_empty_key_is_invalid() {
        let context = Context::with_key("");
        assert!(!context.valid());
        assert!(context.error().unwrap().contains("key"));
    }

    #[test]
    fn test_invalid_kind_names() {
        for kind in ["kind", "multi", "has space", ""] {
            let context = ContextBuilder::new("k").kind(kind).build();
            assert!(!context.valid(), "kind {kind:?} should be invalid");
        }
        let context = ContextBuilder::new("k").kind("org-unit_2.x").build();
        assert!(context.valid());
    }

    #[test]
    fn test_canonical_key_non_user_kind() {
        let context = ContextBuilder::new("key:with%chars").kind("org").build();
        assert_eq!(context.fully_qualified_key(), "org:key%3Awith%25chars");
    }

    #[test]
    fn test_multi_context_canonical_key_sorted_by_kind() {
        let multi = MultiContextBuilder::new()
            .add(ContextBuilder::new("z-key").kind("zebra").build())
            .add(ContextBuilder::new("a-key").kind("ant").build())
            .build();
        assert!(multi.valid());
        assert_eq!(multi.fully_qualified_key(), "ant:a-key:zebra:z-key");
    }

    #[test]
    fn test_multi_context_with_single_part_collapses() {
        let context = MultiContextBuilder::new()
            .add(ContextBuilder::new("u1").build())
            .build();
        assert!(!context.is_multi());
        assert_eq!(context.key(), "u1");
    }

    #[test]
    fn test_multi_context_duplicate_kinds_invalid() {
        let multi = MultiContextBuilder::new()
            .add(ContextBuilder::new("a").kind("org").build())
            .add(ContextBuilder::new("b").kind("org").build())
            .build();
        assert!(!multi.valid());
    }

    #[test]
    fn test_as_kind_selects_member() {
        let multi = MultiContextBuilder::new()
            .add(ContextBuilder::new("u1").build())
            .add(ContextBuilder::new("o1").kind("org").build())
            .build();
        assert_eq!(multi.as_kind(&Kind::user()).unwrap().key(), "u1");
        assert_eq!(multi.as_kind(&Kind::from("org")).unwrap().key(), "o1");
        assert!(multi.as_kind(&Kind::from("device")).is_none());
    }

    #[test]
    fn test_get_value_built_ins() {
        let context = ContextBuilder::new("u1").name("Sandy").anonymous(true).build();
        assert_eq!(
            context.get_value(&AttributeRef::new("key")),
            Some(json!("u1"))
        );
        assert_eq!(
            context.get_value(&AttributeRef::new("kind")),
            Some(json!("user"))
        );
        assert_eq!(
            context.get_value(&AttributeRef::new("name")),
            Some(json!("Sandy"))
        );
        assert_eq!(
            context.get_value(&AttributeRef::new("anonymous")),
            Some(json!(true))
        );
    }

    #[test]
    fn test_get_value_nested_path() {
        let context = ContextBuilder::new("u1")
            .set("address", json!({"city": "Oakland", "geo": {"lat": 37.8}}))
            .build();
        assert_eq!(
            context.get_value(&AttributeRef::new("/address/city")),
            Some(json!("Oakland"))
        );
        assert_eq!(
            context.get_value(&AttributeRef::new("/address/geo/lat")),
            Some(json!(37.8))
        );
        assert_eq!(context.get_value(&AttributeRef::new("/address/zip")), None);
    }

    #[test]
    fn test_get_value_missing_attribute() {
        let context = Context::with_key("u1");
        assert_eq!(context.get_value(&AttributeRef::new("email")), None);
    }

    #[test]
    fn test_attribute_ref_escaping() {
        let r = AttributeRef::new("/a~1b/c~0d");
        assert!(r.is_valid());
        assert_eq!(r.component(0), Some("a/b"));
        assert_eq!(r.component(1), Some("c~d"));
    }

    #[test]
    fn test_attribute_ref_invalid_forms() {
        for raw in ["", "/", "//", "/a//b"] {
            assert!(!AttributeRef::new(raw).is_valid(), "{raw:?} should be invalid");
        }
    }

    #[test]
    fn test_attribute_ref_literal_keeps_slashes() {
        let r = AttributeRef::literal("a/b");
        assert!(r.is_valid());
        assert_eq!(r.depth(), 1);
        assert_eq!(r.component(0), Some("a/b"));
    }

    #[test]
    fn test_builder_ignores_reserved_names_in_set() {
        let context = ContextBuilder::new("u1").set("key", json!("other")).build();
        assert_eq!(context.key(), "u1");
        assert_eq!(context.get_value(&AttributeRef::new("key")), Some(json!("u1")));
    }
}
