//! Operation Sanitization
//!
//! Some replicas store foreign-key-like identifiers as strings while the
//! canonical value may arrive as a number. Values of the configured fields are
//! coerced to their string form once, here, before any replica sees them.

use std::collections::HashSet;

use serde_json::{Map, Value};

use super::OperationDescriptor;

/// Decides which `key: value` pairs of a mapping are rewritten, and how
pub trait LeafRule {
    /// Whether the value stored under `key` should be rewritten
    fn matches(&self, key: &str, value: &Value) -> bool;

    /// Replacement for a matched value
    fn rewrite(&self, value: &Value) -> Value;
}

/// Structural walk over a JSON tree applying a [`LeafRule`]
///
/// Mappings are rebuilt key by key, sequences element by element, scalars are
/// cloned. The input tree is never modified and the key set never changes.
#[derive(Debug, Clone)]
pub struct TreeVisitor<R> {
    rule: R,
}

impl<R: LeafRule> TreeVisitor<R> {
    pub fn new(rule: R) -> Self {
        Self { rule }
    }

    /// Rewrite an arbitrary value
    pub fn visit(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(self.visit_map(map)),
            Value::Array(items) => Value::Array(self.visit_seq(items)),
            scalar => scalar.clone(),
        }
    }

    /// Rewrite a mapping
    pub fn visit_map(&self, map: &Map<String, Value>) -> Map<String, Value> {
        map.iter()
            .map(|(key, value)| {
                let rewritten = if self.rule.matches(key, value) {
                    self.rule.rewrite(value)
                } else {
                    self.visit(value)
                };
                (key.clone(), rewritten)
            })
            .collect()
    }

    /// Rewrite a sequence
    pub fn visit_seq(&self, items: &[Value]) -> Vec<Value> {
        items.iter().map(|item| self.visit(item)).collect()
    }
}

/// Coerces non-null values of the named fields to strings
#[derive(Debug, Clone, Default)]
pub struct StringifyFields {
    fields: HashSet<String>,
}

impl StringifyFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl LeafRule for StringifyFields {
    fn matches(&self, key: &str, value: &Value) -> bool {
        !value.is_null() && self.fields.contains(key)
    }

    fn rewrite(&self, value: &Value) -> Value {
        Value::String(canonical_string(value))
    }
}

/// Canonical string form of a JSON value
///
/// Strings are kept verbatim; every other value uses its compact JSON text,
/// so `7` becomes `"7"` and `true` becomes `"true"`.
pub fn canonical_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Applies field normalization to operation descriptors
#[derive(Debug, Clone)]
pub struct Sanitizer {
    visitor: TreeVisitor<StringifyFields>,
}

impl Sanitizer {
    /// Create a sanitizer for the given field names
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            visitor: TreeVisitor::new(StringifyFields::new(fields)),
        }
    }

    /// Return a sanitized copy of `operation`
    ///
    /// `filter`, `data` and `pipeline` are independent roots; an absent root
    /// stays absent. `options` are driver knobs and are copied untouched.
    pub fn sanitize(&self, operation: &OperationDescriptor) -> OperationDescriptor {
        OperationDescriptor {
            kind: operation.kind,
            collection: operation.collection.clone(),
            filter: operation.filter.as_ref().map(|f| self.visitor.visit_map(f)),
            data: operation.data.as_ref().map(|d| self.visitor.visit(d)),
            pipeline: operation.pipeline.as_ref().map(|p| self.visitor.visit_seq(p)),
            options: operation.options.clone(),
        }
    }

    /// Sanitize a single tree; `null` comes back unchanged
    pub fn sanitize_value(&self, value: &Value) -> Value {
        self.visitor.visit(value)
    }
}
