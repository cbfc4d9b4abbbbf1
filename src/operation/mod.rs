//! Operation Module
//!
//! The store-agnostic description of the single logical operation that is
//! replicated to every target, and the sanitization pass applied to it.

mod sanitize;

pub use sanitize::{LeafRule, Sanitizer, StringifyFields, TreeVisitor};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// A document: an ordered mapping of field name to value
pub type Document = Map<String, Value>;

/// Kinds of operations the dispatcher knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    InsertOne,
    InsertMany,
    UpdateOne,
    UpdateMany,
    DeleteOne,
    DeleteMany,
    ReplaceOne,
    Find,
    FindOne,
    Aggregate,
    CountDocuments,
}

impl OperationKind {
    /// All recognized kinds
    pub const ALL: [OperationKind; 11] = [
        OperationKind::InsertOne,
        OperationKind::InsertMany,
        OperationKind::UpdateOne,
        OperationKind::UpdateMany,
        OperationKind::DeleteOne,
        OperationKind::DeleteMany,
        OperationKind::ReplaceOne,
        OperationKind::Find,
        OperationKind::FindOne,
        OperationKind::Aggregate,
        OperationKind::CountDocuments,
    ];

    /// Wire label of this kind (e.g. `insertOne`)
    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::InsertOne => "insertOne",
            OperationKind::InsertMany => "insertMany",
            OperationKind::UpdateOne => "updateOne",
            OperationKind::UpdateMany => "updateMany",
            OperationKind::DeleteOne => "deleteOne",
            OperationKind::DeleteMany => "deleteMany",
            OperationKind::ReplaceOne => "replaceOne",
            OperationKind::Find => "find",
            OperationKind::FindOne => "findOne",
            OperationKind::Aggregate => "aggregate",
            OperationKind::CountDocuments => "countDocuments",
        }
    }

    /// Look up a kind by its wire label
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.label() == label)
    }

    /// Whether the operation requires a `data` payload
    pub fn requires_data(&self) -> bool {
        matches!(
            self,
            OperationKind::InsertOne
                | OperationKind::InsertMany
                | OperationKind::UpdateOne
                | OperationKind::UpdateMany
                | OperationKind::ReplaceOne
        )
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// The operation replicated to every target
///
/// Descriptors are immutable once built; [`Sanitizer::sanitize`] returns a new
/// descriptor instead of rewriting this one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationDescriptor {
    #[serde(rename = "operation")]
    pub kind: OperationKind,
    pub collection: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<Document>,
    /// A document for single writes, a sequence of documents for `insertMany`,
    /// or an update pipeline for updates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Document>,
}

/// Untyped shape of an operation as it arrives from the job payload
#[derive(Debug, Deserialize)]
struct RawOperation {
    operation: String,
    collection: String,
    #[serde(default)]
    filter: Option<Value>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    pipeline: Option<Value>,
    #[serde(default)]
    options: Option<Value>,
}

impl OperationDescriptor {
    /// Create a descriptor with only kind and collection set
    pub fn new(kind: OperationKind, collection: impl Into<String>) -> Self {
        Self {
            kind,
            collection: collection.into(),
            filter: None,
            data: None,
            pipeline: None,
            options: None,
        }
    }

    pub fn with_filter(mut self, filter: Document) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_pipeline(mut self, pipeline: Vec<Value>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn with_options(mut self, options: Document) -> Self {
        self.options = Some(options);
        self
    }

    /// Parse and validate a descriptor from its JSON form
    ///
    /// Malformed payloads are [`Error::Input`] / [`Error::Json`]. A well-formed
    /// payload naming an unknown operation is [`Error::UnsupportedOperation`],
    /// which callers record per target rather than aborting.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawOperation = serde_json::from_str(json)?;
        Self::from_raw(raw)
    }

    /// Build a descriptor from an already-decoded JSON value
    pub fn from_value(value: Value) -> Result<Self> {
        let raw: RawOperation = serde_json::from_value(value)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawOperation) -> Result<Self> {
        if raw.collection.trim().is_empty() {
            return Err(Error::Input("collection cannot be empty".into()));
        }

        let kind = OperationKind::from_label(&raw.operation).ok_or_else(|| {
            Error::UnsupportedOperation {
                operation: raw.operation.clone(),
                collection: raw.collection.clone(),
            }
        })?;

        let descriptor = Self {
            kind,
            collection: raw.collection,
            filter: optional_document("filter", raw.filter)?,
            data: raw.data.filter(|v| !v.is_null()),
            pipeline: optional_sequence("pipeline", raw.pipeline)?,
            options: optional_document("options", raw.options)?,
        };

        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Check that the inputs required by `kind` are present and well-shaped
    pub fn validate(&self) -> Result<()> {
        if self.collection.trim().is_empty() {
            return Err(Error::Input("collection cannot be empty".into()));
        }

        if self.kind.requires_data() && self.data.is_none() {
            return Err(Error::Input(format!("{} requires data", self.kind)));
        }

        match (self.kind, &self.data) {
            (OperationKind::InsertMany, Some(Value::Array(items))) => {
                if items.iter().any(|item| !item.is_object()) {
                    return Err(Error::Input(
                        "insertMany data must be a sequence of documents".into(),
                    ));
                }
            }
            (OperationKind::InsertMany, Some(_)) => {
                return Err(Error::Input("insertMany data must be a sequence".into()));
            }
            (OperationKind::InsertOne | OperationKind::ReplaceOne, Some(data))
                if !data.is_object() =>
            {
                return Err(Error::Input(format!("{} data must be a document", self.kind)));
            }
            (OperationKind::UpdateOne | OperationKind::UpdateMany, Some(data))
                if !(data.is_object() || data.is_array()) =>
            {
                return Err(Error::Input(format!(
                    "{} data must be a document or an update pipeline",
                    self.kind
                )));
            }
            _ => {}
        }

        Ok(())
    }

    /// Filter, defaulting to the empty (match-all) document
    pub fn filter_or_default(&self) -> Document {
        self.filter.clone().unwrap_or_default()
    }

    /// Pipeline, defaulting to no stages
    pub fn pipeline_or_default(&self) -> Vec<Value> {
        self.pipeline.clone().unwrap_or_default()
    }
}

fn optional_document(field: &str, value: Option<Value>) -> Result<Option<Document>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(Error::Input(format!("{} must be a document", field))),
    }
}

fn optional_sequence(field: &str, value: Option<Value>) -> Result<Option<Vec<Value>>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => Ok(Some(items)),
        Some(_) => Err(Error::Input(format!("{} must be a sequence", field))),
    }
}
