//! Operation Dispatch
//!
//! Maps an [`OperationDescriptor`] onto one document-store action and reduces
//! the action's result to an affected-document count.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::operation::{Document, OperationDescriptor, OperationKind};
use crate::store::DocumentStore;

/// Normalized result of one dispatched operation
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DispatchResult {
    /// Documents inserted, modified, deleted, returned or counted
    pub affected_count: u64,
    /// Documents returned by read operations
    pub documents: Vec<Document>,
}

impl DispatchResult {
    fn count(affected_count: u64) -> Self {
        Self {
            affected_count,
            documents: Vec::new(),
        }
    }

    fn documents(documents: Vec<Document>) -> Self {
        Self {
            affected_count: documents.len() as u64,
            documents,
        }
    }
}

/// Run `operation` against one replica's store
///
/// Store failures come back as [`Error::Operation`] carrying the store's
/// message. Stateless; safe to call concurrently on independent connections.
pub async fn execute(store: &dyn DocumentStore, operation: &OperationDescriptor) -> Result<DispatchResult> {
    let collection = operation.collection.as_str();
    let options = operation.options.as_ref();

    let result = match operation.kind {
        OperationKind::InsertOne => {
            let document = data_document(operation)?;
            store.insert_one(collection, document, options).await?;
            DispatchResult::count(1)
        }
        OperationKind::InsertMany => {
            let documents = data_documents(operation)?;
            let summary = store.insert_many(collection, &documents, options).await?;
            DispatchResult::count(summary.inserted_count)
        }
        OperationKind::UpdateOne => {
            let summary = store
                .update_one(collection, &operation.filter_or_default(), data(operation)?, options)
                .await?;
            DispatchResult::count(summary.modified_count)
        }
        OperationKind::UpdateMany => {
            let summary = store
                .update_many(collection, &operation.filter_or_default(), data(operation)?, options)
                .await?;
            DispatchResult::count(summary.modified_count)
        }
        OperationKind::DeleteOne => {
            let deleted = store
                .delete_one(collection, &operation.filter_or_default(), options)
                .await?;
            DispatchResult::count(deleted)
        }
        OperationKind::DeleteMany => {
            let deleted = store
                .delete_many(collection, &operation.filter_or_default(), options)
                .await?;
            DispatchResult::count(deleted)
        }
        OperationKind::ReplaceOne => {
            let replacement = data_document(operation)?;
            let summary = store
                .replace_one(collection, &operation.filter_or_default(), replacement, options)
                .await?;
            DispatchResult::count(summary.modified_count)
        }
        OperationKind::Find => {
            let documents = store
                .find(collection, &operation.filter_or_default(), options)
                .await?;
            DispatchResult::documents(documents)
        }
        OperationKind::FindOne => {
            let found = store
                .find_one(collection, &operation.filter_or_default(), options)
                .await?;
            DispatchResult::documents(found.into_iter().collect())
        }
        OperationKind::Aggregate => {
            let documents = store
                .aggregate(collection, &operation.pipeline_or_default(), options)
                .await?;
            DispatchResult::documents(documents)
        }
        OperationKind::CountDocuments => {
            let count = store
                .count_documents(collection, &operation.filter_or_default(), options)
                .await?;
            DispatchResult::count(count)
        }
    };

    Ok(result)
}

fn data(operation: &OperationDescriptor) -> Result<&Value> {
    operation
        .data
        .as_ref()
        .ok_or_else(|| Error::operation(format!("{} requires data", operation.kind)))
}

fn data_document(operation: &OperationDescriptor) -> Result<&Document> {
    data(operation)?
        .as_object()
        .ok_or_else(|| Error::operation(format!("{} data must be a document", operation.kind)))
}

fn data_documents(operation: &OperationDescriptor) -> Result<Vec<Document>> {
    let items = data(operation)?
        .as_array()
        .ok_or_else(|| Error::operation("insertMany data must be a sequence of documents"))?;

    items
        .iter()
        .map(|item| {
            item.as_object()
                .cloned()
                .ok_or_else(|| Error::operation("insertMany data must be a sequence of documents"))
        })
        .collect()
}
