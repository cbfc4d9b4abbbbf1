//! MongoDB Backend
//!
//! Opens one client per replica connection. Values travel through the engine
//! as JSON and are converted to BSON (extended JSON aware) at this boundary.

use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use mongodb::bson::{self, doc, Bson, Document as BsonDocument};
use mongodb::options::{
    AggregateOptions, ClientOptions, CountOptions, DeleteOptions, FindOneOptions, FindOptions,
    InsertManyOptions, InsertOneOptions, ReplaceOptions, UpdateModifications, UpdateOptions,
};
use mongodb::{Client, Collection};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{Connector, DocumentStore, Endpoint, InsertSummary, UpdateSummary};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::operation::Document;

/// Connector for `mongodb://` and `mongodb+srv://` endpoints
pub struct MongoConnector {
    database: String,
    store: StoreConfig,
}

impl MongoConnector {
    pub fn new(database: &str, store: StoreConfig) -> Self {
        Self {
            database: database.to_string(),
            store,
        }
    }

    /// Driver options for an endpoint, with the configured pool hints applied
    async fn client_options(&self, endpoint: &Endpoint) -> Result<ClientOptions> {
        let mut options = ClientOptions::parse(&endpoint.url)
            .await
            .map_err(|e| connection_error(endpoint, e))?;

        options.app_name = Some("wolfmirror".to_string());
        options.max_pool_size = Some(self.store.max_pool_size);
        options.min_pool_size = Some(self.store.min_pool_size);
        options.max_idle_time = Some(Duration::from_millis(self.store.max_idle_time_ms));
        options.server_selection_timeout =
            Some(Duration::from_millis(self.store.server_selection_timeout_ms));
        options.connect_timeout = Some(Duration::from_millis(self.store.connect_timeout_ms));
        options.heartbeat_freq = Some(Duration::from_millis(self.store.heartbeat_frequency_ms));
        options.retry_writes = Some(self.store.retry_writes);
        options.retry_reads = Some(self.store.retry_reads);

        Ok(options)
    }
}

#[async_trait::async_trait]
impl Connector for MongoConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn DocumentStore>> {
        let options = self.client_options(endpoint).await?;
        let client = Client::with_options(options).map_err(|e| connection_error(endpoint, e))?;

        // The driver connects lazily; a ping forces server selection now
        let ping = client
            .database(&self.database)
            .run_command(doc! { "ping": 1 }, None)
            .await;

        if let Err(e) = ping {
            client.shutdown().await;
            return Err(connection_error(endpoint, e));
        }

        tracing::debug!("Connected to {}", endpoint.redacted());

        Ok(Arc::new(MongoStore {
            client,
            database: self.database.clone(),
        }))
    }
}

/// A live MongoDB connection for one replica
pub struct MongoStore {
    client: Client,
    database: String,
}

impl MongoStore {
    fn collection(&self, name: &str) -> Collection<BsonDocument> {
        self.client.database(&self.database).collection(name)
    }
}

#[async_trait::async_trait]
impl DocumentStore for MongoStore {
    async fn insert_one(
        &self,
        collection: &str,
        document: &Document,
        options: Option<&Document>,
    ) -> Result<InsertSummary> {
        let result = self
            .collection(collection)
            .insert_one(to_bson_document(document)?, parse_options::<InsertOneOptions>(options)?)
            .await
            .map_err(Error::operation)?;

        Ok(InsertSummary {
            inserted_count: 1,
            inserted_ids: vec![to_json(result.inserted_id)],
        })
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: &[Document],
        options: Option<&Document>,
    ) -> Result<InsertSummary> {
        let documents = documents
            .iter()
            .map(to_bson_document)
            .collect::<Result<Vec<_>>>()?;

        let result = self
            .collection(collection)
            .insert_many(documents, parse_options::<InsertManyOptions>(options)?)
            .await
            .map_err(Error::operation)?;

        let mut ids: Vec<(usize, Bson)> = result.inserted_ids.into_iter().collect();
        ids.sort_by_key(|(index, _)| *index);

        Ok(InsertSummary {
            inserted_count: ids.len() as u64,
            inserted_ids: ids.into_iter().map(|(_, id)| to_json(id)).collect(),
        })
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Document,
        update: &Value,
        options: Option<&Document>,
    ) -> Result<UpdateSummary> {
        let result = self
            .collection(collection)
            .update_one(
                to_bson_document(filter)?,
                to_modifications(update)?,
                parse_options::<UpdateOptions>(options)?,
            )
            .await
            .map_err(Error::operation)?;

        Ok(update_summary(result))
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Document,
        update: &Value,
        options: Option<&Document>,
    ) -> Result<UpdateSummary> {
        let result = self
            .collection(collection)
            .update_many(
                to_bson_document(filter)?,
                to_modifications(update)?,
                parse_options::<UpdateOptions>(options)?,
            )
            .await
            .map_err(Error::operation)?;

        Ok(update_summary(result))
    }

    async fn delete_one(
        &self,
        collection: &str,
        filter: &Document,
        options: Option<&Document>,
    ) -> Result<u64> {
        let result = self
            .collection(collection)
            .delete_one(to_bson_document(filter)?, parse_options::<DeleteOptions>(options)?)
            .await
            .map_err(Error::operation)?;

        Ok(result.deleted_count)
    }

    async fn delete_many(
        &self,
        collection: &str,
        filter: &Document,
        options: Option<&Document>,
    ) -> Result<u64> {
        let result = self
            .collection(collection)
            .delete_many(to_bson_document(filter)?, parse_options::<DeleteOptions>(options)?)
            .await
            .map_err(Error::operation)?;

        Ok(result.deleted_count)
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: &Document,
        replacement: &Document,
        options: Option<&Document>,
    ) -> Result<UpdateSummary> {
        let result = self
            .collection(collection)
            .replace_one(
                to_bson_document(filter)?,
                to_bson_document(replacement)?,
                parse_options::<ReplaceOptions>(options)?,
            )
            .await
            .map_err(Error::operation)?;

        Ok(update_summary(result))
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        options: Option<&Document>,
    ) -> Result<Vec<Document>> {
        let cursor = self
            .collection(collection)
            .find(to_bson_document(filter)?, parse_options::<FindOptions>(options)?)
            .await
            .map_err(Error::operation)?;

        let documents: Vec<BsonDocument> = cursor.try_collect().await.map_err(Error::operation)?;
        documents.into_iter().map(to_json_document).collect()
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: &Document,
        options: Option<&Document>,
    ) -> Result<Option<Document>> {
        let found = self
            .collection(collection)
            .find_one(to_bson_document(filter)?, parse_options::<FindOneOptions>(options)?)
            .await
            .map_err(Error::operation)?;

        found.map(to_json_document).transpose()
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Value],
        options: Option<&Document>,
    ) -> Result<Vec<Document>> {
        let stages = pipeline
            .iter()
            .map(|stage| match stage {
                Value::Object(stage) => to_bson_document(stage),
                other => Err(Error::operation(format!(
                    "pipeline stage must be a document, got {}",
                    other
                ))),
            })
            .collect::<Result<Vec<_>>>()?;

        let cursor = self
            .collection(collection)
            .aggregate(stages, parse_options::<AggregateOptions>(options)?)
            .await
            .map_err(Error::operation)?;

        let documents: Vec<BsonDocument> = cursor.try_collect().await.map_err(Error::operation)?;
        documents.into_iter().map(to_json_document).collect()
    }

    async fn count_documents(
        &self,
        collection: &str,
        filter: &Document,
        options: Option<&Document>,
    ) -> Result<u64> {
        self.collection(collection)
            .count_documents(to_bson_document(filter)?, parse_options::<CountOptions>(options)?)
            .await
            .map_err(Error::operation)
    }

    async fn close(&self) -> Result<()> {
        self.client.clone().shutdown().await;
        Ok(())
    }
}

fn connection_error(endpoint: &Endpoint, error: mongodb::error::Error) -> Error {
    Error::ConnectionFailed {
        target: endpoint.target.to_string(),
        reason: error.to_string(),
    }
}

fn update_summary(result: mongodb::results::UpdateResult) -> UpdateSummary {
    UpdateSummary {
        matched_count: result.matched_count,
        modified_count: result.modified_count,
        upserted_count: u64::from(result.upserted_id.is_some()),
    }
}

/// Convert a JSON document to BSON, honoring extended JSON (`$oid`, `$date`, ...)
fn to_bson_document(document: &Document) -> Result<BsonDocument> {
    match Bson::try_from(Value::Object(document.clone())) {
        Ok(Bson::Document(doc)) => Ok(doc),
        Ok(other) => Err(Error::operation(format!(
            "expected a document, got {}",
            other
        ))),
        Err(e) => Err(Error::operation(e)),
    }
}

fn to_modifications(update: &Value) -> Result<UpdateModifications> {
    match update {
        Value::Object(document) => Ok(UpdateModifications::Document(to_bson_document(document)?)),
        Value::Array(stages) => {
            let stages = stages
                .iter()
                .map(|stage| match stage {
                    Value::Object(stage) => to_bson_document(stage),
                    other => Err(Error::operation(format!(
                        "update pipeline stage must be a document, got {}",
                        other
                    ))),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(UpdateModifications::Pipeline(stages))
        }
        other => Err(Error::operation(format!(
            "update must be a document or a pipeline, got {}",
            other
        ))),
    }
}

fn parse_options<T: DeserializeOwned>(options: Option<&Document>) -> Result<Option<T>> {
    options
        .map(|o| {
            let document = to_bson_document(o)?;
            bson::from_document::<T>(document)
                .map_err(|e| Error::operation(format!("invalid options: {}", e)))
        })
        .transpose()
}

fn to_json(value: Bson) -> Value {
    value.into_relaxed_extjson()
}

fn to_json_document(document: BsonDocument) -> Result<Document> {
    match to_json(Bson::Document(document)) {
        Value::Object(map) => Ok(map),
        other => Err(Error::operation(format!(
            "store returned a non-document value: {}",
            other
        ))),
    }
}
