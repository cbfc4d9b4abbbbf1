//! In-Memory Document Store
//!
//! Backs `memory://` endpoints. Used for dry runs and as the replica fake in
//! tests, so it also carries fault injection and connection accounting.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Map, Number, Value};

use super::{Connector, DocumentStore, Endpoint, InsertSummary, UpdateSummary};
use crate::error::{Error, Result};
use crate::operation::Document;

/// A set of named in-memory replicas
#[derive(Default)]
pub struct MemoryCluster {
    replicas: Mutex<HashMap<String, Arc<MemoryReplica>>>,
    gauge: Arc<OpenGauge>,
}

/// Connections open at once, counted across every replica of a cluster
#[derive(Debug, Default)]
struct OpenGauge {
    open: AtomicUsize,
    peak: AtomicUsize,
}

impl OpenGauge {
    fn acquire(&self) {
        let open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(open, Ordering::SeqCst);
    }

    fn release(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a replica by name, creating it on first use
    pub fn replica(&self, name: &str) -> Arc<MemoryReplica> {
        let mut replicas = lock(&self.replicas);
        replicas
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryReplica::new(Arc::clone(&self.gauge))))
            .clone()
    }

    /// Names of all replicas created so far
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.replicas).keys().cloned().collect();
        names.sort();
        names
    }

    /// Highest number of connections open at the same time across all replicas
    pub fn peak_open(&self) -> usize {
        self.gauge.peak.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Connector for MemoryCluster {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn DocumentStore>> {
        let name = endpoint.location().trim_end_matches('/');
        let replica = self.replica(name);
        let connection = replica.open(endpoint).await?;
        Ok(connection)
    }
}

/// Injected failures for one replica
#[derive(Debug, Clone, Default)]
struct Faults {
    connect_delay: Option<Duration>,
    connect_error: Option<String>,
    operation_delay: Option<Duration>,
    operation_error: Option<String>,
}

/// Connection and operation counters of a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplicaStats {
    pub connects: usize,
    pub closes: usize,
    pub open: usize,
    pub peak_open: usize,
    pub operations: usize,
}

/// One in-memory replica: named collections of documents
pub struct MemoryReplica {
    cluster: Arc<OpenGauge>,
    collections: Mutex<HashMap<String, Vec<Document>>>,
    faults: Mutex<Faults>,
    connects: AtomicUsize,
    closes: AtomicUsize,
    open: AtomicUsize,
    peak_open: AtomicUsize,
    operations: AtomicUsize,
}

impl MemoryReplica {
    fn new(cluster: Arc<OpenGauge>) -> Self {
        Self {
            cluster,
            collections: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            open: AtomicUsize::new(0),
            peak_open: AtomicUsize::new(0),
            operations: AtomicUsize::new(0),
        }
    }

    /// Delay every connection attempt
    pub fn set_connect_delay(&self, delay: Duration) {
        lock(&self.faults).connect_delay = Some(delay);
    }

    /// Refuse every connection attempt with `reason`
    pub fn set_connect_error(&self, reason: impl Into<String>) {
        lock(&self.faults).connect_error = Some(reason.into());
    }

    /// Delay every operation
    pub fn set_operation_delay(&self, delay: Duration) {
        lock(&self.faults).operation_delay = Some(delay);
    }

    /// Fail every operation with `message`
    pub fn set_operation_error(&self, message: impl Into<String>) {
        lock(&self.faults).operation_error = Some(message.into());
    }

    pub fn clear_faults(&self) {
        *lock(&self.faults) = Faults::default();
    }

    pub fn stats(&self) -> ReplicaStats {
        ReplicaStats {
            connects: self.connects.load(Ordering::SeqCst),
            closes: self.closes.load(Ordering::SeqCst),
            open: self.open.load(Ordering::SeqCst),
            peak_open: self.peak_open.load(Ordering::SeqCst),
            operations: self.operations.load(Ordering::SeqCst),
        }
    }

    /// Snapshot of a collection
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        lock(&self.collections)
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Append documents to a collection without any checks
    pub fn seed(&self, collection: &str, documents: Vec<Document>) {
        lock(&self.collections)
            .entry(collection.to_string())
            .or_default()
            .extend(documents);
    }

    async fn open(self: Arc<Self>, endpoint: &Endpoint) -> Result<Arc<MemoryConnection>> {
        let faults = lock(&self.faults).clone();

        if let Some(delay) = faults.connect_delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(reason) = faults.connect_error {
            return Err(Error::ConnectionFailed {
                target: endpoint.target.to_string(),
                reason,
            });
        }

        self.connects.fetch_add(1, Ordering::SeqCst);
        let open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_open.fetch_max(open, Ordering::SeqCst);
        self.cluster.acquire();

        Ok(Arc::new(MemoryConnection {
            replica: self,
            closed: AtomicBool::new(false),
        }))
    }
}

/// A connection handed out by [`MemoryCluster`]
pub struct MemoryConnection {
    replica: Arc<MemoryReplica>,
    closed: AtomicBool,
}

impl MemoryConnection {
    async fn begin(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<Document>>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::operation("connection is closed"));
        }

        let faults = lock(&self.replica.faults).clone();
        if let Some(delay) = faults.operation_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = faults.operation_error {
            return Err(Error::Operation(message));
        }

        self.replica.operations.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.replica.collections))
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryConnection {
    async fn insert_one(
        &self,
        collection: &str,
        document: &Document,
        _options: Option<&Document>,
    ) -> Result<InsertSummary> {
        let mut collections = self.begin().await?;
        let docs = collections.entry(collection.to_string()).or_default();
        let id = insert_document(collection, docs, document.clone())?;

        Ok(InsertSummary {
            inserted_count: 1,
            inserted_ids: vec![id],
        })
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: &[Document],
        _options: Option<&Document>,
    ) -> Result<InsertSummary> {
        let mut collections = self.begin().await?;
        let docs = collections.entry(collection.to_string()).or_default();

        // Ordered insert: documents before the first failure stay inserted
        let mut inserted_ids = Vec::with_capacity(documents.len());
        for document in documents {
            inserted_ids.push(insert_document(collection, docs, document.clone())?);
        }

        Ok(InsertSummary {
            inserted_count: inserted_ids.len() as u64,
            inserted_ids,
        })
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Document,
        update: &Value,
        options: Option<&Document>,
    ) -> Result<UpdateSummary> {
        let mut collections = self.begin().await?;
        let docs = collections.entry(collection.to_string()).or_default();
        update_documents(docs, filter, update, options, false)
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Document,
        update: &Value,
        options: Option<&Document>,
    ) -> Result<UpdateSummary> {
        let mut collections = self.begin().await?;
        let docs = collections.entry(collection.to_string()).or_default();
        update_documents(docs, filter, update, options, true)
    }

    async fn delete_one(
        &self,
        collection: &str,
        filter: &Document,
        _options: Option<&Document>,
    ) -> Result<u64> {
        let mut collections = self.begin().await?;
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };

        for index in 0..docs.len() {
            if matches(&docs[index], filter)? {
                docs.remove(index);
                return Ok(1);
            }
        }
        Ok(0)
    }

    async fn delete_many(
        &self,
        collection: &str,
        filter: &Document,
        _options: Option<&Document>,
    ) -> Result<u64> {
        let mut collections = self.begin().await?;
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };

        let mut kept = Vec::with_capacity(docs.len());
        let mut deleted = 0;
        for doc in docs.drain(..) {
            if matches(&doc, filter)? {
                deleted += 1;
            } else {
                kept.push(doc);
            }
        }
        *docs = kept;
        Ok(deleted)
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: &Document,
        replacement: &Document,
        _options: Option<&Document>,
    ) -> Result<UpdateSummary> {
        if replacement.keys().any(|k| k.starts_with('$')) {
            return Err(Error::operation(
                "Replacement document must not contain atomic operators",
            ));
        }

        let mut collections = self.begin().await?;
        let docs = collections.entry(collection.to_string()).or_default();

        for doc in docs.iter_mut() {
            if !matches(doc, filter)? {
                continue;
            }

            let mut replaced = replacement.clone();
            match (doc.get("_id"), replaced.get("_id")) {
                (Some(old), Some(new)) if old != new => {
                    return Err(Error::operation(
                        "After applying the update, the (immutable) field '_id' was found to have been altered",
                    ));
                }
                (Some(old), _) => {
                    replaced.insert("_id".to_string(), old.clone());
                }
                _ => {}
            }

            let modified = u64::from(*doc != replaced);
            *doc = replaced;
            return Ok(UpdateSummary {
                matched_count: 1,
                modified_count: modified,
                upserted_count: 0,
            });
        }

        Ok(UpdateSummary::default())
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        options: Option<&Document>,
    ) -> Result<Vec<Document>> {
        let collections = self.begin().await?;
        let found = select(collections.get(collection), filter)?;
        Ok(paginate(found, options))
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: &Document,
        _options: Option<&Document>,
    ) -> Result<Option<Document>> {
        let collections = self.begin().await?;
        Ok(select(collections.get(collection), filter)?.into_iter().next())
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Value],
        _options: Option<&Document>,
    ) -> Result<Vec<Document>> {
        let collections = self.begin().await?;
        let mut docs = collections.get(collection).cloned().unwrap_or_default();
        drop(collections);

        for stage in pipeline {
            docs = apply_stage(docs, stage)?;
        }
        Ok(docs)
    }

    async fn count_documents(
        &self,
        collection: &str,
        filter: &Document,
        options: Option<&Document>,
    ) -> Result<u64> {
        let collections = self.begin().await?;
        let found = select(collections.get(collection), filter)?;
        Ok(paginate(found, options).len() as u64)
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.replica.closes.fetch_add(1, Ordering::SeqCst);
            self.replica.open.fetch_sub(1, Ordering::SeqCst);
            self.replica.cluster.release();
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn insert_document(collection: &str, docs: &mut Vec<Document>, mut document: Document) -> Result<Value> {
    let id = document
        .entry("_id")
        .or_insert_with(|| Value::String(uuid::Uuid::new_v4().simple().to_string()))
        .clone();

    if docs.iter().any(|existing| existing.get("_id") == Some(&id)) {
        return Err(Error::operation(format!(
            "E11000 duplicate key error collection: {} index: _id_ dup key: {{ _id: {} }}",
            collection, id
        )));
    }

    docs.push(document);
    Ok(id)
}

fn update_documents(
    docs: &mut Vec<Document>,
    filter: &Document,
    update: &Value,
    options: Option<&Document>,
    multi: bool,
) -> Result<UpdateSummary> {
    check_update(update)?;
    let mut summary = UpdateSummary::default();

    for doc in docs.iter_mut() {
        if !matches(doc, filter)? {
            continue;
        }

        let mut updated = doc.clone();
        apply_update(&mut updated, update)?;
        summary.matched_count += 1;
        if updated != *doc {
            summary.modified_count += 1;
            *doc = updated;
        }

        if !multi {
            break;
        }
    }

    let upsert = options
        .and_then(|o| o.get("upsert"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if summary.matched_count == 0 && upsert {
        let mut seeded: Document = filter
            .iter()
            .filter(|(k, v)| !k.starts_with('$') && !is_operator_object(v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        apply_update(&mut seeded, update)?;
        seeded
            .entry("_id")
            .or_insert_with(|| Value::String(uuid::Uuid::new_v4().simple().to_string()));
        docs.push(seeded);
        summary.upserted_count = 1;
    }

    Ok(summary)
}

fn select(docs: Option<&Vec<Document>>, filter: &Document) -> Result<Vec<Document>> {
    let mut found = Vec::new();
    for doc in docs.map(|d| d.as_slice()).unwrap_or_default() {
        if matches(doc, filter)? {
            found.push(doc.clone());
        }
    }
    Ok(found)
}

fn paginate(docs: Vec<Document>, options: Option<&Document>) -> Vec<Document> {
    let skip = options
        .and_then(|o| o.get("skip"))
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize;
    let limit = options
        .and_then(|o| o.get("limit"))
        .and_then(Value::as_i64)
        .map(|l| l.unsigned_abs() as usize)
        .filter(|l| *l > 0)
        .unwrap_or(usize::MAX);

    docs.into_iter().skip(skip).take(limit).collect()
}

fn apply_stage(docs: Vec<Document>, stage: &Value) -> Result<Vec<Document>> {
    let spec = match stage {
        Value::Object(spec) if spec.len() == 1 => spec,
        _ => {
            return Err(Error::operation(
                "A pipeline stage specification object must contain exactly one field.",
            ))
        }
    };
    let Some((name, arg)) = spec.iter().next() else {
        return Ok(docs);
    };

    match (name.as_str(), arg) {
        ("$match", Value::Object(filter)) => {
            let mut kept = Vec::new();
            for doc in docs {
                if matches(&doc, filter)? {
                    kept.push(doc);
                }
            }
            Ok(kept)
        }
        ("$skip", n) => {
            let n = n
                .as_u64()
                .ok_or_else(|| Error::operation("$skip must be a non-negative integer"))?;
            Ok(docs.into_iter().skip(n as usize).collect())
        }
        ("$limit", n) => {
            let n = n
                .as_u64()
                .filter(|n| *n > 0)
                .ok_or_else(|| Error::operation("the limit must be positive"))?;
            Ok(docs.into_iter().take(n as usize).collect())
        }
        ("$count", Value::String(field)) => {
            if docs.is_empty() {
                return Ok(Vec::new());
            }
            let mut out = Map::new();
            out.insert(field.clone(), Value::from(docs.len() as u64));
            Ok(vec![out])
        }
        (other, _) => Err(Error::operation(format!(
            "Unrecognized pipeline stage name: '{}'",
            other
        ))),
    }
}

fn is_operator_object(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.keys().next().is_some_and(|k| k.starts_with('$')),
        _ => false,
    }
}

fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn matches(doc: &Document, filter: &Document) -> Result<bool> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let clauses = condition
                    .as_array()
                    .ok_or_else(|| Error::operation(format!("{} must be an array", key)))?;
                let mut results = Vec::with_capacity(clauses.len());
                for clause in clauses {
                    let clause = clause.as_object().ok_or_else(|| {
                        Error::operation(format!("{} entries must be objects", key))
                    })?;
                    results.push(matches(doc, clause)?);
                }
                match key.as_str() {
                    "$and" => results.iter().all(|r| *r),
                    "$or" => results.iter().any(|r| *r),
                    _ => !results.iter().any(|r| *r),
                }
            }
            op if op.starts_with('$') => {
                return Err(Error::operation(format!("unknown top level operator: {}", op)))
            }
            path => field_matches(lookup(doc, path), condition)?,
        };

        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn field_matches(value: Option<&Value>, condition: &Value) -> Result<bool> {
    let Value::Object(ops) = condition else {
        return Ok(equals(value, condition));
    };
    if !is_operator_object(condition) {
        return Ok(equals(value, condition));
    }

    for (op, arg) in ops {
        let ok = match op.as_str() {
            "$eq" => equals(value, arg),
            "$ne" => !equals(value, arg),
            "$gt" => compare(value, arg) == Some(CmpOrdering::Greater),
            "$gte" => matches!(
                compare(value, arg),
                Some(CmpOrdering::Greater | CmpOrdering::Equal)
            ),
            "$lt" => compare(value, arg) == Some(CmpOrdering::Less),
            "$lte" => matches!(
                compare(value, arg),
                Some(CmpOrdering::Less | CmpOrdering::Equal)
            ),
            "$in" | "$nin" => {
                let candidates = arg
                    .as_array()
                    .ok_or_else(|| Error::operation(format!("{} needs an array", op)))?;
                let found = candidates.iter().any(|c| equals(value, c));
                if op == "$in" {
                    found
                } else {
                    !found
                }
            }
            "$exists" => value.is_some() == arg.as_bool().unwrap_or(true),
            other => return Err(Error::operation(format!("unknown operator: {}", other))),
        };

        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn equals(value: Option<&Value>, expected: &Value) -> bool {
    match value {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Some(actual) => values_equal(actual, expected),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(value: Option<&Value>, arg: &Value) -> Option<CmpOrdering> {
    match (value?, arg) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Reject update shapes regardless of whether anything matches
fn check_update(update: &Value) -> Result<()> {
    let Value::Object(ops) = update else {
        return Err(Error::operation(
            "update pipelines are not supported by the memory store",
        ));
    };

    if ops.is_empty() || !ops.keys().all(|k| k.starts_with('$')) {
        return Err(Error::operation("update document requires atomic operators"));
    }

    Ok(())
}

fn apply_update(doc: &mut Document, update: &Value) -> Result<()> {
    check_update(update)?;
    let Value::Object(ops) = update else {
        return Ok(());
    };

    for (op, fields) in ops {
        let Value::Object(fields) = fields else {
            return Err(Error::operation(format!(
                "Modifiers operate on fields but we found a non-document for {}",
                op
            )));
        };

        for (path, arg) in fields {
            if path == "_id" || path.starts_with("_id.") {
                return Err(Error::operation(
                    "Performing an update on the path '_id' would modify the immutable field '_id'",
                ));
            }

            match op.as_str() {
                "$set" => set_path(doc, path, arg.clone())?,
                "$unset" => unset_path(doc, path),
                "$inc" => {
                    let sum = match lookup(doc, path) {
                        None => arg.clone(),
                        Some(current) => add_numbers(current, arg)?,
                    };
                    if !sum.is_number() {
                        return Err(Error::operation("Cannot increment with non-numeric argument"));
                    }
                    set_path(doc, path, sum)?;
                }
                other => {
                    return Err(Error::operation(format!(
                        "Unknown modifier: {}. Expected a valid update modifier",
                        other
                    )))
                }
            }
        }
    }
    Ok(())
}

fn set_path(doc: &mut Document, path: &str, value: Value) -> Result<()> {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
            Ok(())
        }
        Some((head, rest)) => {
            let child = doc
                .entry(head)
                .or_insert_with(|| Value::Object(Map::new()));
            match child {
                Value::Object(map) => set_path(map, rest, value),
                other => Err(Error::operation(format!(
                    "Cannot create field '{}' in element {{{}: {}}}",
                    rest, head, other
                ))),
            }
        }
    }
}

fn unset_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(map)) = doc.get_mut(head) {
                unset_path(map, rest);
            }
        }
    }
}

fn add_numbers(current: &Value, delta: &Value) -> Result<Value> {
    let (Value::Number(a), Value::Number(b)) = (current, delta) else {
        return Err(Error::operation("Cannot apply $inc to a value of non-numeric type"));
    };

    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Ok(Value::from(sum));
        }
    }

    let sum = a.as_f64().unwrap_or_default() + b.as_f64().unwrap_or_default();
    Number::from_f64(sum)
        .map(Value::Number)
        .ok_or_else(|| Error::operation("$inc produced a non-finite number"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::ReplicaTarget;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    async fn connect(cluster: &MemoryCluster, name: &str) -> Arc<dyn DocumentStore> {
        let endpoint = Endpoint::new(ReplicaTarget::from(name), format!("memory://{}", name));
        cluster.connect(&endpoint).await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let cluster = MemoryCluster::new();
        let store = connect(&cluster, "ins1").await;

        store
            .insert_one("students", &doc(json!({"_id": 1, "Id_Aula": "7"})), None)
            .await
            .unwrap();
        let inserted = store
            .insert_many(
                "students",
                &[doc(json!({"Id_Aula": "8"})), doc(json!({"Id_Aula": "7"}))],
                None,
            )
            .await
            .unwrap();
        assert_eq!(inserted.inserted_count, 2);

        let found = store
            .find("students", &doc(json!({"Id_Aula": "7"})), None)
            .await
            .unwrap();
        assert_eq!(found.len(), 2);

        // Numbers and strings are distinct values
        let found = store
            .find("students", &doc(json!({"Id_Aula": 7})), None)
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let cluster = MemoryCluster::new();
        let store = connect(&cluster, "ins1").await;

        store
            .insert_one("c", &doc(json!({"_id": "a"})), None)
            .await
            .unwrap();
        let err = store
            .insert_one("c", &doc(json!({"_id": "a"})), None)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("E11000 duplicate key error"));
    }

    #[tokio::test]
    async fn test_update_operators() {
        let cluster = MemoryCluster::new();
        cluster.replica("ins1").seed(
            "c",
            vec![
                doc(json!({"_id": 1, "n": 1, "tag": "a"})),
                doc(json!({"_id": 2, "n": 5, "tag": "a"})),
                doc(json!({"_id": 3, "n": 9, "tag": "b"})),
            ],
        );
        let store = connect(&cluster, "ins1").await;

        let summary = store
            .update_many(
                "c",
                &doc(json!({"tag": "a"})),
                &json!({"$inc": {"n": 1}, "$set": {"meta.seen": true}}),
                None,
            )
            .await
            .unwrap();
        assert_eq!(summary.matched_count, 2);
        assert_eq!(summary.modified_count, 2);

        // Setting an identical value matches but does not modify
        let summary = store
            .update_one("c", &doc(json!({"_id": 3})), &json!({"$set": {"tag": "b"}}), None)
            .await
            .unwrap();
        assert_eq!(summary.matched_count, 1);
        assert_eq!(summary.modified_count, 0);

        let docs = cluster.replica("ins1").documents("c");
        assert_eq!(docs[1], doc(json!({"_id": 2, "n": 6, "tag": "a", "meta": {"seen": true}})));
    }

    #[tokio::test]
    async fn test_update_requires_operators() {
        let cluster = MemoryCluster::new();
        let store = connect(&cluster, "ins1").await;
        let err = store
            .update_one("c", &Document::new(), &json!({"n": 1}), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("atomic operators"));
    }

    #[tokio::test]
    async fn test_cluster_peak_spans_replicas() {
        let cluster = MemoryCluster::new();
        let a = connect(&cluster, "ins1").await;
        let b = connect(&cluster, "ins2").await;
        a.close().await.unwrap();
        let c = connect(&cluster, "ins3").await;
        b.close().await.unwrap();
        c.close().await.unwrap();

        assert_eq!(cluster.peak_open(), 2);
        assert_eq!(cluster.replica("ins1").stats().peak_open, 1);
    }

    #[tokio::test]
    async fn test_update_shape_checked_without_matches() {
        let cluster = MemoryCluster::new();
        let store = connect(&cluster, "ins1").await;
        store
            .insert_one("c", &doc(json!({"_id": 1, "n": 1})), None)
            .await
            .unwrap();

        let err = store
            .update_many("c", &doc(json!({"n": 99})), &json!({"n": 1}), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("atomic operators"));

        let err = store
            .update_many("empty", &Document::new(), &json!({"n": 1}), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("atomic operators"));
    }

    #[tokio::test]
    async fn test_upsert() {
        let cluster = MemoryCluster::new();
        let store = connect(&cluster, "ins1").await;
        let summary = store
            .update_one(
                "c",
                &doc(json!({"code": "x"})),
                &json!({"$set": {"n": 1}}),
                Some(&doc(json!({"upsert": true}))),
            )
            .await
            .unwrap();
        assert_eq!(summary.upserted_count, 1);
        assert_eq!(
            store.count_documents("c", &doc(json!({"code": "x", "n": 1})), None).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_replace_and_delete() {
        let cluster = MemoryCluster::new();
        cluster.replica("ins1").seed(
            "c",
            vec![doc(json!({"_id": 1, "a": 1})), doc(json!({"_id": 2, "a": 1}))],
        );
        let store = connect(&cluster, "ins1").await;

        let summary = store
            .replace_one("c", &doc(json!({"_id": 1})), &doc(json!({"b": 2})), None)
            .await
            .unwrap();
        assert_eq!(summary.modified_count, 1);
        assert_eq!(
            cluster.replica("ins1").documents("c")[0],
            doc(json!({"b": 2, "_id": 1}))
        );

        assert_eq!(store.delete_one("c", &doc(json!({"_id": 1})), None).await.unwrap(), 1);
        assert_eq!(store.delete_many("c", &Document::new(), None).await.unwrap(), 1);
        assert_eq!(store.delete_many("missing", &Document::new(), None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_query_operators() {
        let cluster = MemoryCluster::new();
        cluster.replica("ins1").seed(
            "c",
            vec![
                doc(json!({"n": 1, "tags": ["x", "y"]})),
                doc(json!({"n": 5})),
                doc(json!({"n": 9, "tags": ["z"]})),
            ],
        );
        let store = connect(&cluster, "ins1").await;

        let count = |filter: Value| {
            let store = store.clone();
            async move { store.count_documents("c", &doc(filter), None).await.unwrap() }
        };

        assert_eq!(count(json!({"n": {"$gte": 5}})).await, 2);
        assert_eq!(count(json!({"n": {"$in": [1, 9]}})).await, 2);
        assert_eq!(count(json!({"tags": "y"})).await, 1);
        assert_eq!(count(json!({"tags": {"$exists": false}})).await, 1);
        assert_eq!(count(json!({"$or": [{"n": 1}, {"n": 5}]})).await, 2);
        assert!(store
            .count_documents("c", &doc(json!({"n": {"$regex": "x"}})), None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_aggregate_stages() {
        let cluster = MemoryCluster::new();
        cluster.replica("ins1").seed(
            "c",
            (0..10).map(|n| doc(json!({"n": n}))).collect(),
        );
        let store = connect(&cluster, "ins1").await;

        let out = store
            .aggregate(
                "c",
                &[json!({"$match": {"n": {"$lt": 6}}}), json!({"$skip": 1}), json!({"$limit": 3})],
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.len(), 3);

        let out = store
            .aggregate("c", &[json!({"$count": "total"})], None)
            .await
            .unwrap();
        assert_eq!(out, vec![doc(json!({"total": 10}))]);

        let err = store
            .aggregate("c", &[json!({"$group": {"_id": null}})], None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("$group"));
    }

    #[tokio::test]
    async fn test_faults_and_accounting() {
        let cluster = MemoryCluster::new();
        let replica = cluster.replica("ins1");
        replica.set_operation_error("not primary");

        let store = connect(&cluster, "ins1").await;
        let err = store.find("c", &Document::new(), None).await.unwrap_err();
        assert_eq!(err.to_string(), "not primary");

        store.close().await.unwrap();
        store.close().await.unwrap();
        assert_eq!(
            replica.stats(),
            ReplicaStats {
                connects: 1,
                closes: 1,
                open: 0,
                peak_open: 1,
                operations: 0,
            }
        );

        replica.clear_faults();
        replica.set_connect_error("connection refused");
        let endpoint = Endpoint::new(ReplicaTarget::from("ins1"), "memory://ins1");
        let err = cluster.connect(&endpoint).await.err().unwrap();
        assert_eq!(err.kind(), crate::error::FailureKind::Connection);
    }
}
