//! In-memory org used by tests and dry runs.
//!
//! `MemoryOrg` stores records per object in concurrent maps, evaluates the
//! structured filters of [`Query`] directly, and mimics the pieces of server
//! behavior the pipeline relies on:
//!
//! - inserting a `ContentVersion` creates its `ContentDocument` and, when
//!   `FirstPublishLocationId` is set, the implicit first link;
//! - a second `ContentDocumentLink` for the same (document, entity) pair is
//!   rejected with `DUPLICATE_VALUE`;
//! - raw conditions are evaluated by predicates registered per object.
//!
//! Failure injection (`fail_next_calls`, `reject_when`) drives retry tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use serde_json::{Value, json};

use crate::{
    ApiError, Filter, ObjectDescribe, OrgApi, Query, Record, RecordExt, SaveResult,
};

/// Predicate standing in for a raw condition string.
pub type ConditionFn = Arc<dyn Fn(&Record) -> bool + Send + Sync>;

struct Rejection {
    field: String,
    value: Value,
    message: String,
    /// Remaining rejections; `None` rejects forever.
    remaining: Option<usize>,
}

/// An org held entirely in memory.
pub struct MemoryOrg {
    tables: DashMap<String, Vec<Record>>,
    blobs: DashMap<(String, String), Vec<u8>>,
    describes: DashMap<String, ObjectDescribe>,
    conditions: DashMap<(String, String), ConditionFn>,
    rejections: DashMap<String, Vec<Rejection>>,
    fail_next: AtomicUsize,
    calls: DashMap<String, usize>,
    next_id: AtomicU64,
}

impl Default for MemoryOrg {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOrg {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            blobs: DashMap::new(),
            describes: DashMap::new(),
            conditions: DashMap::new(),
            rejections: DashMap::new(),
            fail_next: AtomicUsize::new(0),
            calls: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Key prefix used for generated ids of `object`.
    pub fn key_prefix_for(object: &str) -> &'static str {
        match object {
            "Account" => "001",
            "Contact" => "003",
            "User" => "005",
            "Task" => "00T",
            "Event" => "00U",
            "Group" => "00G",
            "Attachment" => "00P",
            "EmailTemplate" => "00X",
            "RecordType" => "012",
            "EmailMessage" => "02s",
            "ContentDistribution" => "05D",
            "ContentVersion" => "068",
            "ContentDocument" => "069",
            "ContentDocumentLink" => "06A",
            "FeedItem" => "0D5",
            "FeedComment" => "0D7",
            "ServiceAppointment" => "08p",
            _ => "a0X",
        }
    }

    fn generate_id(&self, object: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{}{:015}", Self::key_prefix_for(object), n)
    }

    fn count_call(&self, name: &str) {
        *self.calls.entry(name.to_string()).or_insert(0) += 1;
    }

    /// Number of times an operation was called. Keys are the method name,
    /// optionally suffixed with the object (`insert_batch:Task`).
    pub fn call_count(&self, key: &str) -> usize {
        self.calls.get(key).map(|c| *c).unwrap_or(0)
    }

    /// Seed a record. Generates an `Id` when the record has none and returns it.
    pub fn seed(&self, object: &str, record: Value) -> String {
        let mut record = record.as_object().cloned().unwrap_or_default();
        let id = match record.id() {
            Some(id) => id.to_string(),
            None => {
                let id = self.generate_id(object);
                record.insert("Id".to_string(), Value::String(id.clone()));
                id
            }
        };
        self.tables
            .entry(object.to_string())
            .or_default()
            .push(record);
        id
    }

    /// Seed binary content for `download`.
    pub fn seed_blob(&self, object: &str, id: &str, bytes: Vec<u8>) {
        self.blobs.insert((object.to_string(), id.to_string()), bytes);
    }

    /// Register describe metadata for an object.
    pub fn seed_describe(&self, describe: ObjectDescribe) {
        self.describes.insert(describe.name.clone(), describe);
    }

    /// Register the predicate that evaluates `condition` on `object`.
    pub fn register_condition<F>(&self, object: &str, condition: &str, predicate: F)
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        self.conditions.insert(
            (object.to_string(), condition.trim().to_string()),
            Arc::new(predicate),
        );
    }

    /// Make the next `n` calls (of any kind) fail with a transient error.
    pub fn fail_next_calls(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Reject inserts of `object` whose `field` equals `value`.
    /// `times = None` rejects forever; `Some(n)` rejects the first n matches.
    pub fn reject_when(
        &self,
        object: &str,
        field: &str,
        value: impl Into<Value>,
        message: &str,
        times: Option<usize>,
    ) {
        self.rejections
            .entry(object.to_string())
            .or_default()
            .push(Rejection {
                field: field.to_string(),
                value: value.into(),
                message: message.to_string(),
                remaining: times,
            });
    }

    /// All stored records of an object.
    pub fn records(&self, object: &str) -> Vec<Record> {
        self.tables
            .get(object)
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    /// Look up a stored record by id.
    pub fn record(&self, object: &str, id: &str) -> Option<Record> {
        self.tables
            .get(object)
            .and_then(|t| t.iter().find(|r| r.id() == Some(id)).cloned())
    }

    fn take_injected_failure(&self) -> Result<(), ApiError> {
        let took = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            Err(ApiError::Server {
                status: 503,
                body: "injected failure".to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn matches(&self, object: &str, record: &Record, filter: &Filter) -> Result<bool, ApiError> {
        Ok(match filter {
            Filter::In { field, values } => record
                .path_str(field)
                .is_some_and(|v| values.iter().any(|candidate| candidate == v)),
            Filter::Eq { field, value } => match (record.path(field), value) {
                (None, Value::Null) => true,
                (Some(found), expected) => found == expected,
                (None, _) => false,
            },
            Filter::NotNull(field) => record.path(field).is_some(),
            Filter::AnyNotNull(fields) => fields.iter().any(|f| record.path(f).is_some()),
            Filter::Raw(condition) => {
                let key = (object.to_string(), condition.clone());
                let predicate = self
                    .conditions
                    .get(&key)
                    .map(|entry| Arc::clone(entry.value()))
                    .ok_or_else(|| ApiError::Api {
                        code: "MALFORMED_QUERY".to_string(),
                        message: format!(
                            "no predicate registered for '{}' on {}",
                            condition, object
                        ),
                    })?;
                predicate(record)
            }
        })
    }

    /// Keep only the selected fields; relationship paths keep their root object.
    fn project(record: &Record, fields: &[String]) -> Record {
        let mut projected = Record::new();
        for field in fields.iter().map(String::as_str).chain(std::iter::once("Id")) {
            let root = field.split('.').next().unwrap_or(field);
            if let Some(value) = record.get(root) {
                projected.insert(root.to_string(), value.clone());
            }
        }
        projected
    }

    fn rejection_for(&self, object: &str, record: &Record) -> Option<String> {
        let mut rules = self.rejections.get_mut(object)?;
        for rule in rules.iter_mut() {
            if record.get(&rule.field) != Some(&rule.value) {
                continue;
            }
            match rule.remaining {
                Some(0) => continue,
                Some(ref mut n) => *n -= 1,
                None => {}
            }
            return Some(rule.message.clone());
        }
        None
    }

    fn has_link(&self, document_id: &str, entity_id: &str) -> bool {
        self.tables.get("ContentDocumentLink").is_some_and(|links| {
            links.iter().any(|l| {
                l.path_str("ContentDocumentId") == Some(document_id)
                    && l.path_str("LinkedEntityId") == Some(entity_id)
            })
        })
    }

    /// Store one new record, applying server-side side effects.
    fn insert_one(&self, object: &str, mut record: Record) -> SaveResult {
        if let Some(message) = self.rejection_for(object, &record) {
            return SaveResult::failed("FIELD_CUSTOM_VALIDATION_EXCEPTION", message);
        }

        if object == "ContentDocumentLink" {
            let document = record.path_str("ContentDocumentId").unwrap_or_default();
            let entity = record.path_str("LinkedEntityId").unwrap_or_default();
            if self.has_link(document, entity) {
                return SaveResult::failed(
                    "DUPLICATE_VALUE",
                    "duplicate value found: this document is already linked",
                );
            }
        }

        let id = self.generate_id(object);
        record.insert("Id".to_string(), Value::String(id.clone()));

        if object == "ContentVersion" {
            self.publish_version(&id, &mut record);
        }

        self.tables
            .entry(object.to_string())
            .or_default()
            .push(record);
        SaveResult::ok(id)
    }

    fn publish_version(&self, version_id: &str, record: &mut Record) {
        let document_id = match record.path_str("ContentDocumentId") {
            Some(existing) => existing.to_string(),
            None => {
                let document_id = self.generate_id("ContentDocument");
                self.tables
                    .entry("ContentDocument".to_string())
                    .or_default()
                    .push(
                        json!({ "Id": document_id, "LatestPublishedVersionId": version_id })
                            .as_object()
                            .cloned()
                            .unwrap_or_default(),
                    );
                document_id
            }
        };
        record.insert("ContentDocumentId".into(), Value::String(document_id.clone()));
        record.insert("IsLatest".into(), Value::Bool(true));

        if let Some(data) = record.path_str("VersionData") {
            if let Ok(bytes) = BASE64.decode(data) {
                self.blobs
                    .insert(("ContentVersion".to_string(), version_id.to_string()), bytes);
            }
        }

        if let Some(parent) = record.path_str("FirstPublishLocationId") {
            let link = json!({
                "ContentDocumentId": document_id,
                "LinkedEntityId": parent,
                "ShareType": "V",
                "Visibility": "AllUsers",
            });
            self.seed("ContentDocumentLink", link);
        }
    }
}

#[async_trait]
impl OrgApi for MemoryOrg {
    async fn query(&self, query: &Query) -> Result<Vec<Record>, ApiError> {
        self.count_call("query");
        self.count_call(&format!("query:{}", query.object));
        self.take_injected_failure()?;

        let table = self.records(&query.object);
        let mut found = Vec::new();
        for record in &table {
            let mut keep = true;
            for filter in &query.filters {
                if !self.matches(&query.object, record, filter)? {
                    keep = false;
                    break;
                }
            }
            if keep {
                found.push(Self::project(record, &query.fields));
            }
        }
        if let Some(limit) = query.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn insert_batch(
        &self,
        object: &str,
        records: &[Record],
    ) -> Result<Vec<SaveResult>, ApiError> {
        self.count_call("insert_batch");
        self.count_call(&format!("insert_batch:{}", object));
        self.take_injected_failure()?;

        Ok(records
            .iter()
            .map(|record| self.insert_one(object, record.clone()))
            .collect())
    }

    async fn update_batch(
        &self,
        object: &str,
        records: &[Record],
    ) -> Result<Vec<SaveResult>, ApiError> {
        self.count_call("update_batch");
        self.take_injected_failure()?;

        let mut results = Vec::with_capacity(records.len());
        for update in records {
            let Some(id) = update.id().map(str::to_string) else {
                results.push(SaveResult::failed("MISSING_ARGUMENT", "Id not specified"));
                continue;
            };
            if let Some(message) = self.rejection_for(object, update) {
                results.push(SaveResult::failed("FIELD_CUSTOM_VALIDATION_EXCEPTION", message));
                continue;
            }
            let mut table = self.tables.entry(object.to_string()).or_default();
            match table.iter_mut().find(|r| r.id() == Some(id.as_str())) {
                Some(existing) => {
                    for (key, value) in update {
                        existing.insert(key.clone(), value.clone());
                    }
                    results.push(SaveResult::ok(id));
                }
                None => results.push(SaveResult::failed(
                    "ENTITY_IS_DELETED",
                    format!("entity {} does not exist", id),
                )),
            }
        }
        Ok(results)
    }

    async fn create(&self, object: &str, record: &Record) -> Result<String, ApiError> {
        self.count_call("create");
        self.count_call(&format!("create:{}", object));
        self.take_injected_failure()?;

        let result = self.insert_one(object, record.clone());
        match result.id {
            Some(id) if result.success => Ok(id),
            _ => Err(ApiError::Api {
                code: result
                    .errors
                    .first()
                    .map(|e| e.status_code.clone())
                    .unwrap_or_default(),
                message: result.error_message(),
            }),
        }
    }

    async fn get(&self, object: &str, id: &str) -> Result<Record, ApiError> {
        self.count_call("get");
        self.take_injected_failure()?;

        self.record(object, id).ok_or_else(|| ApiError::NotFound {
            object: object.to_string(),
            id: id.to_string(),
        })
    }

    async fn describe(&self, object: &str) -> Result<ObjectDescribe, ApiError> {
        self.count_call("describe");
        self.take_injected_failure()?;

        Ok(self
            .describes
            .get(object)
            .map(|d| d.clone())
            .unwrap_or_else(|| ObjectDescribe {
                name: object.to_string(),
                key_prefix: Some(Self::key_prefix_for(object).to_string()),
                fields: Vec::new(),
            }))
    }

    async fn download(&self, object: &str, id: &str, field: &str) -> Result<Vec<u8>, ApiError> {
        self.count_call("download");
        self.count_call(&format!("download:{}", object));
        self.take_injected_failure()?;

        if let Some(bytes) = self.blobs.get(&(object.to_string(), id.to_string())) {
            return Ok(bytes.clone());
        }
        let record = self.record(object, id).ok_or_else(|| ApiError::NotFound {
            object: object.to_string(),
            id: id.to_string(),
        })?;
        let encoded = record.path_str(field).ok_or_else(|| ApiError::NotFound {
            object: object.to_string(),
            id: format!("{}/{}", id, field),
        })?;
        BASE64
            .decode(encoded)
            .map_err(|e| ApiError::InvalidResponse(format!("invalid base64 in {}: {}", field, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_query_filters_and_projects() {
        let org = MemoryOrg::new();
        org.seed(
            "Task",
            json!({ "Id": "00T1", "Subject": "a", "WhatId": "001A", "What": { "Type": "Account" } }),
        );
        org.seed("Task", json!({ "Id": "00T2", "Subject": "b", "WhatId": "001B" }));

        let query = Query::select("Task", ["Subject", "What.Type"])
            .filter(Filter::is_in("WhatId", ["001A"]));
        let records = org.query(&query).await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path_str("What.Type"), Some("Account"));
        assert!(records[0].get("WhatId").is_none());
        assert_eq!(org.call_count("query:Task"), 1);
    }

    #[tokio::test]
    async fn test_unregistered_raw_condition_is_an_error() {
        let org = MemoryOrg::new();
        org.seed("Account", json!({ "Id": "001A" }));
        let query = Query::select("Account", ["Id"]).filter(Filter::Raw("IsPersonAccount = false".into()));
        assert!(org.query(&query).await.is_err());

        org.register_condition("Account", "IsPersonAccount = false", |r| {
            r.path("IsPersonAccount") != Some(&Value::Bool(true))
        });
        assert_eq!(org.query(&query).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_run_out() {
        let org = MemoryOrg::new();
        org.fail_next_calls(2);
        let query = Query::select("Account", ["Id"]);
        assert!(org.query(&query).await.is_err());
        assert!(org.query(&query).await.is_err());
        assert!(org.query(&query).await.is_ok());
    }

    #[tokio::test]
    async fn test_content_version_publishes_document_and_link() {
        let org = MemoryOrg::new();
        let record = json!({
            "Title": "report",
            "VersionData": BASE64.encode(b"hello"),
            "FirstPublishLocationId": "00T1"
        })
        .as_object()
        .cloned()
        .unwrap();

        let version_id = org.create("ContentVersion", &record).await.unwrap();
        let version = org.record("ContentVersion", &version_id).unwrap();
        let document_id = version.path_str("ContentDocumentId").unwrap().to_string();

        let links = org.records("ContentDocumentLink");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].path_str("LinkedEntityId"), Some("00T1"));
        assert_eq!(
            org.download("ContentVersion", &version_id, "VersionData")
                .await
                .unwrap(),
            b"hello".to_vec()
        );

        let duplicate = json!({ "ContentDocumentId": document_id, "LinkedEntityId": "00T1" })
            .as_object()
            .cloned()
            .unwrap();
        let results = org
            .insert_batch("ContentDocumentLink", &[duplicate])
            .await
            .unwrap();
        assert!(!results[0].success);
        assert_eq!(results[0].errors[0].status_code, "DUPLICATE_VALUE");
    }

    #[tokio::test]
    async fn test_reject_when_limited_times() {
        let org = MemoryOrg::new();
        org.reject_when("Task", "Subject", "flaky", "row locked", Some(1));
        let record = json!({ "Subject": "flaky" }).as_object().cloned().unwrap();

        let first = org.insert_batch("Task", &[record.clone()]).await.unwrap();
        let second = org.insert_batch("Task", &[record]).await.unwrap();
        assert!(!first[0].success);
        assert!(second[0].success);
    }

    #[tokio::test]
    async fn test_update_batch_merges_fields() {
        let org = MemoryOrg::new();
        let id = org.seed("Contact", json!({ "Phone": "555-1234", "Email": "a@b.com" }));
        let update = json!({ "Id": id, "Phone": "0000000000" }).as_object().cloned().unwrap();
        let results = org.update_batch("Contact", &[update]).await.unwrap();
        assert!(results[0].success);

        let stored = org.record("Contact", &id).unwrap();
        assert_eq!(stored.path_str("Phone"), Some("0000000000"));
        assert_eq!(stored.path_str("Email"), Some("a@b.com"));
    }
}
