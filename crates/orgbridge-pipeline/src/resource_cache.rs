//! Deduplicated migration of shared file content.
//!
//! One source document can be linked from many parents. The binary is
//! uploaded once per run; every further parent only gets a link record.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;

use orgbridge_api::{Filter, OrgApi, Query, Record, RecordExt};
use serde_json::Value;
use tracing::{debug, info};

use crate::batch::chunked;
use crate::outcome::{OutcomeLog, OutcomeRecord};
use crate::retry::RetryExecutor;
use crate::Result;

/// Tag used for link outcomes.
pub const LINK_KIND: &str = "ContentDocumentLink";

/// A document that has been migrated in this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMigrationRecord {
    pub source_document_id: String,
    pub source_version_id: Option<String>,
    pub target_document_id: String,
    pub target_version_id: String,
}

/// Source document id to migration record. Written only by the orchestrating
/// task; concurrent workers hand their results back instead.
#[derive(Debug, Default)]
pub struct DeduplicatingResourceCache {
    migrated: HashMap<String, ResourceMigrationRecord>,
}

impl DeduplicatingResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, source_document_id: &str) -> Option<&ResourceMigrationRecord> {
        self.migrated.get(source_document_id)
    }

    pub fn contains(&self, source_document_id: &str) -> bool {
        self.migrated.contains_key(source_document_id)
    }

    pub fn insert(&mut self, record: ResourceMigrationRecord) {
        self.migrated
            .insert(record.source_document_id.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.migrated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrated.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &ResourceMigrationRecord> {
        self.migrated.values()
    }

    /// Return the cached record or run `migrate` once to produce it.
    ///
    /// Failures are not cached, so a later call may try again.
    pub async fn get_or_migrate<F, Fut>(
        &mut self,
        source_document_id: &str,
        migrate: F,
    ) -> Result<ResourceMigrationRecord>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ResourceMigrationRecord>>,
    {
        if let Some(record) = self.migrated.get(source_document_id) {
            debug!(document = source_document_id, "document already migrated");
            return Ok(record.clone());
        }
        let record = migrate().await?;
        self.migrated
            .insert(source_document_id.to_string(), record.clone());
        Ok(record)
    }

    /// Split document ids into those already migrated and those still to do.
    pub fn partition<'a, I>(&self, ids: I) -> (Vec<&'a str>, Vec<&'a str>)
    where
        I: IntoIterator<Item = &'a str>,
    {
        ids.into_iter().partition(|id| self.contains(id))
    }
}

/// Map share types the target will not accept onto a valid one.
///
/// Inferred sharing (`I`) cannot be set explicitly and becomes viewer (`V`).
pub fn normalize_share_type(share_type: Option<&str>) -> String {
    match share_type.map(str::trim) {
        None | Some("") | Some("I") => "V".to_string(),
        Some(other) => other.to_string(),
    }
}

pub fn normalize_visibility(visibility: Option<&str>) -> String {
    match visibility.map(str::trim) {
        None | Some("") => "AllUsers".to_string(),
        Some(other) => other.to_string(),
    }
}

/// A link to create between a target document and a target record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRequest {
    /// Identifies the request in outcomes (source link id or a composite key).
    pub source_key: String,
    pub document_id: String,
    pub entity_id: String,
    pub share_type: String,
    pub visibility: String,
}

impl LinkRequest {
    pub fn new(
        source_key: impl Into<String>,
        document_id: impl Into<String>,
        entity_id: impl Into<String>,
        share_type: Option<&str>,
        visibility: Option<&str>,
    ) -> Self {
        Self {
            source_key: source_key.into(),
            document_id: document_id.into(),
            entity_id: entity_id.into(),
            share_type: normalize_share_type(share_type),
            visibility: normalize_visibility(visibility),
        }
    }

    fn pair(&self) -> (String, String) {
        (self.document_id.clone(), self.entity_id.clone())
    }

    fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert(
            "ContentDocumentId".into(),
            Value::String(self.document_id.clone()),
        );
        record.insert("LinkedEntityId".into(), Value::String(self.entity_id.clone()));
        record.insert("ShareType".into(), Value::String(self.share_type.clone()));
        record.insert("Visibility".into(), Value::String(self.visibility.clone()));
        record
    }
}

/// Create document links, skipping pairs that already exist on the target.
///
/// Duplicate pairs within `requests` are submitted once; every request still
/// gets an outcome. Existing links are reported as successes with the
/// existing link id, which makes re-runs idempotent.
pub async fn ensure_links(
    target: &dyn OrgApi,
    retry: &RetryExecutor,
    requests: &[LinkRequest],
    batch_size: usize,
    chunk_size: usize,
) -> Result<OutcomeLog> {
    let mut log = OutcomeLog::new();
    if requests.is_empty() {
        return Ok(log);
    }

    let documents: BTreeSet<&str> = requests.iter().map(|r| r.document_id.as_str()).collect();
    let mut existing: HashMap<(String, String), String> = HashMap::new();
    for chunk in chunked(documents, chunk_size) {
        let query = Query::select(LINK_KIND, ["Id", "ContentDocumentId", "LinkedEntityId"])
            .filter(Filter::is_in("ContentDocumentId", chunk));
        let links = retry
            .execute("fetch existing links", || target.query(&query))
            .await
            .into_result("fetch existing links")?;
        for link in &links {
            if let (Some(id), Some(doc), Some(entity)) = (
                link.id(),
                link.path_str("ContentDocumentId"),
                link.path_str("LinkedEntityId"),
            ) {
                existing.insert((doc.to_string(), entity.to_string()), id.to_string());
            }
        }
    }

    // unique pairs still to create, first request wins
    let mut to_create: BTreeMap<(String, String), &LinkRequest> = BTreeMap::new();
    for request in requests {
        if !existing.contains_key(&request.pair()) {
            to_create.entry(request.pair()).or_insert(request);
        }
    }

    let pairs: Vec<(String, String)> = to_create.keys().cloned().collect();
    let payload: Vec<Record> = to_create.values().map(|r| r.to_record()).collect();
    let results = retry
        .insert_with_resubmission(target, LINK_KIND, &payload, batch_size)
        .await;

    let mut created: HashMap<(String, String), std::result::Result<String, String>> =
        HashMap::new();
    for (pair, result) in pairs.into_iter().zip(results) {
        let value = match result.id {
            Some(id) if result.success => Ok(id),
            _ => Err(result.error_message()),
        };
        created.insert(pair, value);
    }

    for request in requests {
        let pair = request.pair();
        if let Some(id) = existing.get(&pair) {
            log.push(OutcomeRecord::success(LINK_KIND, &request.source_key, id));
            continue;
        }
        match created.get(&pair) {
            Some(Ok(id)) => log.push(OutcomeRecord::success(LINK_KIND, &request.source_key, id)),
            Some(Err(error)) => log.push(OutcomeRecord::failed(LINK_KIND, &request.source_key, error)),
            None => log.push(OutcomeRecord::failed(
                LINK_KIND,
                &request.source_key,
                "link was not submitted",
            )),
        }
    }

    info!(
        requested = requests.len(),
        existing = existing.len(),
        created = log.summary().success,
        "document links ensured"
    );
    Ok(log)
}
