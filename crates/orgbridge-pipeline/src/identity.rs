//! Cross-org identity resolution through the legacy-id field.
//!
//! Every migrated record carries its source id in a legacy-id field on the
//! target org. Resolving a set of source ids means querying the target org
//! for records whose legacy id is in the set, chunked to respect the query
//! size limit, and remembering the answer for the rest of the run.

use std::collections::{BTreeMap, HashMap, HashSet};

use orgbridge_api::{Filter, GROUP_KEY_PREFIX, OrgApi, Query, RecordExt, key_prefix};
use tracing::{debug, info, warn};

use crate::batch::chunked;
use crate::resource_cache::{DeduplicatingResourceCache, ResourceMigrationRecord};
use crate::retry::RetryExecutor;
use crate::{MigrateError, Result};

/// Source id to target id.
pub type IdMapping = HashMap<String, String>;

/// Deduplicate ids preserving first-seen order, dropping blanks.
pub fn dedup_ids<I, S>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for id in ids {
        let id = id.as_ref().trim();
        if !id.is_empty() && seen.insert(id.to_string()) {
            unique.push(id.to_string());
        }
    }
    unique
}

/// Per-run memo of (object, source id) lookups.
///
/// A key is either resolved to exactly one target id or known to be absent.
/// Built fresh each run; never persisted.
#[derive(Debug, Default)]
pub struct LegacyIdentityMap {
    entries: HashMap<String, HashMap<String, Option<String>>>,
}

impl LegacyIdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Target id for a source id, if resolved.
    pub fn get(&self, object: &str, source_id: &str) -> Option<&str> {
        self.entries
            .get(object)
            .and_then(|m| m.get(source_id))
            .and_then(|t| t.as_deref())
    }

    /// Whether the id has been looked up before (hit or miss).
    pub fn is_known(&self, object: &str, source_id: &str) -> bool {
        self.entries
            .get(object)
            .is_some_and(|m| m.contains_key(source_id))
    }

    /// Record a resolved pair. A second, different target id for the same
    /// key is an identity conflict.
    pub fn record(&mut self, object: &str, source_id: &str, target_id: &str) -> Result<()> {
        let entries = self.entries.entry(object.to_string()).or_default();
        match entries.get(source_id) {
            Some(Some(existing)) if existing != target_id => Err(MigrateError::IdentityConflict {
                object: object.to_string(),
                legacy_id: source_id.to_string(),
                first: existing.clone(),
                second: target_id.to_string(),
            }),
            _ => {
                entries.insert(source_id.to_string(), Some(target_id.to_string()));
                Ok(())
            }
        }
    }

    /// Remember that an id has no target record.
    pub fn mark_missing(&mut self, object: &str, source_id: &str) {
        self.entries
            .entry(object.to_string())
            .or_default()
            .entry(source_id.to_string())
            .or_insert(None);
    }

    /// Number of resolved pairs across all objects.
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .map(|m| m.values().filter(|t| t.is_some()).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mapping_for(&self, object: &str, ids: &[String]) -> IdMapping {
        ids.iter()
            .filter_map(|id| {
                self.get(object, id)
                    .map(|target| (id.clone(), target.to_string()))
            })
            .collect()
    }
}

/// Object type by id key prefix, learned from describe calls.
#[derive(Debug, Default)]
pub struct KeyPrefixIndex {
    by_prefix: HashMap<String, String>,
    described: HashSet<String>,
}

impl KeyPrefixIndex {
    /// The object an id belongs to, if its prefix is known.
    pub fn object_for(&self, id: &str) -> Option<&str> {
        key_prefix(id).and_then(|p| self.by_prefix.get(p).map(String::as_str))
    }

    pub fn insert(&mut self, prefix: &str, object: &str) {
        self.by_prefix.insert(prefix.to_string(), object.to_string());
        self.described.insert(object.to_string());
    }
}

/// Resolves source ids to target ids for one run.
///
/// Borrowed out of [`crate::MigrationContext::resolver`].
pub struct IdentityResolver<'a> {
    pub(crate) source: &'a dyn OrgApi,
    pub(crate) target: &'a dyn OrgApi,
    pub(crate) retry: &'a RetryExecutor,
    pub(crate) legacy_field: &'a str,
    pub(crate) chunk_size: usize,
    pub(crate) integration_user: Option<&'a str>,
    pub(crate) identities: &'a mut LegacyIdentityMap,
    pub(crate) key_prefixes: &'a mut KeyPrefixIndex,
    pub(crate) record_types: &'a mut HashMap<(String, String), Option<String>>,
    pub(crate) resources: &'a mut DeduplicatingResourceCache,
}

impl IdentityResolver<'_> {
    /// Resolve source ids of `object` to target ids.
    ///
    /// The result only contains ids from the input; ids without a target
    /// record are omitted.
    pub async fn resolve<I, S>(&mut self, object: &str, ids: I) -> Result<IdMapping>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids = dedup_ids(ids);
        let unknown: Vec<String> = ids
            .iter()
            .filter(|id| !self.identities.is_known(object, id))
            .cloned()
            .collect();

        let target = self.target;
        let retry = self.retry;
        let legacy_field = self.legacy_field;

        for chunk in chunked(unknown, self.chunk_size) {
            let query = Query::select(object, ["Id", legacy_field])
                .filter(Filter::is_in(legacy_field, chunk.iter().cloned()));
            let records = retry
                .execute(&format!("resolve {}", object), || target.query(&query))
                .await
                .into_result(&format!("resolve {}", object))?;

            for record in &records {
                if let (Some(legacy), Some(id)) = (record.path_str(legacy_field), record.id()) {
                    self.identities.record(object, legacy, id)?;
                }
            }
            for id in &chunk {
                self.identities.mark_missing(object, id);
            }
        }

        let mapping = self.identities.mapping_for(object, &ids);
        debug!(
            object,
            requested = ids.len(),
            resolved = mapping.len(),
            "resolved legacy ids"
        );
        Ok(mapping)
    }

    /// Resolve ids already grouped by their concrete object type.
    pub async fn resolve_grouped(
        &mut self,
        by_type: &BTreeMap<String, Vec<String>>,
    ) -> Result<IdMapping> {
        let mut mapping = IdMapping::new();
        for (object, ids) in by_type {
            mapping.extend(self.resolve(object, ids).await?);
        }
        Ok(mapping)
    }

    /// Resolve owner or creator ids.
    ///
    /// Queue ids match the target queue with the same developer name; user
    /// ids resolve through the user legacy id. Anything left unresolved falls
    /// back to the integration user when one is configured.
    pub async fn resolve_owners<I, S>(&mut self, ids: I) -> Result<IdMapping>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids = dedup_ids(ids);
        let (queues, users): (Vec<String>, Vec<String>) = ids
            .iter()
            .cloned()
            .partition(|id| key_prefix(id) == Some(GROUP_KEY_PREFIX));

        let mut mapping = self.resolve("User", &users).await?;
        mapping.extend(self.resolve_queues(&queues).await?);

        if let Some(fallback) = self.integration_user {
            let mut defaulted = 0usize;
            for id in &ids {
                if !mapping.contains_key(id) {
                    mapping.insert(id.clone(), fallback.to_string());
                    defaulted += 1;
                }
            }
            if defaulted > 0 {
                info!(count = defaulted, "owners defaulted to integration user");
            }
        }
        Ok(mapping)
    }

    async fn resolve_queues(&mut self, queue_ids: &[String]) -> Result<IdMapping> {
        let unknown: Vec<String> = queue_ids
            .iter()
            .filter(|id| !self.identities.is_known("Group", id))
            .cloned()
            .collect();

        let source = self.source;
        let target = self.target;
        let retry = self.retry;

        for chunk in chunked(unknown, self.chunk_size) {
            let query = Query::select("Group", ["Id", "DeveloperName"])
                .filter(Filter::is_in("Id", chunk.iter().cloned()));
            let source_queues = retry
                .execute("fetch source queues", || source.query(&query))
                .await
                .into_result("fetch source queues")?;

            let mut by_name: HashMap<String, String> = HashMap::new();
            for queue in &source_queues {
                if let (Some(id), Some(name)) = (queue.id(), queue.path_str("DeveloperName")) {
                    by_name.insert(name.to_string(), id.to_string());
                }
            }

            if !by_name.is_empty() {
                let query = Query::select("Group", ["Id", "DeveloperName"])
                    .filter(Filter::eq("Type", "Queue"))
                    .filter(Filter::is_in("DeveloperName", by_name.keys().cloned()));
                let target_queues = retry
                    .execute("fetch target queues", || target.query(&query))
                    .await
                    .into_result("fetch target queues")?;

                for queue in &target_queues {
                    let (Some(target_id), Some(name)) = (queue.id(), queue.path_str("DeveloperName"))
                    else {
                        continue;
                    };
                    if let Some(source_id) = by_name.get(name) {
                        self.identities.record("Group", source_id, target_id)?;
                    }
                }
            }

            for id in &chunk {
                self.identities.mark_missing("Group", id);
            }
        }

        Ok(self.identities.mapping_for("Group", queue_ids))
    }

    /// Determine the object type of ids by key prefix, describing the
    /// candidate objects on the source org as needed.
    pub async fn object_types(
        &mut self,
        ids: &[String],
        candidates: &[String],
    ) -> Result<HashMap<String, String>> {
        let source = self.source;
        let retry = self.retry;
        for object in candidates {
            if self.key_prefixes.described.contains(object) {
                continue;
            }
            let describe = retry
                .execute(&format!("describe {}", object), || source.describe(object))
                .await
                .into_result(&format!("describe {}", object))?;
            match describe.key_prefix.as_deref() {
                Some(prefix) => self.key_prefixes.insert(prefix, object),
                None => {
                    warn!(object = %object, "object has no key prefix");
                    self.key_prefixes.described.insert(object.clone());
                }
            }
        }

        Ok(ids
            .iter()
            .filter_map(|id| {
                self.key_prefixes
                    .object_for(id)
                    .map(|object| (id.clone(), object.to_string()))
            })
            .collect())
    }

    /// Target record type id for a developer name, looked up once per run.
    pub async fn resolve_record_type(
        &mut self,
        object: &str,
        developer_name: &str,
    ) -> Result<Option<String>> {
        let key = (object.to_string(), developer_name.to_string());
        if let Some(cached) = self.record_types.get(&key) {
            return Ok(cached.clone());
        }

        let target = self.target;
        let query = Query::select("RecordType", ["Id"])
            .filter(Filter::eq("SobjectType", object))
            .filter(Filter::eq("DeveloperName", developer_name))
            .limit(1);
        let records = self
            .retry
            .execute("resolve record type", || target.query(&query))
            .await
            .into_result("resolve record type")?;

        let id = records.first().and_then(|r| r.id()).map(str::to_string);
        if id.is_none() {
            warn!(object, developer_name, "record type not found on target org");
        }
        self.record_types.insert(key, id.clone());
        Ok(id)
    }

    /// Map source content document ids to their migrated target documents.
    ///
    /// Uses the resource cache first. Otherwise finds the latest source
    /// version of each document, resolves that version through its legacy
    /// id, and reads the target document id; hits are added to the cache.
    pub async fn resolve_content_documents(
        &mut self,
        document_ids: &[String],
    ) -> Result<HashMap<String, ResourceMigrationRecord>> {
        let document_ids = dedup_ids(document_ids);
        let mut found: HashMap<String, ResourceMigrationRecord> = HashMap::new();
        let mut missing = Vec::new();
        for id in &document_ids {
            match self.resources.get(id) {
                Some(record) => {
                    found.insert(id.clone(), record.clone());
                }
                None => missing.push(id.clone()),
            }
        }
        if missing.is_empty() {
            return Ok(found);
        }

        let source = self.source;
        let target = self.target;
        let retry = self.retry;

        // source document -> latest source version
        let mut latest: HashMap<String, String> = HashMap::new();
        for chunk in chunked(missing, self.chunk_size) {
            let query = Query::select("ContentVersion", ["Id", "ContentDocumentId"])
                .filter(Filter::is_in("ContentDocumentId", chunk))
                .filter(Filter::eq("IsLatest", true));
            let versions = retry
                .execute("fetch latest versions", || source.query(&query))
                .await
                .into_result("fetch latest versions")?;
            for version in &versions {
                if let (Some(id), Some(doc)) = (version.id(), version.path_str("ContentDocumentId")) {
                    latest.insert(doc.to_string(), id.to_string());
                }
            }
        }

        let version_map = self.resolve("ContentVersion", latest.values()).await?;
        if version_map.is_empty() {
            return Ok(found);
        }

        // target version -> target document
        let mut target_documents: HashMap<String, String> = HashMap::new();
        for chunk in chunked(version_map.values().cloned(), self.chunk_size) {
            let query = Query::select("ContentVersion", ["Id", "ContentDocumentId"])
                .filter(Filter::is_in("Id", chunk));
            let versions = retry
                .execute("fetch target versions", || target.query(&query))
                .await
                .into_result("fetch target versions")?;
            for version in &versions {
                if let (Some(id), Some(doc)) = (version.id(), version.path_str("ContentDocumentId")) {
                    target_documents.insert(id.to_string(), doc.to_string());
                }
            }
        }

        for (source_document, source_version) in latest {
            let Some(target_version) = version_map.get(&source_version) else {
                continue;
            };
            let Some(target_document) = target_documents.get(target_version) else {
                continue;
            };
            let record = ResourceMigrationRecord {
                source_document_id: source_document.clone(),
                source_version_id: Some(source_version),
                target_document_id: target_document.clone(),
                target_version_id: target_version.clone(),
            };
            self.resources.insert(record.clone());
            found.insert(source_document, record);
        }
        Ok(found)
    }
}
