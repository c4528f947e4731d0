//! Bulk migration of files attached to eligible parent records.
//!
//! Runs in three steps, each leaving a CSV the next one reads:
//!
//! 1. [`export_links`] maps every link of an eligible parent (and every user
//!    share of the same documents) to its target entity.
//! 2. [`migrate_content`] uploads each linked document once and recreates
//!    its links, using a bounded pool of concurrent workers.
//! 3. [`migrate_distributions`] recreates public distributions against the
//!    new versions.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream;
use orgbridge_api::{OrgApi, Query, Filter, Record, RecordExt, USER_KEY_PREFIX, key_prefix};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::audit::{read_columns, write_rows};
use crate::context::MigrationContext;
use crate::identity::{IdMapping, dedup_ids};
use crate::migrator::StageReport;
use crate::outcome::{OutcomeRecord, OutcomeSink};
use crate::resource_cache::{
    LINK_KIND, LinkRequest, ResourceMigrationRecord, ensure_links, normalize_share_type,
};
use crate::retry::RetryExecutor;
use crate::stages::files::{
    DOCUMENT_KIND, DOCUMENT_NOT_MIGRATED, latest_versions, too_large, upload_version, version_size,
};
use crate::stages::{fetch_where_in, write_report};
use crate::Result;

pub const LINK_MAPPING_FILE: &str = "contentdocumentlink_mapping.csv";
pub const LINK_UNMATCHED_FILE: &str = "contentdocumentlink_unmatched.csv";
pub const VERSION_MAPPING_FILE: &str = "contentversion_migration_mapping.csv";
pub const DISTRIBUTION_MAPPING_FILE: &str = "contentdistribution_migration_mapping.csv";

pub const DISTRIBUTION: &str = "ContentDistribution";

const LINK_MAPPING_HEADERS: [&str; 7] = [
    "Source_ContentDocumentLink_Id",
    "ContentDocumentId",
    "Source_Parent_Id",
    "Target_Parent_Id",
    "Parent_Object",
    "ShareType",
    "Visibility",
];

const VERSION_MAPPING_HEADERS: [&str; 5] = [
    "Old_ContentVersionId",
    "Old_ContentDocumentId",
    "New_ContentVersionId",
    "New_ContentDocumentId",
    "Target_Parent_Id",
];

const DISTRIBUTION_MAPPING_HEADERS: [&str; 4] = [
    "Old_ContentDistributionId",
    "Old_ContentDocumentId",
    "New_ContentDistributionId",
    "New_ContentDocumentId",
];

const LINK_FIELDS: &[&str] = &[
    "Id",
    "ContentDocumentId",
    "LinkedEntityId",
    "ShareType",
    "Visibility",
];

const DISTRIBUTION_PREFERENCES: &[&str] = &[
    "PreferencesAllowPDFDownload",
    "PreferencesAllowOriginalDownload",
    "PreferencesPasswordRequired",
    "PreferencesNotifyOnVisit",
    "PreferencesLinkLatestVersion",
    "PreferencesAllowViewInBrowser",
    "PreferencesExpires",
    "PreferencesNotifyRndtnComplete",
    "ExpiryDate",
];

// ===== Export =====

/// Row counts of a link export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkExport {
    pub matched: usize,
    pub unmatched: usize,
}

/// Write the link mapping for every object with an eligibility condition.
///
/// Links whose entity has no target equivalent go to the unmatched file with
/// a blank target.
#[tracing::instrument(skip_all)]
pub async fn export_links(ctx: &mut MigrationContext) -> Result<LinkExport> {
    let objects: Vec<String> = ctx.config.eligibility.keys().cloned().collect();
    let mut matched: Vec<[String; 7]> = Vec::new();
    let mut unmatched: Vec<[String; 7]> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for object in &objects {
        let parents = ctx.eligibility().eligible_parents(object).await?;
        if parents.is_empty() {
            info!(object = %object, "no eligible parents");
            continue;
        }
        let parent_set: HashSet<&str> = parents.iter().map(String::as_str).collect();

        let roots =
            fetch_where_in(ctx, LINK_KIND, LINK_FIELDS, "LinkedEntityId", &parents, None).await?;
        let documents = dedup_ids(roots.iter().filter_map(|l| l.path_str("ContentDocumentId")));
        let links =
            fetch_where_in(ctx, LINK_KIND, LINK_FIELDS, "ContentDocumentId", &documents, None)
                .await?;

        let mut parent_links = Vec::new();
        let mut user_links = Vec::new();
        for link in &links {
            let entity = link.path_str("LinkedEntityId").unwrap_or_default();
            if parent_set.contains(entity) {
                parent_links.push(link);
            } else if key_prefix(entity) == Some(USER_KEY_PREFIX) {
                user_links.push(link);
            }
        }
        info!(
            object = %object,
            parents = parent_links.len(),
            users = user_links.len(),
            "links selected"
        );

        let parent_map = ctx
            .resolver()
            .resolve(object, parent_links.iter().filter_map(|l| l.path_str("LinkedEntityId")))
            .await?;
        let user_map = ctx
            .resolver()
            .resolve("User", user_links.iter().filter_map(|l| l.path_str("LinkedEntityId")))
            .await?;

        let labelled = parent_links
            .into_iter()
            .map(|l| (l, object.as_str(), &parent_map))
            .chain(user_links.into_iter().map(|l| (l, "User", &user_map)));
        for (link, parent_object, mapping) in labelled {
            let Some(id) = link.id() else { continue };
            if !seen.insert(id.to_string()) {
                continue;
            }
            let entity = link.path_str("LinkedEntityId").unwrap_or_default();
            let target = mapping.get(entity).cloned();
            let row = [
                id.to_string(),
                link.path_str("ContentDocumentId").unwrap_or_default().to_string(),
                entity.to_string(),
                target.clone().unwrap_or_default(),
                parent_object.to_string(),
                normalize_share_type(link.path_str("ShareType")),
                link.path_str("Visibility").unwrap_or_default().to_string(),
            ];
            match target {
                Some(_) => matched.push(row),
                None => unmatched.push(row),
            }
        }
    }

    let export = LinkExport {
        matched: write_rows(&ctx.output_path(LINK_MAPPING_FILE), &LINK_MAPPING_HEADERS, matched)?,
        unmatched: write_rows(
            &ctx.output_path(LINK_UNMATCHED_FILE),
            &LINK_MAPPING_HEADERS,
            unmatched,
        )?,
    };
    info!(matched = export.matched, unmatched = export.unmatched, "link mapping exported");
    Ok(export)
}

// ===== Upload =====

#[derive(Debug, Clone)]
struct LinkRow {
    link_id: String,
    target_parent: String,
    share_type: String,
    visibility: String,
}

/// One document and the links to recreate for it.
#[derive(Debug)]
struct DocumentJob {
    document_id: String,
    known: Option<ResourceMigrationRecord>,
    version: Option<Record>,
    links: Vec<LinkRow>,
}

/// Read-only state shared by the upload workers.
struct Uploader {
    source: Arc<dyn OrgApi>,
    target: Arc<dyn OrgApi>,
    retry: RetryExecutor,
    legacy_field: String,
    max_upload_bytes: u64,
    batch_size: usize,
    chunk_size: usize,
}

impl Uploader {
    /// Upload (unless already migrated) and link one document.
    ///
    /// Returns the migration record and the publish location when the
    /// document exists on the target afterwards.
    async fn run(&self, job: DocumentJob, sink: &OutcomeSink) -> Option<(ResourceMigrationRecord, String)> {
        let document = job.document_id.as_str();
        let publish_location = job.links.first().map(|l| l.target_parent.clone()).unwrap_or_default();

        let record = match (job.known, job.version.as_ref()) {
            (Some(record), _) => {
                debug!(document, "document already on target");
                record
            }
            (None, None) => {
                sink.push(OutcomeRecord::failed(DOCUMENT_KIND, document, "No latest version found"));
                for link in &job.links {
                    sink.push(OutcomeRecord::failed(LINK_KIND, &link.link_id, DOCUMENT_NOT_MIGRATED));
                }
                return None;
            }
            (None, Some(version)) => {
                let size = version_size(version);
                if size > self.max_upload_bytes {
                    sink.push(OutcomeRecord::ineligible(
                        DOCUMENT_KIND,
                        document,
                        too_large(size, self.max_upload_bytes),
                    ));
                    for link in &job.links {
                        sink.push(OutcomeRecord::ineligible(
                            LINK_KIND,
                            &link.link_id,
                            DOCUMENT_NOT_MIGRATED,
                        ));
                    }
                    return None;
                }
                let uploaded = upload_version(
                    self.source.as_ref(),
                    self.target.as_ref(),
                    &self.retry,
                    &self.legacy_field,
                    version,
                    Some(publish_location.as_str()).filter(|p| !p.is_empty()),
                )
                .await;
                match uploaded {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(document, error = %e, "document upload failed");
                        sink.push(OutcomeRecord::failed(DOCUMENT_KIND, document, e.to_string()));
                        for link in &job.links {
                            sink.push(OutcomeRecord::failed(
                                LINK_KIND,
                                &link.link_id,
                                DOCUMENT_NOT_MIGRATED,
                            ));
                        }
                        return None;
                    }
                }
            }
        };
        sink.push(OutcomeRecord::success(DOCUMENT_KIND, document, &record.target_document_id));

        let requests: Vec<LinkRequest> = job
            .links
            .iter()
            .map(|l| {
                LinkRequest::new(
                    &l.link_id,
                    &record.target_document_id,
                    &l.target_parent,
                    Some(l.share_type.as_str()),
                    Some(l.visibility.as_str()),
                )
            })
            .collect();
        match ensure_links(
            self.target.as_ref(),
            &self.retry,
            &requests,
            self.batch_size,
            self.chunk_size,
        )
        .await
        {
            Ok(log) => log.into_iter().for_each(|r| sink.push(r)),
            Err(e) => {
                for request in &requests {
                    sink.push(OutcomeRecord::failed(LINK_KIND, &request.source_key, e.to_string()));
                }
            }
        }
        Some((record, publish_location))
    }
}

/// Upload the documents of the link mapping and recreate their links.
///
/// Documents are processed by `content.workers` concurrent workers. The
/// report mapping is source document id to target document id.
#[tracing::instrument(skip_all, fields(workers = ctx.config.content.workers))]
pub async fn migrate_content(ctx: &mut MigrationContext) -> Result<StageReport> {
    let rows = read_columns(
        &ctx.output_path(LINK_MAPPING_FILE),
        &[
            "Source_ContentDocumentLink_Id",
            "ContentDocumentId",
            "Target_Parent_Id",
            "ShareType",
            "Visibility",
        ],
    )?;

    let mut by_document: BTreeMap<String, Vec<LinkRow>> = BTreeMap::new();
    for row in rows {
        let [link_id, document, target_parent, share_type, visibility] =
            <[String; 5]>::try_from(row).unwrap_or_default();
        if document.is_empty() || target_parent.is_empty() {
            continue;
        }
        by_document.entry(document).or_default().push(LinkRow {
            link_id,
            target_parent,
            share_type,
            visibility,
        });
    }
    let documents: Vec<String> = by_document.keys().cloned().collect();
    info!(documents = documents.len(), "documents to migrate");

    let mut known = ctx.resolver().resolve_content_documents(&documents).await?;
    let pending: Vec<String> = documents
        .iter()
        .filter(|d| !known.contains_key(*d))
        .cloned()
        .collect();
    let mut versions = latest_versions(ctx, &pending).await?;

    let jobs: Vec<DocumentJob> = by_document
        .into_iter()
        .map(|(document_id, links)| DocumentJob {
            known: known.remove(&document_id),
            version: versions.remove(&document_id),
            document_id,
            links,
        })
        .collect();

    let uploader = Uploader {
        source: Arc::clone(&ctx.source),
        target: Arc::clone(&ctx.target),
        retry: ctx.retry.clone(),
        legacy_field: ctx.config.legacy_id_field.clone(),
        max_upload_bytes: ctx.config.content.max_upload_bytes,
        batch_size: ctx.config.batch_size,
        chunk_size: ctx.config.query_chunk_size,
    };
    let sink = OutcomeSink::new();
    let migrated: Vec<(ResourceMigrationRecord, String)> = stream::iter(jobs)
        .map(|job| uploader.run(job, &sink))
        .buffer_unordered(ctx.config.content.workers)
        .filter_map(|done| async move { done })
        .collect()
        .await;

    let mut rows = Vec::with_capacity(migrated.len());
    for (record, target_parent) in migrated {
        rows.push([
            record.source_version_id.clone().unwrap_or_default(),
            record.source_document_id.clone(),
            record.target_version_id.clone(),
            record.target_document_id.clone(),
            target_parent,
        ]);
        ctx.resources.insert(record);
    }
    rows.sort();
    write_rows(&ctx.output_path(VERSION_MAPPING_FILE), &VERSION_MAPPING_HEADERS, rows)?;

    let outcomes = sink.drain();
    let mapping = outcomes
        .records()
        .iter()
        .filter(|r| r.kind == DOCUMENT_KIND)
        .filter_map(|r| r.target_id().map(|t| (r.source_id.clone(), t.to_string())))
        .collect();
    let report = StageReport {
        object: "ContentVersion".to_string(),
        outcomes,
        mapping,
    };
    info!(summary = %report.summary(), "content migrated");
    write_report(ctx, &report)?;
    Ok(report)
}

// ===== Distributions =====

/// Recreate public distributions of migrated documents against their new
/// versions, reading the version mapping written by [`migrate_content`].
#[tracing::instrument(skip_all)]
pub async fn migrate_distributions(ctx: &mut MigrationContext) -> Result<StageReport> {
    let mut report = StageReport::empty(DISTRIBUTION);
    let rows = read_columns(
        &ctx.output_path(VERSION_MAPPING_FILE),
        &["Old_ContentDocumentId", "New_ContentVersionId", "New_ContentDocumentId"],
    )?;
    let versions: HashMap<String, (String, String)> = rows
        .into_iter()
        .filter_map(|row| {
            let [old_doc, new_version, new_doc] = <[String; 3]>::try_from(row).ok()?;
            (!old_doc.is_empty() && !new_version.is_empty())
                .then_some((old_doc, (new_version, new_doc)))
        })
        .collect();
    if versions.is_empty() {
        return Ok(report);
    }

    let mut fields = vec!["Id", "Name", "ContentVersionId", "ContentDocumentId", "RelatedRecordId"];
    fields.extend_from_slice(DISTRIBUTION_PREFERENCES);
    let distributions =
        fetch_where_in(ctx, DISTRIBUTION, &fields, "ContentDocumentId", versions.keys(), None)
            .await?;
    info!(count = distributions.len(), "distributions selected");

    let existing = existing_distributions(ctx, versions.values().map(|(v, _)| v)).await?;
    let related = related_records(ctx, &distributions).await?;

    let mut table = Vec::new();
    for distribution in &distributions {
        let (Some(id), Some(document)) =
            (distribution.id(), distribution.path_str("ContentDocumentId"))
        else {
            continue;
        };
        let Some((new_version, new_document)) = versions.get(document) else {
            continue;
        };
        let name = distribution.path_str("Name").unwrap_or_default();

        let created = match existing.get(&(new_version.clone(), name.to_string())) {
            Some(target_id) => Ok(target_id.clone()),
            None => {
                let mut payload = Record::new();
                payload.insert("Name".into(), Value::String(name.to_string()));
                payload.insert("ContentVersionId".into(), Value::String(new_version.clone()));
                for field in DISTRIBUTION_PREFERENCES {
                    if let Some(value) = distribution.path(field) {
                        payload.insert(field.to_string(), value.clone());
                    }
                }
                if let Some(target) =
                    distribution.path_str("RelatedRecordId").and_then(|r| related.get(r))
                {
                    payload.insert("RelatedRecordId".into(), Value::String(target.clone()));
                }
                let target = ctx.target.as_ref();
                ctx.retry
                    .execute("create distribution", || target.create(DISTRIBUTION, &payload))
                    .await
                    .into_result("create distribution")
            }
        };
        match created {
            Ok(target_id) => {
                table.push([
                    id.to_string(),
                    document.to_string(),
                    target_id.clone(),
                    new_document.clone(),
                ]);
                report.outcomes.push(OutcomeRecord::success(DISTRIBUTION, id, target_id));
            }
            Err(e) => report.outcomes.push(OutcomeRecord::failed(DISTRIBUTION, id, e.to_string())),
        }
    }

    write_rows(
        &ctx.output_path(DISTRIBUTION_MAPPING_FILE),
        &DISTRIBUTION_MAPPING_HEADERS,
        table,
    )?;
    report.mapping = report.outcomes.successes();
    info!(summary = %report.summary(), "distributions migrated");
    write_report(ctx, &report)?;
    Ok(report)
}

/// (target version, name) to target distribution id.
async fn existing_distributions<'a, I>(
    ctx: &MigrationContext,
    target_versions: I,
) -> Result<HashMap<(String, String), String>>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut existing = HashMap::new();
    for chunk in crate::batch::chunked(dedup_ids(target_versions), ctx.config.query_chunk_size) {
        let query = Query::select(DISTRIBUTION, ["Id", "ContentVersionId", "Name"])
            .filter(Filter::is_in("ContentVersionId", chunk));
        let records = ctx
            .retry
            .execute("fetch target distributions", || ctx.target.query(&query))
            .await
            .into_result("fetch target distributions")?;
        for record in &records {
            if let (Some(id), Some(version), Some(name)) =
                (record.id(), record.path_str("ContentVersionId"), record.path_str("Name"))
            {
                existing.insert((version.to_string(), name.to_string()), id.to_string());
            }
        }
    }
    Ok(existing)
}

/// Target ids of the records distributions point at, resolved per concrete
/// type among the eligibility objects.
async fn related_records(
    ctx: &mut MigrationContext,
    distributions: &[Record],
) -> Result<IdMapping> {
    let ids = dedup_ids(distributions.iter().filter_map(|d| d.path_str("RelatedRecordId")));
    if ids.is_empty() {
        return Ok(IdMapping::new());
    }
    let candidates: Vec<String> = ctx.config.eligibility.keys().cloned().collect();
    let types = ctx.resolver().object_types(&ids, &candidates).await?;
    let mut by_type: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (id, object) in types {
        by_type.entry(object).or_default().push(id);
    }
    ctx.resolver().resolve_grouped(&by_type).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::read_rows;
    use crate::{MigrationConfig, Status};
    use orgbridge_api::MemoryOrg;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const ACTIVE: &str = "IsActive__c = true";

    struct Fixture {
        dir: tempfile::TempDir,
        source: Arc<MemoryOrg>,
        target: Arc<MemoryOrg>,
    }

    impl Fixture {
        fn new() -> Self {
            let source = Arc::new(MemoryOrg::new());
            source.register_condition("Account", ACTIVE, |r| {
                r.path("IsActive__c") == Some(&json!(true))
            });
            Self {
                dir: tempfile::tempdir().unwrap(),
                source,
                target: Arc::new(MemoryOrg::new()),
            }
        }

        fn context(&self) -> MigrationContext {
            let mut config = MigrationConfig {
                output_dir: self.dir.path().to_path_buf(),
                ..MigrationConfig::default()
            };
            config.eligibility.insert("Account".to_string(), ACTIVE.to_string());
            config.content.workers = 2;
            MigrationContext::new(
                Arc::clone(&self.source) as Arc<dyn OrgApi>,
                Arc::clone(&self.target) as Arc<dyn OrgApi>,
                config,
            )
        }

        fn document(&self, bytes: &[u8], entities: &[&str]) -> String {
            let document = self.source.seed("ContentDocument", json!({}));
            let version = self.source.seed(
                "ContentVersion",
                json!({
                    "ContentDocumentId": document,
                    "IsLatest": true,
                    "Title": "brochure",
                    "PathOnClient": "brochure.pdf",
                    "ContentSize": bytes.len(),
                }),
            );
            self.source.seed_blob("ContentVersion", &version, bytes.to_vec());
            for entity in entities {
                self.source.seed(
                    LINK_KIND,
                    json!({ "ContentDocumentId": document, "LinkedEntityId": entity, "ShareType": "I" }),
                );
            }
            document
        }
    }

    #[tokio::test]
    async fn test_export_splits_matched_and_unmatched() {
        let fx = Fixture::new();
        let mapped = fx.source.seed("Account", json!({ "IsActive__c": true }));
        let unmapped = fx.source.seed("Account", json!({ "IsActive__c": true }));
        let inactive = fx.source.seed("Account", json!({ "IsActive__c": false }));
        let user = fx.source.seed("User", json!({}));
        fx.document(b"a", &[&mapped, &user]);
        fx.document(b"b", &[&unmapped]);
        fx.document(b"c", &[&inactive]);
        fx.target.seed("Account", json!({ "Id": "001T1", "Legacy_Id__c": mapped }));
        fx.target.seed("User", json!({ "Id": "005T1", "Legacy_Id__c": user }));

        let mut ctx = fx.context();
        let export = export_links(&mut ctx).await.unwrap();
        assert_eq!(export, LinkExport { matched: 2, unmatched: 1 });

        let rows = read_rows(&ctx.output_path(LINK_MAPPING_FILE)).unwrap();
        let user_row = rows.iter().find(|r| r["Parent_Object"] == "User").unwrap();
        assert_eq!(user_row["Target_Parent_Id"], "005T1");
        assert_eq!(user_row["ShareType"], "V");

        let missing = read_rows(&ctx.output_path(LINK_UNMATCHED_FILE)).unwrap();
        assert_eq!(missing[0]["Source_Parent_Id"], unmapped);
        assert_eq!(missing[0]["Target_Parent_Id"], "");
    }

    #[tokio::test]
    async fn test_migrate_uploads_links_and_distributes() {
        let fx = Fixture::new();
        let first = fx.source.seed("Account", json!({ "IsActive__c": true }));
        let second = fx.source.seed("Account", json!({ "IsActive__c": true }));
        let shared = fx.document(b"shared", &[&first, &second]);
        let single = fx.document(b"single", &[&second]);
        fx.source.seed(
            DISTRIBUTION,
            json!({
                "Name": "public brochure",
                "ContentDocumentId": shared,
                "RelatedRecordId": first,
                "PreferencesAllowViewInBrowser": true,
            }),
        );
        fx.target.seed("Account", json!({ "Id": "001T1", "Legacy_Id__c": first }));
        fx.target.seed("Account", json!({ "Id": "001T2", "Legacy_Id__c": second }));

        let mut ctx = fx.context();
        export_links(&mut ctx).await.unwrap();
        let report = migrate_content(&mut ctx).await.unwrap();

        assert_eq!(fx.target.records("ContentVersion").len(), 2);
        assert_eq!(fx.target.records(LINK_KIND).len(), 3);
        assert_eq!(report.mapping.len(), 2);
        assert!(report.mapping.contains_key(&single));
        assert!(ctx.resources.contains(&shared));
        assert_eq!(
            report.outcomes.records().iter().filter(|r| r.kind == LINK_KIND).count(),
            3
        );

        let versions = read_rows(&ctx.output_path(VERSION_MAPPING_FILE)).unwrap();
        assert_eq!(versions.len(), 2);

        let distributions = migrate_distributions(&mut ctx).await.unwrap();
        assert_eq!(distributions.summary().success, 1);
        let created = &fx.target.records(DISTRIBUTION)[0];
        assert_eq!(created["RelatedRecordId"], json!("001T1"));
        assert_eq!(created["PreferencesAllowViewInBrowser"], json!(true));

        // a second pass reuses everything
        let mut again = fx.context();
        let rerun = migrate_content(&mut again).await.unwrap();
        assert_eq!(rerun.summary().failed, 0);
        assert_eq!(fx.target.records("ContentVersion").len(), 2);
        assert_eq!(fx.target.records(LINK_KIND).len(), 3);
        migrate_distributions(&mut again).await.unwrap();
        assert_eq!(fx.target.records(DISTRIBUTION).len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_versions_are_skipped() {
        let fx = Fixture::new();
        let account = fx.source.seed("Account", json!({ "IsActive__c": true }));
        let document = fx.document(b"far too large", &[&account]);
        fx.target.seed("Account", json!({ "Id": "001T1", "Legacy_Id__c": account }));

        let mut ctx = fx.context();
        ctx.config.content.max_upload_bytes = 4;
        export_links(&mut ctx).await.unwrap();
        let report = migrate_content(&mut ctx).await.unwrap();

        assert_eq!(report.outcomes.find(&document).unwrap().status(), Status::Skipped);
        let link = fx.source.records(LINK_KIND)[0].id().unwrap().to_string();
        let link_outcome = report.outcomes.find(&link).unwrap();
        assert_eq!(link_outcome.status(), Status::Skipped);
        assert_eq!(link_outcome.detail(), DOCUMENT_NOT_MIGRATED);
        assert!(fx.target.records("ContentVersion").is_empty());
    }

    #[tokio::test]
    async fn test_document_without_version_fails_its_links() {
        let fx = Fixture::new();
        let account = fx.source.seed("Account", json!({ "IsActive__c": true }));
        let document = fx.source.seed("ContentDocument", json!({}));
        let link = fx.source.seed(
            LINK_KIND,
            json!({ "ContentDocumentId": document, "LinkedEntityId": account, "ShareType": "V" }),
        );
        fx.target.seed("Account", json!({ "Id": "001T1", "Legacy_Id__c": account }));

        let mut ctx = fx.context();
        export_links(&mut ctx).await.unwrap();
        let report = migrate_content(&mut ctx).await.unwrap();

        assert_eq!(report.outcomes.find(&document).unwrap().status(), Status::Failed);
        let link_outcome = report.outcomes.find(&link).unwrap();
        assert_eq!(link_outcome.status(), Status::Failed);
        assert_eq!(link_outcome.detail(), DOCUMENT_NOT_MIGRATED);
        assert!(fx.target.records(LINK_KIND).is_empty());
    }

    #[tokio::test]
    async fn test_missing_link_mapping_is_error() {
        let fx = Fixture::new();
        let mut ctx = fx.context();
        assert!(migrate_content(&mut ctx).await.is_err());
    }
}
