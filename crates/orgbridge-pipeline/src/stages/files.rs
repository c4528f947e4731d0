//! Files shared on migrated activities.
//!
//! Collects the documents linked to the activities, uploads each document's
//! latest version once, then recreates every link whose entity has a target
//! equivalent: the activities themselves and users the file was shared with.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use orgbridge_api::{
    ApiError, Filter, OrgApi, Record, RecordExt, USER_KEY_PREFIX, key_prefix,
};
use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

use crate::context::MigrationContext;
use crate::identity::{IdMapping, dedup_ids};
use crate::migrator::StageReport;
use crate::outcome::{NO_PARENT_MAPPING, OutcomeLog, OutcomeRecord};
use crate::resource_cache::{LINK_KIND, LinkRequest, ResourceMigrationRecord, ensure_links};
use crate::retry::RetryExecutor;
use crate::stages::{fetch_where_in, write_report};
use crate::Result;

/// Tag for document upload outcomes.
pub const DOCUMENT_KIND: &str = "ContentDocument";

/// Report name of the files stage.
pub const FILES_STAGE: &str = "Files";

/// Outcome detail of links whose document never reached the target.
pub const DOCUMENT_NOT_MIGRATED: &str = "Document was not migrated";

pub(crate) const VERSION_FIELDS: &[&str] = &[
    "Id",
    "ContentDocumentId",
    "Title",
    "PathOnClient",
    "ContentSize",
];

const LINK_FIELDS: &[&str] = &[
    "Id",
    "ContentDocumentId",
    "LinkedEntityId",
    "ShareType",
    "Visibility",
];

fn invalid_path_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"[:<>"/\\|?*\x00-\x1F]"#).unwrap())
}

/// A client file name safe for the target org.
pub fn sanitize_file_name(title: &str, path_on_client: Option<&str>) -> String {
    let candidate = match path_on_client.map(str::trim).filter(|p| !p.is_empty()) {
        Some(path) => path.to_string(),
        None if title.trim().is_empty() => "file.bin".to_string(),
        None => format!("{}.bin", title.trim()),
    };
    invalid_path_chars().replace_all(&candidate, "_").into_owned()
}

/// Declared size of a version, in bytes.
pub(crate) fn version_size(version: &Record) -> u64 {
    version
        .path("ContentSize")
        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .unwrap_or(0)
}

/// Skip reason for versions above the upload limit.
pub(crate) fn too_large(size: u64, limit: u64) -> String {
    format!("File of {} bytes exceeds the {} byte upload limit", size, limit)
}

/// Latest source version of each document.
pub(crate) async fn latest_versions(
    ctx: &MigrationContext,
    document_ids: &[String],
) -> Result<HashMap<String, Record>> {
    let versions = fetch_where_in(
        ctx,
        "ContentVersion",
        VERSION_FIELDS,
        "ContentDocumentId",
        document_ids,
        Some(Filter::eq("IsLatest", true)),
    )
    .await?;
    Ok(versions
        .into_iter()
        .filter_map(|v| v.path_str("ContentDocumentId").map(str::to_string).map(|d| (d, v)))
        .collect())
}

/// Download a version's binary from the source and upload it to the target.
///
/// The new version carries the source version id in the legacy field; the
/// target creates the document and, when `publish_location` is given, its
/// first link.
pub(crate) async fn upload_version(
    source: &dyn OrgApi,
    target: &dyn OrgApi,
    retry: &RetryExecutor,
    legacy_field: &str,
    version: &Record,
    publish_location: Option<&str>,
) -> Result<ResourceMigrationRecord> {
    let (Some(version_id), Some(document_id)) =
        (version.id(), version.path_str("ContentDocumentId"))
    else {
        return Err(ApiError::InvalidResponse("content version without ids".into()).into());
    };

    let bytes = retry
        .execute("download version", || {
            source.download("ContentVersion", version_id, "VersionData")
        })
        .await
        .into_result("download version")?;

    let title = version
        .path_str("Title")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("file");
    let mut payload = Record::new();
    payload.insert("Title".into(), Value::String(title.to_string()));
    payload.insert(
        "PathOnClient".into(),
        Value::String(sanitize_file_name(title, version.path_str("PathOnClient"))),
    );
    payload.insert("VersionData".into(), Value::String(BASE64.encode(&bytes)));
    payload.insert(legacy_field.to_string(), Value::String(version_id.to_string()));
    if let Some(location) = publish_location {
        payload.insert("FirstPublishLocationId".into(), Value::String(location.to_string()));
    }

    let new_version = retry
        .execute("upload version", || target.create("ContentVersion", &payload))
        .await
        .into_result("upload version")?;
    let created = retry
        .execute("read uploaded version", || target.get("ContentVersion", &new_version))
        .await
        .into_result("read uploaded version")?;
    let target_document = created
        .path_str("ContentDocumentId")
        .ok_or_else(|| ApiError::InvalidResponse(format!("version {} has no document", new_version)))?
        .to_string();

    info!(
        source_version = version_id,
        target_version = %new_version,
        bytes = bytes.len(),
        "document uploaded"
    );
    Ok(ResourceMigrationRecord {
        source_document_id: document_id.to_string(),
        source_version_id: Some(version_id.to_string()),
        target_document_id: target_document,
        target_version_id: new_version,
    })
}

/// Where a source link should point on the target.
enum LinkTarget {
    Entity(String),
    Unmapped,
    Unsupported(String),
}

/// Migrate the files of migrated activities (`activities` maps source to
/// target activity ids).
#[tracing::instrument(skip_all, fields(activities = activities.len()))]
pub async fn migrate_files(
    ctx: &mut MigrationContext,
    activities: &IdMapping,
) -> Result<StageReport> {
    let mut report = StageReport::empty(FILES_STAGE);
    if activities.is_empty() {
        return Ok(report);
    }

    let roots = fetch_where_in(
        ctx,
        LINK_KIND,
        LINK_FIELDS,
        "LinkedEntityId",
        activities.keys(),
        None,
    )
    .await?;
    let documents = dedup_ids(roots.iter().filter_map(|l| l.path_str("ContentDocumentId")));
    if documents.is_empty() {
        info!("no files linked to migrated activities");
        return Ok(report);
    }

    // every link of those documents, including user shares
    let links = fetch_where_in(ctx, LINK_KIND, LINK_FIELDS, "ContentDocumentId", &documents, None)
        .await?;
    let targets = link_targets(ctx, &links, activities).await?;

    let mut log = OutcomeLog::new();
    let mut by_document: BTreeMap<String, Vec<(&Record, String)>> = BTreeMap::new();
    for link in &links {
        let (Some(id), Some(document)) = (link.id(), link.path_str("ContentDocumentId")) else {
            continue;
        };
        let entity = link.path_str("LinkedEntityId").unwrap_or_default();
        match targets.get(entity) {
            Some(LinkTarget::Entity(target_id)) => by_document
                .entry(document.to_string())
                .or_default()
                .push((link, target_id.clone())),
            Some(LinkTarget::Unsupported(kind)) => log.push(OutcomeRecord::failed(
                LINK_KIND,
                id,
                format!("Unsupported linked entity type: {}", kind),
            )),
            Some(LinkTarget::Unmapped) | None => {
                log.push(OutcomeRecord::missing_mapping(LINK_KIND, id, NO_PARENT_MAPPING))
            }
        }
    }

    let wanted: Vec<String> = by_document.keys().cloned().collect();
    let known = ctx.resolver().resolve_content_documents(&wanted).await?;
    let versions = latest_versions(ctx, &wanted).await?;
    let limit = ctx.config.content.max_upload_bytes;

    let mut requests = Vec::new();
    for (document, document_links) in &by_document {
        let migrated = match known.get(document) {
            Some(record) => {
                log.push(OutcomeRecord::success(DOCUMENT_KIND, document, &record.target_document_id));
                record.clone()
            }
            None => {
                let Some(version) = versions.get(document) else {
                    log.push(OutcomeRecord::failed(DOCUMENT_KIND, document, "No latest version found"));
                    for id in link_ids(document_links) {
                        log.push(OutcomeRecord::failed(LINK_KIND, id, DOCUMENT_NOT_MIGRATED));
                    }
                    continue;
                };
                let size = version_size(version);
                if size > limit {
                    log.push(OutcomeRecord::ineligible(DOCUMENT_KIND, document, too_large(size, limit)));
                    for id in link_ids(document_links) {
                        log.push(OutcomeRecord::ineligible(LINK_KIND, id, DOCUMENT_NOT_MIGRATED));
                    }
                    continue;
                }
                let publish_location = document_links.first().map(|(_, t)| t.clone());
                let source = ctx.source.clone();
                let target = ctx.target.clone();
                let retry = ctx.retry.clone();
                let legacy_field = ctx.config.legacy_id_field.clone();
                let uploaded = ctx
                    .resources
                    .get_or_migrate(document, || async {
                        upload_version(
                            source.as_ref(),
                            target.as_ref(),
                            &retry,
                            &legacy_field,
                            version,
                            publish_location.as_deref(),
                        )
                        .await
                    })
                    .await;
                match uploaded {
                    Ok(record) => {
                        log.push(OutcomeRecord::success(
                            DOCUMENT_KIND,
                            document,
                            &record.target_document_id,
                        ));
                        record
                    }
                    Err(e) => {
                        warn!(document = %document, error = %e, "document upload failed");
                        log.push(OutcomeRecord::failed(DOCUMENT_KIND, document, e.to_string()));
                        for id in link_ids(document_links) {
                            log.push(OutcomeRecord::failed(LINK_KIND, id, DOCUMENT_NOT_MIGRATED));
                        }
                        continue;
                    }
                }
            }
        };

        for (link, entity) in document_links {
            let Some(id) = link.id() else { continue };
            requests.push(LinkRequest::new(
                id,
                migrated.target_document_id.clone(),
                entity.clone(),
                link.path_str("ShareType"),
                link.path_str("Visibility"),
            ));
        }
    }

    let link_log = ensure_links(
        ctx.target.as_ref(),
        &ctx.retry,
        &requests,
        ctx.config.batch_size,
        ctx.config.query_chunk_size,
    )
    .await?;
    log.append(link_log);

    report.mapping = log
        .records()
        .iter()
        .filter(|r| r.kind == DOCUMENT_KIND)
        .filter_map(|r| r.target_id().map(|t| (r.source_id.clone(), t.to_string())))
        .collect();
    report.outcomes = log;
    info!(summary = %report.summary(), "files migrated");
    write_report(ctx, &report)?;
    Ok(report)
}

fn link_ids<'a>(links: &'a [(&Record, String)]) -> impl Iterator<Item = &'a str> {
    links.iter().filter_map(|(link, _)| link.id())
}

/// Decide the target entity of every linked entity id.
async fn link_targets(
    ctx: &mut MigrationContext,
    links: &[Record],
    activities: &IdMapping,
) -> Result<HashMap<String, LinkTarget>> {
    let entities = dedup_ids(links.iter().filter_map(|l| l.path_str("LinkedEntityId")));
    let users: Vec<&String> = entities
        .iter()
        .filter(|e| !activities.contains_key(*e) && key_prefix(e) == Some(USER_KEY_PREFIX))
        .collect();
    let user_map = ctx.resolver().resolve("User", users).await?;

    let others: Vec<String> = entities
        .iter()
        .filter(|e| !activities.contains_key(*e) && key_prefix(e) != Some(USER_KEY_PREFIX))
        .cloned()
        .collect();
    let candidates = vec!["Task".to_string(), "Event".to_string()];
    let types = if others.is_empty() {
        HashMap::new()
    } else {
        ctx.resolver().object_types(&others, &candidates).await?
    };

    let mut targets = HashMap::new();
    for entity in entities {
        let target = if let Some(activity) = activities.get(&entity) {
            LinkTarget::Entity(activity.clone())
        } else if key_prefix(&entity) == Some(USER_KEY_PREFIX) {
            match user_map.get(&entity) {
                Some(user) => LinkTarget::Entity(user.clone()),
                None => LinkTarget::Unmapped,
            }
        } else {
            match types.get(&entity).map(String::as_str) {
                // an activity that was not migrated in this run
                Some("Task") | Some("Event") => LinkTarget::Unmapped,
                Some(other) => LinkTarget::Unsupported(other.to_string()),
                None => LinkTarget::Unsupported(
                    key_prefix(&entity).unwrap_or("unknown").to_string(),
                ),
            }
        };
        targets.insert(entity, target);
    }
    Ok(targets)
}
