//! Classic attachments of migrated parents.
//!
//! Attachments carry no custom fields, so there is no legacy id to resolve
//! through. A target attachment with the same parent and name counts as
//! already migrated.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use orgbridge_api::{Filter, Query, Record, RecordExt};
use serde_json::Value;
use tracing::{debug, info};

use crate::batch::chunked;
use crate::context::MigrationContext;
use crate::identity::{IdMapping, dedup_ids};
use crate::migrator::StageReport;
use crate::outcome::{NO_PARENT_MAPPING, OutcomeLog, OutcomeRecord};
use crate::stages::{fetch_where_in, write_report};
use crate::Result;

pub const ATTACHMENT: &str = "Attachment";

const FIELDS: &[&str] = &[
    "Id",
    "Name",
    "ParentId",
    "OwnerId",
    "ContentType",
    "Description",
    "IsPrivate",
];

/// Copy the attachments of every parent in `parents` (source to target).
#[tracing::instrument(skip_all, fields(parents = parents.len()))]
pub async fn migrate_attachments(
    ctx: &mut MigrationContext,
    parents: &IdMapping,
) -> Result<StageReport> {
    let mut report = StageReport::empty(ATTACHMENT);
    if parents.is_empty() {
        return Ok(report);
    }

    let attachments =
        fetch_where_in(ctx, ATTACHMENT, FIELDS, "ParentId", parents.keys(), None).await?;
    info!(count = attachments.len(), "attachments selected");

    let mut existing = existing_attachments(ctx, parents.values()).await?;
    let owners = ctx
        .resolver()
        .resolve_owners(attachments.iter().filter_map(|a| a.path_str("OwnerId")))
        .await?;

    let mut log = OutcomeLog::new();
    for attachment in &attachments {
        let Some(id) = attachment.id() else { continue };
        let Some(target_parent) = attachment.path_str("ParentId").and_then(|p| parents.get(p))
        else {
            log.push(OutcomeRecord::missing_mapping(ATTACHMENT, id, NO_PARENT_MAPPING));
            continue;
        };
        let name = attachment.path_str("Name").unwrap_or_default();
        // each target copy stands in for one source attachment
        if let Some(target_id) = existing
            .get_mut(&(target_parent.clone(), name.to_string()))
            .and_then(Vec::pop)
        {
            debug!(attachment = id, "already present on target");
            log.push(OutcomeRecord::success(ATTACHMENT, id, target_id));
            continue;
        }

        let outcome = match copy_attachment(ctx, attachment, id, target_parent, &owners).await {
            Ok(target_id) => OutcomeRecord::success(ATTACHMENT, id, target_id),
            Err(e) => OutcomeRecord::failed(ATTACHMENT, id, e.to_string()),
        };
        log.push(outcome);
    }

    report.mapping = log.successes();
    report.outcomes = log;
    info!(summary = %report.summary(), "attachments migrated");
    write_report(ctx, &report)?;
    Ok(report)
}

async fn copy_attachment(
    ctx: &MigrationContext,
    attachment: &Record,
    id: &str,
    target_parent: &str,
    owners: &IdMapping,
) -> Result<String> {
    let source = ctx.source.as_ref();
    let target = ctx.target.as_ref();
    let body = ctx
        .retry
        .execute("download attachment", || source.download(ATTACHMENT, id, "Body"))
        .await
        .into_result("download attachment")?;

    let mut payload = Record::new();
    for field in ["Name", "ContentType", "Description", "IsPrivate"] {
        if let Some(value) = attachment.path(field) {
            payload.insert(field.to_string(), value.clone());
        }
    }
    payload.insert("ParentId".into(), Value::String(target_parent.to_string()));
    payload.insert("Body".into(), Value::String(BASE64.encode(&body)));
    if let Some(owner) = attachment.path_str("OwnerId").and_then(|o| owners.get(o)) {
        payload.insert("OwnerId".into(), Value::String(owner.clone()));
    }

    ctx.retry
        .execute("create attachment", || target.create(ATTACHMENT, &payload))
        .await
        .into_result("create attachment")
}

/// (target parent, name) to the ids of target attachments carrying it.
async fn existing_attachments<'a, I>(
    ctx: &MigrationContext,
    target_parents: I,
) -> Result<HashMap<(String, String), Vec<String>>>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut existing = HashMap::new();
    for chunk in chunked(dedup_ids(target_parents), ctx.config.query_chunk_size) {
        let query = Query::select(ATTACHMENT, ["Id", "ParentId", "Name"])
            .filter(Filter::is_in("ParentId", chunk));
        let records = ctx
            .retry
            .execute("fetch target attachments", || ctx.target.query(&query))
            .await
            .into_result("fetch target attachments")?;
        for record in &records {
            if let (Some(id), Some(parent), Some(name)) =
                (record.id(), record.path_str("ParentId"), record.path_str("Name"))
            {
                existing
                    .entry((parent.to_string(), name.to_string()))
                    .or_insert_with(Vec::new)
                    .push(id.to_string());
            }
        }
    }
    Ok(existing)
}
