//! PII masking of migrated records on the target org.

use orgbridge_api::{Filter, Query, Record, RecordExt};
use serde_json::Value;
use tracing::info;

use crate::audit::write_outcomes;
use crate::config::{MaskKind, MaskingPolicy};
use crate::context::MigrationContext;
use crate::migrator::StageReport;
use crate::outcome::{OutcomeLog, OutcomeRecord};
use crate::retry::WriteKind;
use crate::Result;

pub const MASKED_PHONE: &str = "0000000000";
pub const MASKED_TEXT: &str = "MASKED";
const EMAIL_SUFFIX: &str = ".invalid";

/// Masked form of a value, or `None` when it is already masked.
pub fn mask_value(kind: MaskKind, value: &str) -> Option<String> {
    let masked = match kind {
        MaskKind::Phone => MASKED_PHONE.to_string(),
        MaskKind::Text => MASKED_TEXT.to_string(),
        MaskKind::Email if value.ends_with(EMAIL_SUFFIX) => value.to_string(),
        MaskKind::Email => format!("{}{}", value, EMAIL_SUFFIX),
    };
    (masked != value).then_some(masked)
}

/// Update payload masking every populated policy field, or `None` when
/// nothing changes.
fn masked_update(record: &Record, policy: &MaskingPolicy) -> Option<Record> {
    let id = record.id()?;
    let mut update = Record::new();
    for (field, kind) in &policy.fields {
        let Some(value) = record.path(field) else { continue };
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if let Some(masked) = mask_value(*kind, &text) {
            update.insert(field.clone(), Value::String(masked));
        }
    }
    if update.is_empty() {
        return None;
    }
    update.insert("Id".into(), Value::String(id.to_string()));
    Some(update)
}

/// Masking log file for an object.
pub fn masking_log_name(object: &str) -> String {
    format!("{}_masking_log.csv", object)
}

/// Mask the configured fields of migrated `object` records on the target.
///
/// Only records carrying a legacy id are touched. Fields listed as
/// non-filterable are fetched and masked but left out of the query filter.
#[tracing::instrument(skip(ctx, policy), fields(fields = policy.fields.len()))]
pub async fn mask_object(
    ctx: &MigrationContext,
    object: &str,
    policy: &MaskingPolicy,
) -> Result<StageReport> {
    let mut report = StageReport::empty(object);
    if policy.fields.is_empty() {
        return Ok(report);
    }

    let filterable: Vec<&String> = policy
        .fields
        .keys()
        .filter(|f| !policy.non_filterable.contains(*f))
        .collect();
    let fields = std::iter::once("Id").chain(policy.fields.keys().map(String::as_str));
    let mut query = Query::select(object, fields).filter(Filter::not_null(ctx.legacy_field()));
    if !filterable.is_empty() {
        query = query.filter(Filter::any_not_null(filterable));
    }

    let operation = format!("fetch {} for masking", object);
    let target = ctx.target.as_ref();
    let records = ctx
        .retry
        .execute(&operation, || target.query(&query))
        .await
        .into_result(&operation)?;

    let mut log = OutcomeLog::new();
    let mut updates = Vec::new();
    for record in &records {
        match masked_update(record, policy) {
            Some(update) => updates.push(update),
            None => {
                if let Some(id) = record.id() {
                    log.push(OutcomeRecord::success(object, id, id));
                }
            }
        }
    }
    info!(
        fetched = records.len(),
        to_update = updates.len(),
        "records selected for masking"
    );

    let results = ctx
        .retry
        .write_with_resubmission(target, WriteKind::Update, object, &updates, ctx.config.batch_size)
        .await;
    for (update, result) in updates.iter().zip(results) {
        let id = update.id().unwrap_or_default();
        if result.success {
            log.push(OutcomeRecord::success(object, id, id));
        } else {
            log.push(OutcomeRecord::failed(object, id, result.error_message()));
        }
    }

    report.outcomes = log;
    info!(summary = %report.summary(), "masking complete");
    write_outcomes(&ctx.output_path(&masking_log_name(object)), &report.outcomes)?;
    Ok(report)
}

/// Run every configured masking policy.
pub async fn mask_all(ctx: &MigrationContext) -> Result<Vec<StageReport>> {
    let mut reports = Vec::new();
    for (object, policy) in &ctx.config.masking {
        reports.push(mask_object(ctx, object, policy).await?);
    }
    Ok(reports)
}
