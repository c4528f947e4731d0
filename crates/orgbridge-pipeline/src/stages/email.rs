//! Email templates and email messages.
//!
//! Templates are migrated first, and only those referenced by messages that
//! would otherwise migrate. Messages then resolve `EmailTemplateId` through
//! the template mapping.

use std::collections::HashMap;

use orgbridge_api::{Filter, Query, Record, RecordExt};
use serde_json::Value;
use tracing::{info, warn};

use crate::audit::{read_id_mapping, write_rows};
use crate::batch::chunked;
use crate::context::MigrationContext;
use crate::descriptor::{self, UNMAPPED_TEMPLATE};
use crate::identity::{IdMapping, dedup_ids};
use crate::migrator::{DependencyOrderedMigrator, SourceSelection, StagePlan, StageReport};
use crate::outcome::{OutcomeLog, OutcomeRecord};
use crate::stages::{fetch_where_in, write_report};
use crate::Result;

pub const EMAIL_TEMPLATE: &str = "EmailTemplate";
pub const EMAIL_MESSAGE: &str = "EmailMessage";
pub const TEMPLATE_MAPPING_FILE: &str = "emailtemplate_mapping.csv";

const TEMPLATE_MAPPING_HEADERS: [&str; 2] = ["Source_Template_Id", "Target_Template_Id"];

const TEMPLATE_FIELDS: &[&str] = &[
    "Id",
    "Name",
    "DeveloperName",
    "Subject",
    "Body",
    "HtmlValue",
    "TemplateType",
    "IsActive",
    "Description",
];

// ===== Templates =====

/// Source template ids that block an otherwise migratable message.
async fn blocking_templates(ctx: &mut MigrationContext) -> Result<Vec<String>> {
    let plan = plan_email_messages(ctx, &IdMapping::new()).await?;

    let blocked: Vec<&str> = plan
        .settled
        .records()
        .iter()
        .filter(|r| r.detail() == UNMAPPED_TEMPLATE)
        .map(|r| r.source_id.as_str())
        .collect();
    if blocked.is_empty() {
        return Ok(Vec::new());
    }
    let messages = fetch_where_in(ctx, EMAIL_MESSAGE, &["Id", "EmailTemplateId"], "Id", blocked, None)
        .await?;
    Ok(dedup_ids(messages.iter().filter_map(|m| m.path_str("EmailTemplateId"))))
}

/// Target templates by name.
async fn target_templates_by_name(
    ctx: &MigrationContext,
    names: Vec<String>,
) -> Result<HashMap<String, String>> {
    let mut by_name = HashMap::new();
    for chunk in chunked(names, ctx.config.query_chunk_size) {
        let query =
            Query::select(EMAIL_TEMPLATE, ["Id", "Name"]).filter(Filter::is_in("Name", chunk));
        let records = ctx
            .retry
            .execute("fetch target templates", || ctx.target.query(&query))
            .await
            .into_result("fetch target templates")?;
        for record in &records {
            if let (Some(id), Some(name)) = (record.id(), record.path_str("Name")) {
                by_name.insert(name.to_string(), id.to_string());
            }
        }
    }
    Ok(by_name)
}

fn template_payload(template: &Record, folder: Option<&str>) -> Record {
    let mut payload = Record::new();
    for field in TEMPLATE_FIELDS.iter().filter(|f| **f != "Id") {
        if let Some(value) = template.path(field) {
            payload.insert(field.to_string(), value.clone());
        }
    }
    if let Some(folder) = folder {
        payload.insert("FolderId".into(), Value::String(folder.to_string()));
    }
    payload
}

/// Migrate the templates referenced by eligible email messages.
///
/// A target template with the same name is reused instead of recreated.
/// Writes the template mapping table.
#[tracing::instrument(skip_all)]
pub async fn migrate_email_templates(ctx: &mut MigrationContext) -> Result<StageReport> {
    let mut report = StageReport::empty(EMAIL_TEMPLATE);
    let template_ids = blocking_templates(ctx).await?;
    info!(count = template_ids.len(), "templates referenced by messages");

    let templates =
        fetch_where_in(ctx, EMAIL_TEMPLATE, TEMPLATE_FIELDS, "Id", &template_ids, None).await?;
    let names = dedup_ids(templates.iter().filter_map(|t| t.path_str("Name")));
    let existing = target_templates_by_name(ctx, names).await?;

    let folder = ctx
        .config
        .email_template_folder_id
        .clone()
        .or_else(|| ctx.config.integration_user_id.clone());
    if folder.is_none() {
        warn!("no template folder configured, templates are created without one");
    }

    let mut log = OutcomeLog::new();
    for template in &templates {
        let Some(id) = template.id() else { continue };
        let name = template.path_str("Name").unwrap_or_default();
        if let Some(target_id) = existing.get(name) {
            info!(template = id, name, "reusing target template");
            log.push(OutcomeRecord::success(EMAIL_TEMPLATE, id, target_id));
            continue;
        }
        let payload = template_payload(template, folder.as_deref());
        let target = ctx.target.as_ref();
        let created = ctx
            .retry
            .execute("create template", || target.create(EMAIL_TEMPLATE, &payload))
            .await
            .into_result("create template");
        match created {
            Ok(target_id) => log.push(OutcomeRecord::success(EMAIL_TEMPLATE, id, target_id)),
            Err(e) => log.push(OutcomeRecord::failed(EMAIL_TEMPLATE, id, e.to_string())),
        }
    }
    for missing in template_ids.iter().filter(|id| !templates.iter().any(|t| t.id() == Some(id.as_str()))) {
        log.push(OutcomeRecord::failed(EMAIL_TEMPLATE, missing, "Template not found on source"));
    }

    report.mapping = log.successes();
    report.outcomes = log;
    let mut rows: Vec<[String; 2]> = report
        .mapping
        .iter()
        .map(|(s, t)| [s.clone(), t.clone()])
        .collect();
    rows.sort();
    write_rows(&ctx.output_path(TEMPLATE_MAPPING_FILE), &TEMPLATE_MAPPING_HEADERS, rows)?;
    info!(summary = %report.summary(), "email templates migrated");
    write_report(ctx, &report)?;
    Ok(report)
}

// ===== Messages =====

/// Migrate email messages, resolving templates through `templates`.
#[tracing::instrument(skip_all, fields(templates = templates.len()))]
pub async fn migrate_email_messages(
    ctx: &mut MigrationContext,
    templates: &IdMapping,
) -> Result<StageReport> {
    let descriptor = ctx.descriptor(descriptor::email_message());
    let report = DependencyOrderedMigrator::new(ctx, descriptor)
        .provide(EMAIL_TEMPLATE, templates)
        .run(SourceSelection::Condition)
        .await?;
    write_report(ctx, &report)?;
    Ok(report)
}

/// What [`migrate_email_messages`] would do, without writing to the target.
pub async fn plan_email_messages(
    ctx: &mut MigrationContext,
    templates: &IdMapping,
) -> Result<StagePlan> {
    let descriptor = ctx.descriptor(descriptor::email_message());
    DependencyOrderedMigrator::new(ctx, descriptor)
        .provide(EMAIL_TEMPLATE, templates)
        .plan(SourceSelection::Condition)
        .await
}

/// The template mapping table of an earlier run, or an empty mapping.
pub fn template_mapping(ctx: &MigrationContext) -> Result<IdMapping> {
    let path = ctx.output_path(TEMPLATE_MAPPING_FILE);
    if path.exists() {
        read_id_mapping(&path, TEMPLATE_MAPPING_HEADERS[0], TEMPLATE_MAPPING_HEADERS[1])
    } else {
        warn!(path = %path.display(), "template mapping not found, templated messages will be skipped");
        Ok(IdMapping::new())
    }
}

/// Migrate email messages using the template mapping table, when present.
pub async fn migrate_email_messages_from_table(ctx: &mut MigrationContext) -> Result<StageReport> {
    let templates = template_mapping(ctx)?;
    migrate_email_messages(ctx, &templates).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrator::PARENT_NOT_ELIGIBLE;
    use crate::{MigrationConfig, Status};
    use orgbridge_api::{MemoryOrg, OrgApi};
    use serde_json::json;
    use std::sync::Arc;

    const BRANDS: &str = "Type = 'Brand'";

    struct Fixture {
        dir: tempfile::TempDir,
        source: Arc<MemoryOrg>,
        target: Arc<MemoryOrg>,
        brand: String,
        other: String,
    }

    impl Fixture {
        fn new() -> Self {
            let source = Arc::new(MemoryOrg::new());
            let target = Arc::new(MemoryOrg::new());
            source.register_condition("Account", BRANDS, |r| r.path_str("Type") == Some("Brand"));
            let brand = source.seed("Account", json!({ "Type": "Brand" }));
            let other = source.seed("Account", json!({ "Type": "Dealer" }));
            target.seed("Account", json!({ "Id": "001T1", "Legacy_Id__c": brand }));
            target.seed("Account", json!({ "Id": "001T2", "Legacy_Id__c": other }));
            Self {
                dir: tempfile::tempdir().unwrap(),
                source,
                target,
                brand,
                other,
            }
        }

        fn context(&self) -> MigrationContext {
            let mut config = MigrationConfig {
                output_dir: self.dir.path().to_path_buf(),
                email_template_folder_id: Some("00lT1".to_string()),
                ..MigrationConfig::default()
            };
            config.eligibility.insert("Account".to_string(), BRANDS.to_string());
            MigrationContext::new(
                Arc::clone(&self.source) as Arc<dyn OrgApi>,
                Arc::clone(&self.target) as Arc<dyn OrgApi>,
                config,
            )
        }

        fn message(&self, parent: &str, template: Option<&str>) -> String {
            let mut message = json!({
                "Subject": "Renewal",
                "RelatedToId": parent,
                "RelatedTo": { "Type": "Account" },
                "Status": "3",
                "ActivityId": "00TS1",
            });
            if let Some(template) = template {
                message["EmailTemplateId"] = json!(template);
            }
            self.source.seed(EMAIL_MESSAGE, message)
        }
    }

    #[tokio::test]
    async fn test_only_templates_of_eligible_messages() {
        let fx = Fixture::new();
        let used = fx.source.seed(EMAIL_TEMPLATE, json!({ "Name": "Renewal", "Subject": "Renew" }));
        let unused = fx.source.seed(EMAIL_TEMPLATE, json!({ "Name": "Dealer note" }));
        let shared = fx.source.seed(EMAIL_TEMPLATE, json!({ "Name": "Welcome" }));
        fx.target.seed(EMAIL_TEMPLATE, json!({ "Id": "00XT9", "Name": "Welcome" }));
        fx.message(&fx.brand, Some(&used));
        fx.message(&fx.brand, Some(&shared));
        fx.message(&fx.other, Some(&unused));

        let mut ctx = fx.context();
        let report = migrate_email_templates(&mut ctx).await.unwrap();

        assert_eq!(report.mapping.len(), 2);
        assert_eq!(report.mapping[&shared], "00XT9");
        assert!(!report.mapping.contains_key(&unused));
        let created = fx.target.records(EMAIL_TEMPLATE);
        assert_eq!(created.len(), 2);
        let renewal = created.iter().find(|t| t["Name"] == json!("Renewal")).unwrap();
        assert_eq!(renewal["FolderId"], json!("00lT1"));

        let table = read_id_mapping(
            &ctx.output_path(TEMPLATE_MAPPING_FILE),
            "Source_Template_Id",
            "Target_Template_Id",
        )
        .unwrap();
        assert_eq!(table, report.mapping);
    }

    #[tokio::test]
    async fn test_messages_use_template_mapping() {
        let fx = Fixture::new();
        let template = fx.source.seed(EMAIL_TEMPLATE, json!({ "Name": "Renewal" }));
        let templated = fx.message(&fx.brand, Some(&template));
        let plain = fx.message(&fx.brand, None);
        let dealer = fx.message(&fx.other, None);

        let mut ctx = fx.context();
        migrate_email_templates(&mut ctx).await.unwrap();
        let report = migrate_email_messages_from_table(&mut ctx).await.unwrap();

        assert_eq!(report.outcomes.find(&templated).unwrap().status(), Status::Success);
        assert_eq!(report.outcomes.find(&plain).unwrap().status(), Status::Success);
        let skipped = report.outcomes.find(&dealer).unwrap();
        assert_eq!(skipped.status(), Status::Skipped);
        assert_eq!(skipped.detail(), PARENT_NOT_ELIGIBLE);

        let messages = fx.target.records(EMAIL_MESSAGE);
        assert_eq!(messages.len(), 2);
        for message in &messages {
            assert_eq!(message["Status"], json!("5"));
            assert_eq!(message["RelatedToId"], json!("001T1"));
            assert!(message.get("ActivityId").is_none());
        }
    }

    #[tokio::test]
    async fn test_missing_template_table_skips_templated_messages() {
        let fx = Fixture::new();
        let templated = fx.message(&fx.brand, Some("00XS404"));

        let mut ctx = fx.context();
        let report = migrate_email_messages_from_table(&mut ctx).await.unwrap();
        let outcome = report.outcomes.find(&templated).unwrap();
        assert_eq!(outcome.status(), Status::Skipped);
        assert_eq!(outcome.detail(), UNMAPPED_TEMPLATE);
    }
}
