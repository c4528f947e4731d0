//! Named migration stages run in dependency order.
//!
//! Supports:
//! - `--list` to show every stage and whether its log exists yet
//! - `--dry-run` to plan without writing to the target
//! - `--all` to run every stage in order

use async_trait::async_trait;
use miette::Result;
use orgbridge_pipeline::audit::read_columns;
use orgbridge_pipeline::stages::activities::{Activity, plan_activities};
use orgbridge_pipeline::stages::content::{
    LINK_MAPPING_FILE, export_links, migrate_content, migrate_distributions,
};
use orgbridge_pipeline::stages::email::{
    migrate_email_messages, migrate_email_templates, plan_email_messages, template_mapping,
};
use orgbridge_pipeline::stages::log_file_name;
use orgbridge_pipeline::stages::masking::{mask_all, masking_log_name};
use orgbridge_pipeline::stages::picklists::{PICKLIST_AUDIT_FILE, audit_picklists, inactive_values};
use orgbridge_pipeline::stages::tree::run_activity_tree;
use orgbridge_pipeline::{MigrationConfig, MigrationContext, StageReport};
use tracing::info;

use crate::commands::{fail, print_plan};
use crate::connect::{self, OrgArgs};

// =============================================================================
// Stage Framework Types
// =============================================================================

/// A named step of a full migration.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Unique name for this stage.
    fn name(&self) -> &'static str;

    /// Human-readable description.
    fn description(&self) -> &'static str;

    /// Output file whose presence means the stage has run before.
    fn marker(&self, config: &MigrationConfig) -> String;

    /// Describe what would happen, without writing to the target.
    async fn preview(&self, ctx: &mut MigrationContext) -> Result<Vec<String>>;

    /// Run the stage.
    async fn apply(&self, ctx: &mut MigrationContext) -> Result<Vec<StageReport>>;
}

// =============================================================================
// Stages
// =============================================================================

struct PicklistAudit;

#[async_trait]
impl Stage for PicklistAudit {
    fn name(&self) -> &'static str {
        "picklists"
    }

    fn description(&self) -> &'static str {
        "Audit inactive picklist values on the target org"
    }

    fn marker(&self, _config: &MigrationConfig) -> String {
        PICKLIST_AUDIT_FILE.to_string()
    }

    async fn preview(&self, ctx: &mut MigrationContext) -> Result<Vec<String>> {
        let objects: Vec<String> = ctx.config.eligibility.keys().cloned().collect();
        let inactive = inactive_values(ctx.target.as_ref(), &ctx.retry, &objects)
            .await
            .map_err(fail)?;
        Ok(inactive
            .iter()
            .map(|v| format!("{}.{} = {} is inactive", v.object, v.field, v.value))
            .collect())
    }

    async fn apply(&self, ctx: &mut MigrationContext) -> Result<Vec<StageReport>> {
        let inactive = audit_picklists(ctx, &[]).await.map_err(fail)?;
        println!("{} inactive picklist value(s)", inactive.len());
        Ok(Vec::new())
    }
}

struct ActivityTree;

#[async_trait]
impl Stage for ActivityTree {
    fn name(&self) -> &'static str {
        "activity-tree"
    }

    fn description(&self) -> &'static str {
        "Tasks and events, then their attachments, files, feed items and comments"
    }

    fn marker(&self, _config: &MigrationConfig) -> String {
        log_file_name("Task")
    }

    async fn preview(&self, ctx: &mut MigrationContext) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        for activity in Activity::ALL {
            let plan = plan_activities(ctx, activity, None).await.map_err(fail)?;
            print_plan(&plan);
            lines.push(format!(
                "{}: {} of {} record(s) would be inserted",
                activity,
                plan.ready.len(),
                plan.fetched
            ));
        }
        Ok(lines)
    }

    async fn apply(&self, ctx: &mut MigrationContext) -> Result<Vec<StageReport>> {
        let tree = run_activity_tree(ctx).await.map_err(fail)?;
        Ok(tree.stages)
    }
}

struct Email;

#[async_trait]
impl Stage for Email {
    fn name(&self) -> &'static str {
        "email"
    }

    fn description(&self) -> &'static str {
        "Email templates referenced by eligible messages, then the messages"
    }

    fn marker(&self, _config: &MigrationConfig) -> String {
        log_file_name("EmailMessage")
    }

    async fn preview(&self, ctx: &mut MigrationContext) -> Result<Vec<String>> {
        let templates = template_mapping(ctx).map_err(fail)?;
        let plan = plan_email_messages(ctx, &templates).await.map_err(fail)?;
        print_plan(&plan);
        Ok(vec![format!(
            "EmailMessage: {} of {} record(s) would be inserted",
            plan.ready.len(),
            plan.fetched
        )])
    }

    async fn apply(&self, ctx: &mut MigrationContext) -> Result<Vec<StageReport>> {
        let templates = migrate_email_templates(ctx).await.map_err(fail)?;
        let messages = migrate_email_messages(ctx, &templates.mapping)
            .await
            .map_err(fail)?;
        Ok(vec![templates, messages])
    }
}

struct Content;

#[async_trait]
impl Stage for Content {
    fn name(&self) -> &'static str {
        "content"
    }

    fn description(&self) -> &'static str {
        "Files of eligible parent records, their links and public distributions"
    }

    fn marker(&self, _config: &MigrationConfig) -> String {
        LINK_MAPPING_FILE.to_string()
    }

    async fn preview(&self, ctx: &mut MigrationContext) -> Result<Vec<String>> {
        let path = ctx.output_path(LINK_MAPPING_FILE);
        if !path.exists() {
            return Ok(vec![format!(
                "link mapping {} would be exported first",
                path.display()
            )]);
        }
        let rows = read_columns(&path, &["ContentDocumentId"]).map_err(fail)?;
        let mut documents: Vec<&String> = rows.iter().filter_map(|r| r.first()).collect();
        documents.sort();
        documents.dedup();
        Ok(vec![format!(
            "{} link(s) over {} document(s) in {}",
            rows.len(),
            documents.len(),
            path.display()
        )])
    }

    async fn apply(&self, ctx: &mut MigrationContext) -> Result<Vec<StageReport>> {
        let export = export_links(ctx).await.map_err(fail)?;
        info!(matched = export.matched, unmatched = export.unmatched, "links exported");
        let content = migrate_content(ctx).await.map_err(fail)?;
        let distributions = migrate_distributions(ctx).await.map_err(fail)?;
        Ok(vec![content, distributions])
    }
}

struct Masking;

#[async_trait]
impl Stage for Masking {
    fn name(&self) -> &'static str {
        "masking"
    }

    fn description(&self) -> &'static str {
        "Mask personal data on migrated target records"
    }

    fn marker(&self, config: &MigrationConfig) -> String {
        config
            .masking
            .keys()
            .next()
            .map(|object| masking_log_name(object))
            .unwrap_or_else(|| masking_log_name("none"))
    }

    async fn preview(&self, ctx: &mut MigrationContext) -> Result<Vec<String>> {
        Ok(ctx
            .config
            .masking
            .iter()
            .map(|(object, policy)| {
                let fields: Vec<&str> = policy.fields.keys().map(String::as_str).collect();
                format!("{}: {}", object, fields.join(", "))
            })
            .collect())
    }

    async fn apply(&self, ctx: &mut MigrationContext) -> Result<Vec<StageReport>> {
        mask_all(ctx).await.map_err(fail)
    }
}

/// Every stage, in the order `--all` runs them.
fn available_stages() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(PicklistAudit),
        Box::new(ActivityTree),
        Box::new(Email),
        Box::new(Content),
        Box::new(Masking),
    ]
}

// =============================================================================
// Command
// =============================================================================

pub async fn run_migrate_command(
    orgs: &OrgArgs,
    config: MigrationConfig,
    stage_name: Option<&str>,
    list: bool,
    dry_run: bool,
    all: bool,
) -> Result<()> {
    let stages = available_stages();

    if list {
        println!("Available stages:\n");
        for stage in &stages {
            let done = config.output_path(&stage.marker(&config)).exists();
            let status = if done { "[RUN]    " } else { "[PENDING]" };
            println!("  {} {}", status, stage.name());
            println!("      {}\n", stage.description());
        }
        return Ok(());
    }

    let to_run: Vec<_> = if all {
        stages
    } else {
        let name = stage_name.unwrap_or("activity-tree");
        let stage = stages
            .into_iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| miette::miette!("Unknown stage: {}", name))?;
        vec![stage]
    };

    let mut ctx = connect::both(orgs, config).await?;
    info!(run_id = %ctx.run_id, stages = to_run.len(), dry_run, "migration starting");

    for stage in to_run {
        println!("\n=== {} ===", stage.name());
        println!("{}\n", stage.description());

        if dry_run {
            let preview = stage.preview(&mut ctx).await?;
            if preview.is_empty() {
                println!("Dry-run: nothing to do");
            }
            for line in &preview {
                println!("  - {}", line);
            }
        } else {
            let reports = stage.apply(&mut ctx).await?;
            for report in &reports {
                println!("{}: {}", report.object, report.summary());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names_unique() {
        let stages = available_stages();
        let mut names: Vec<&str> = stages.iter().map(|s| s.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), stages.len());
    }

    #[test]
    fn test_picklist_audit_runs_first() {
        let stages = available_stages();
        assert_eq!(stages[0].name(), "picklists");
        assert_eq!(stages[1].name(), "activity-tree");
    }

    #[tokio::test]
    async fn test_list_needs_no_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let config = MigrationConfig {
            output_dir: dir.path().to_path_buf(),
            ..MigrationConfig::default()
        };
        run_migrate_command(&OrgArgs::default(), config, None, true, false, false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_stage_rejected() {
        let err = run_migrate_command(
            &OrgArgs::default(),
            MigrationConfig::default(),
            Some("accounts"),
            false,
            false,
            false,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("Unknown stage"));
    }
}
