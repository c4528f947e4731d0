//! One subcommand per stage.
//!
//! Stages that depend on an earlier one read its outcome log or mapping
//! table from the output directory, so they can run in separate
//! invocations.

use std::path::PathBuf;

use miette::Result;
use orgbridge_pipeline::audit::read_successful;
use orgbridge_pipeline::stages::activities::{Activity, migrate_activities, plan_activities};
use orgbridge_pipeline::stages::attachments::migrate_attachments;
use orgbridge_pipeline::stages::content::{export_links, migrate_content, migrate_distributions};
use orgbridge_pipeline::stages::email::{migrate_email_messages_from_table, migrate_email_templates};
use orgbridge_pipeline::stages::feed::{
    migrate_feed_items, migrate_logged_feed_comments, migrate_parent_feed,
};
use orgbridge_pipeline::stages::files::migrate_files;
use orgbridge_pipeline::stages::log_file_name;
use orgbridge_pipeline::stages::masking::{mask_all, mask_object};
use orgbridge_pipeline::stages::picklists::{PICKLIST_AUDIT_FILE, audit_picklists};
use orgbridge_pipeline::{IdMapping, MigrationConfig, MigrationContext, StagePlan, StageReport};
use tracing::warn;

use crate::connect::{self, OrgArgs};

pub(crate) fn fail(e: impl std::fmt::Display) -> miette::Report {
    miette::miette!("{}", e)
}

pub(crate) fn print_report(ctx: &MigrationContext, report: &StageReport) {
    println!("{}: {}", report.object, report.summary());
    println!(
        "  log: {}",
        ctx.output_path(&log_file_name(&report.object)).display()
    );
}

pub(crate) fn print_plan(plan: &StagePlan) {
    println!(
        "{}: {} fetched, {} ready to insert, {}",
        plan.object,
        plan.fetched,
        plan.ready.len(),
        plan.settled.summary()
    );
    for record in plan.settled.records() {
        println!("  - {} {} {}", record.source_id, record.status(), record.detail());
    }
}

/// Successful activities of earlier runs, from explicit tables or the
/// default task and event logs.
pub(crate) fn activity_mapping(config: &MigrationConfig, tables: &[PathBuf]) -> Result<IdMapping> {
    let mut mapping = IdMapping::new();
    if !tables.is_empty() {
        for table in tables {
            mapping.extend(read_successful(table).map_err(fail)?);
        }
        return Ok(mapping);
    }
    for activity in Activity::ALL {
        let path = config.output_path(&log_file_name(activity.object()));
        if path.exists() {
            mapping.extend(read_successful(&path).map_err(fail)?);
        } else {
            warn!(path = %path.display(), "activity log not found");
        }
    }
    Ok(mapping)
}

pub async fn activities(
    orgs: &OrgArgs,
    config: MigrationConfig,
    activity: Activity,
    ids: Vec<String>,
    dry_run: bool,
) -> Result<()> {
    let mut ctx = connect::both(orgs, config).await?;
    let ids = (!ids.is_empty()).then_some(ids.as_slice());
    if dry_run {
        let plan = plan_activities(&mut ctx, activity, ids).await.map_err(fail)?;
        print_plan(&plan);
        return Ok(());
    }
    let report = migrate_activities(&mut ctx, activity, ids).await.map_err(fail)?;
    print_report(&ctx, &report);
    Ok(())
}

pub async fn attachments(orgs: &OrgArgs, config: MigrationConfig, tables: Vec<PathBuf>) -> Result<()> {
    let parents = activity_mapping(&config, &tables)?;
    let mut ctx = connect::both(orgs, config).await?;
    let report = migrate_attachments(&mut ctx, &parents).await.map_err(fail)?;
    print_report(&ctx, &report);
    Ok(())
}

pub async fn files(orgs: &OrgArgs, config: MigrationConfig, tables: Vec<PathBuf>) -> Result<()> {
    let activities = activity_mapping(&config, &tables)?;
    let mut ctx = connect::both(orgs, config).await?;
    let report = migrate_files(&mut ctx, &activities).await.map_err(fail)?;
    print_report(&ctx, &report);
    Ok(())
}

pub async fn feed(
    orgs: &OrgArgs,
    config: MigrationConfig,
    eligible_parents: bool,
    tables: Vec<PathBuf>,
) -> Result<()> {
    let report = if eligible_parents {
        let mut ctx = connect::both(orgs, config).await?;
        let report = migrate_parent_feed(&mut ctx).await.map_err(fail)?;
        print_report(&ctx, &report);
        report
    } else {
        let parents = activity_mapping(&config, &tables)?;
        let mut ctx = connect::both(orgs, config).await?;
        let report = migrate_feed_items(&mut ctx, &parents).await.map_err(fail)?;
        print_report(&ctx, &report);
        report
    };
    if report.outcomes.is_empty() {
        println!("  no feed items selected");
    }
    Ok(())
}

pub async fn feed_comments(orgs: &OrgArgs, config: MigrationConfig) -> Result<()> {
    let mut ctx = connect::both(orgs, config).await?;
    let report = migrate_logged_feed_comments(&mut ctx).await.map_err(fail)?;
    print_report(&ctx, &report);
    Ok(())
}

pub async fn email_templates(orgs: &OrgArgs, config: MigrationConfig) -> Result<()> {
    let mut ctx = connect::both(orgs, config).await?;
    let report = migrate_email_templates(&mut ctx).await.map_err(fail)?;
    print_report(&ctx, &report);
    Ok(())
}

pub async fn email_messages(orgs: &OrgArgs, config: MigrationConfig) -> Result<()> {
    let mut ctx = connect::both(orgs, config).await?;
    let report = migrate_email_messages_from_table(&mut ctx).await.map_err(fail)?;
    print_report(&ctx, &report);
    Ok(())
}

pub async fn content_export(orgs: &OrgArgs, config: MigrationConfig) -> Result<()> {
    let mut ctx = connect::both(orgs, config).await?;
    let export = export_links(&mut ctx).await.map_err(fail)?;
    println!(
        "ContentDocumentLink: {} matched, {} unmatched",
        export.matched, export.unmatched
    );
    Ok(())
}

pub async fn content_migrate(orgs: &OrgArgs, config: MigrationConfig) -> Result<()> {
    let mut ctx = connect::both(orgs, config).await?;
    let report = migrate_content(&mut ctx).await.map_err(fail)?;
    print_report(&ctx, &report);
    Ok(())
}

pub async fn content_distributions(orgs: &OrgArgs, config: MigrationConfig) -> Result<()> {
    let mut ctx = connect::both(orgs, config).await?;
    let report = migrate_distributions(&mut ctx).await.map_err(fail)?;
    print_report(&ctx, &report);
    Ok(())
}

pub async fn mask(orgs: &OrgArgs, config: MigrationConfig, object: Option<String>) -> Result<()> {
    let ctx = connect::target_only(orgs, config).await?;
    let reports = match object {
        Some(object) => {
            let policy = ctx
                .config
                .masking
                .get(&object)
                .cloned()
                .ok_or_else(|| miette::miette!("no masking policy configured for {}", object))?;
            vec![mask_object(&ctx, &object, &policy).await.map_err(fail)?]
        }
        None => mask_all(&ctx).await.map_err(fail)?,
    };
    if reports.is_empty() {
        println!("No masking policies configured.");
    }
    for report in &reports {
        println!("{}: {}", report.object, report.summary());
    }
    Ok(())
}

pub async fn picklists(orgs: &OrgArgs, config: MigrationConfig, objects: Vec<String>) -> Result<()> {
    let ctx = connect::target_only(orgs, config).await?;
    let inactive = audit_picklists(&ctx, &objects).await.map_err(fail)?;
    println!(
        "{} inactive picklist value(s) written to {}",
        inactive.len(),
        ctx.output_path(PICKLIST_AUDIT_FILE).display()
    );
    Ok(())
}
