//! Feed posts and their comments.

use tracing::info;

use crate::audit::read_columns;
use crate::context::MigrationContext;
use crate::descriptor;
use crate::identity::IdMapping;
use crate::migrator::{DependencyOrderedMigrator, SourceSelection, StageReport};
use crate::outcome::Status;
use crate::stages::{log_file_name, write_report};
use crate::Result;

pub const FEED_ITEM: &str = "FeedItem";
pub const FEED_COMMENT: &str = "FeedComment";

/// Migrate feed items posted on the records in `parents` (source to target).
#[tracing::instrument(skip_all, fields(parents = parents.len()))]
pub async fn migrate_feed_items(
    ctx: &mut MigrationContext,
    parents: &IdMapping,
) -> Result<StageReport> {
    if parents.is_empty() {
        return Ok(StageReport::empty(FEED_ITEM));
    }
    let descriptor = ctx.descriptor(descriptor::feed_item());
    let report = DependencyOrderedMigrator::new(ctx, descriptor)
        .provide("parent", parents)
        .run(SourceSelection::ByParent {
            field: "ParentId",
            parents,
        })
        .await?;
    write_report(ctx, &report)?;
    Ok(report)
}

/// Target equivalents of every eligible record of the configured parent
/// objects.
pub async fn eligible_feed_parents(ctx: &mut MigrationContext) -> Result<IdMapping> {
    let objects: Vec<String> = ctx.config.eligibility.keys().cloned().collect();
    let mut parents = IdMapping::new();
    for object in &objects {
        let eligible = ctx.eligibility().eligible_parents(object).await?;
        let resolved = ctx.resolver().resolve(object, &eligible).await?;
        info!(
            object = %object,
            eligible = eligible.len(),
            resolved = resolved.len(),
            "feed parents resolved"
        );
        parents.extend(resolved);
    }
    Ok(parents)
}

/// Migrate feed items of every eligible, already migrated parent record.
pub async fn migrate_parent_feed(ctx: &mut MigrationContext) -> Result<StageReport> {
    let parents = eligible_feed_parents(ctx).await?;
    migrate_feed_items(ctx, &parents).await
}

/// Migrate comments of every feed item the item stage selected.
///
/// Comments on items that did not migrate are skipped.
pub async fn migrate_feed_comments(
    ctx: &mut MigrationContext,
    items: &StageReport,
) -> Result<StageReport> {
    let attempted: Vec<String> = items
        .outcomes
        .records()
        .iter()
        .map(|r| r.source_id.clone())
        .collect();
    migrate_comments_of(ctx, &attempted, &items.mapping).await
}

/// Migrate comments using the feed item outcome log of an earlier run.
pub async fn migrate_logged_feed_comments(ctx: &mut MigrationContext) -> Result<StageReport> {
    let rows = read_columns(
        &ctx.output_path(&log_file_name(FEED_ITEM)),
        &["Source_Id", "Target_Id", "Status"],
    )?;
    let success = Status::Success.to_string();
    let mut attempted = Vec::with_capacity(rows.len());
    let mut migrated = IdMapping::new();
    for row in rows {
        let [source, target, status] = <[String; 3]>::try_from(row).unwrap_or_default();
        if source.is_empty() {
            continue;
        }
        if status == success && !target.is_empty() {
            migrated.insert(source.clone(), target);
        }
        attempted.push(source);
    }
    migrate_comments_of(ctx, &attempted, &migrated).await
}

#[tracing::instrument(skip_all, fields(items = attempted.len(), migrated = migrated.len()))]
async fn migrate_comments_of(
    ctx: &mut MigrationContext,
    attempted: &[String],
    migrated: &IdMapping,
) -> Result<StageReport> {
    if attempted.is_empty() {
        return Ok(StageReport::empty(FEED_COMMENT));
    }
    let descriptor = ctx.descriptor(descriptor::feed_comment());
    let report = DependencyOrderedMigrator::new(ctx, descriptor)
        .provide(FEED_ITEM, migrated)
        .run(SourceSelection::ByParentIds {
            field: "FeedItemId",
            parents: attempted,
        })
        .await?;
    write_report(ctx, &report)?;
    Ok(report)
}
