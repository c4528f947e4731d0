//! The full activity tree, parents first.

use tracing::info;

use crate::context::MigrationContext;
use crate::identity::IdMapping;
use crate::migrator::StageReport;
use crate::outcome::OutcomeSummary;
use crate::stages::activities::{Activity, migrate_activities};
use crate::stages::attachments::migrate_attachments;
use crate::stages::feed::{migrate_feed_comments, migrate_feed_items};
use crate::stages::files::migrate_files;
use crate::Result;

/// Reports of every stage of a tree run, in execution order.
#[derive(Debug, Default)]
pub struct TreeReport {
    pub stages: Vec<StageReport>,
}

impl TreeReport {
    pub fn stage(&self, object: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.object == object)
    }

    /// Totals across every stage.
    pub fn summary(&self) -> OutcomeSummary {
        self.stages
            .iter()
            .map(StageReport::summary)
            .fold(OutcomeSummary::default(), |mut total, s| {
                total.success += s.success;
                total.failed += s.failed;
                total.skipped += s.skipped;
                total
            })
    }
}

/// Migrate tasks, events, their attachments and files, then feed items and
/// comments. Each stage only sees the records its parent stage migrated.
#[tracing::instrument(skip_all, fields(run_id = %ctx.run_id))]
pub async fn run_activity_tree(ctx: &mut MigrationContext) -> Result<TreeReport> {
    let mut tree = TreeReport::default();

    let mut activities = IdMapping::new();
    for activity in Activity::ALL {
        let report = migrate_activities(ctx, activity, None).await?;
        activities.extend(report.mapping.clone());
        tree.stages.push(report);
    }
    info!(activities = activities.len(), "activities migrated");

    tree.stages.push(migrate_attachments(ctx, &activities).await?);
    tree.stages.push(migrate_files(ctx, &activities).await?);

    let items = migrate_feed_items(ctx, &activities).await?;
    let comments = migrate_feed_comments(ctx, &items).await?;
    tree.stages.push(items);
    tree.stages.push(comments);

    info!(summary = %tree.summary(), "activity tree complete");
    Ok(tree)
}
