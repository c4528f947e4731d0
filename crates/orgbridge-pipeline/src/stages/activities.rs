//! Tasks and events.

use std::fmt;
use std::str::FromStr;

use crate::context::MigrationContext;
use crate::descriptor::{self, ObjectDescriptor};
use crate::migrator::{DependencyOrderedMigrator, SourceSelection, StagePlan, StageReport};
use crate::stages::write_report;
use crate::{MigrateError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Activity {
    Task,
    Event,
}

impl Activity {
    pub const ALL: [Activity; 2] = [Activity::Task, Activity::Event];

    pub fn object(&self) -> &'static str {
        match self {
            Activity::Task => "Task",
            Activity::Event => "Event",
        }
    }

    pub fn descriptor(&self) -> ObjectDescriptor {
        match self {
            Activity::Task => descriptor::task(),
            Activity::Event => descriptor::event(),
        }
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.object())
    }
}

impl FromStr for Activity {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "task" => Ok(Activity::Task),
            "event" => Ok(Activity::Event),
            other => Err(MigrateError::Config(format!("unknown activity type '{}'", other))),
        }
    }
}

fn selection(ids: Option<&[String]>) -> SourceSelection<'_> {
    ids.map_or(SourceSelection::Condition, SourceSelection::Ids)
}

/// Migrate tasks or events selected by the configured condition, or by
/// explicit source ids.
#[tracing::instrument(skip(ctx, ids), fields(activity = %activity))]
pub async fn migrate_activities(
    ctx: &mut MigrationContext,
    activity: Activity,
    ids: Option<&[String]>,
) -> Result<StageReport> {
    let descriptor = ctx.descriptor(activity.descriptor());
    let report = DependencyOrderedMigrator::new(ctx, descriptor)
        .run(selection(ids))
        .await?;
    write_report(ctx, &report)?;
    Ok(report)
}

/// What [`migrate_activities`] would do, without writing to the target.
pub async fn plan_activities(
    ctx: &mut MigrationContext,
    activity: Activity,
    ids: Option<&[String]>,
) -> Result<StagePlan> {
    let descriptor = ctx.descriptor(activity.descriptor());
    DependencyOrderedMigrator::new(ctx, descriptor)
        .plan(selection(ids))
        .await
}
