//! Object-specific stages built on the generic pipeline.
//!
//! Each stage takes the [`MigrationContext`] and the mappings produced by the
//! stages it depends on, and returns a [`StageReport`] whose mapping feeds
//! the next one.

pub mod activities;
pub mod attachments;
pub mod content;
pub mod email;
pub mod feed;
pub mod files;
pub mod masking;
pub mod picklists;
pub mod tree;

use orgbridge_api::{Filter, Query, Record};

use crate::audit::write_outcomes;
use crate::batch::chunked;
use crate::context::MigrationContext;
use crate::identity::dedup_ids;
use crate::migrator::StageReport;
use crate::Result;

/// Outcome log file for a stage.
pub fn log_file_name(object: &str) -> String {
    format!("{}_import_log.csv", object)
}

/// Write a report's outcome log under the output directory.
pub fn write_report(ctx: &MigrationContext, report: &StageReport) -> Result<()> {
    write_outcomes(&ctx.output_path(&log_file_name(&report.object)), &report.outcomes)
}

/// Source records of `object` whose `field` is one of `values`, chunked to
/// the query limit.
pub(crate) async fn fetch_where_in<I, S>(
    ctx: &MigrationContext,
    object: &str,
    fields: &[&str],
    field: &str,
    values: I,
    extra: Option<Filter>,
) -> Result<Vec<Record>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let operation = format!("fetch {}", object);
    let mut records = Vec::new();
    for chunk in chunked(dedup_ids(values), ctx.config.query_chunk_size) {
        let query = Query::select(object, fields.iter().copied())
            .filter(Filter::is_in(field, chunk))
            .filter_opt(extra.clone());
        let page = ctx
            .retry
            .execute(&operation, || ctx.source.query(&query))
            .await
            .into_result(&operation)?;
        records.extend(page);
    }
    Ok(records)
}
