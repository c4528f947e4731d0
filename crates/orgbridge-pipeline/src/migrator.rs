//! The generic per-object pipeline.
//!
//! Every object type moves through the same phases:
//!
//! 1. **Fetch** source records selected by condition, id list or parent
//!    mapping.
//! 2. **Filter** records whose parents fall outside the eligibility policy.
//! 3. **Resolve** every reference to its target-org id.
//! 4. **Transform** into target payloads; unresolved required references
//!    skip the record.
//! 5. **Insert** with retries and per-record resubmission.
//! 6. **Record** one outcome per source record and the resulting id mapping.
//!
//! Phases 1-4 make up [`DependencyOrderedMigrator::plan`], which writes
//! nothing to the target and backs dry runs.

use std::collections::{BTreeMap, HashMap, HashSet};

use orgbridge_api::{Filter, Query, Record, RecordExt};
use tracing::{debug, info, warn};

use crate::batch::chunked;
use crate::context::MigrationContext;
use crate::descriptor::{FkTarget, ForeignKey, ObjectDescriptor};
use crate::identity::{IdMapping, dedup_ids};
use crate::markup::referenced_content;
use crate::outcome::{NO_PARENT_MAPPING, OutcomeLog, OutcomeRecord, OutcomeSummary};
use crate::resource_cache::ResourceMigrationRecord;
use crate::transform::{RecordTransform, ResolvedRefs};
use crate::{MigrateError, Result};

/// Skip reason for records whose parents all fail their eligibility condition.
pub const PARENT_NOT_ELIGIBLE: &str = "Parent not eligible";

/// Which source records a stage starts from.
#[derive(Debug, Clone, Copy)]
pub enum SourceSelection<'a> {
    /// Everything matching the descriptor's condition.
    Condition,
    /// Explicit source ids.
    Ids(&'a [String]),
    /// Children whose `field` points at a parent in `parents` (source ids).
    ByParent {
        field: &'a str,
        parents: &'a IdMapping,
    },
    /// Children whose `field` points at one of `parents`, mapped or not.
    ByParentIds {
        field: &'a str,
        parents: &'a [String],
    },
}

/// A record that passed every check and is ready to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedUnit {
    pub source_id: String,
    pub payload: Record,
}

/// Result of the read-only phases.
#[derive(Debug, Default)]
pub struct StagePlan {
    pub object: String,
    pub fetched: usize,
    pub ready: Vec<PreparedUnit>,
    /// Records already decided: skipped, failed before insert, or already
    /// present on the target.
    pub settled: OutcomeLog,
}

/// Result of a stage.
#[derive(Debug, Default)]
pub struct StageReport {
    pub object: String,
    pub outcomes: OutcomeLog,
    /// Source id to target id of every successful record; feeds dependent
    /// stages.
    pub mapping: IdMapping,
}

impl StageReport {
    pub fn empty(object: &str) -> Self {
        Self {
            object: object.to_string(),
            ..Self::default()
        }
    }

    pub fn summary(&self) -> OutcomeSummary {
        self.outcomes.summary()
    }
}

/// References resolved for a batch of source records.
#[derive(Debug, Default)]
struct Resolution {
    refs: HashMap<String, ResolvedRefs>,
    content: HashMap<String, ResourceMigrationRecord>,
    record_type_id: Option<String>,
}

/// Runs one object type through the pipeline.
pub struct DependencyOrderedMigrator<'c> {
    ctx: &'c mut MigrationContext,
    descriptor: ObjectDescriptor,
    provided: HashMap<String, IdMapping>,
}

impl<'c> DependencyOrderedMigrator<'c> {
    pub fn new(ctx: &'c mut MigrationContext, descriptor: ObjectDescriptor) -> Self {
        Self {
            ctx,
            descriptor,
            provided: HashMap::new(),
        }
    }

    /// Supply a mapping for [`FkTarget::Provided`] references named `name`.
    pub fn provide(mut self, name: &str, mapping: &IdMapping) -> Self {
        self.provided.insert(name.to_string(), mapping.clone());
        self
    }

    pub fn descriptor(&self) -> &ObjectDescriptor {
        &self.descriptor
    }

    /// Fetch, filter, resolve and transform without writing to the target.
    #[tracing::instrument(skip(self, selection), fields(object = %self.descriptor.object))]
    pub async fn plan(&mut self, selection: SourceSelection<'_>) -> Result<StagePlan> {
        let records = self.fetch(selection).await?;
        let mut plan = StagePlan {
            object: self.descriptor.object.clone(),
            fetched: records.len(),
            ..StagePlan::default()
        };
        if records.is_empty() {
            info!("no source records selected");
            return Ok(plan);
        }

        match self.prepare(&records, &mut plan.settled).await {
            Ok(ready) => plan.ready = ready,
            Err(e @ MigrateError::RetriesExhausted { .. }) => {
                // a lookup kept failing: every undecided record fails
                let error = e.to_string();
                let settled: HashSet<String> = plan
                    .settled
                    .records()
                    .iter()
                    .map(|r| r.source_id.clone())
                    .collect();
                for id in records.iter().filter_map(|r| r.id()) {
                    if !settled.contains(id) {
                        plan.settled
                            .push(OutcomeRecord::failed(&plan.object, id, &error));
                    }
                }
                warn!(error = %error, "lookup failed, stage records marked failed");
            }
            Err(e) => return Err(e),
        }

        info!(
            fetched = plan.fetched,
            ready = plan.ready.len(),
            settled = plan.settled.len(),
            "stage planned"
        );
        Ok(plan)
    }

    /// Run every phase and return the stage's outcomes and id mapping.
    pub async fn run(&mut self, selection: SourceSelection<'_>) -> Result<StageReport> {
        let plan = self.plan(selection).await?;
        self.submit(plan).await
    }

    /// Insert a plan's ready records and record their outcomes.
    #[tracing::instrument(skip(self, plan), fields(object = %plan.object, ready = plan.ready.len()))]
    pub async fn submit(&mut self, plan: StagePlan) -> Result<StageReport> {
        let StagePlan {
            object,
            ready,
            settled,
            ..
        } = plan;
        let mut outcomes = settled;

        let (source_ids, payloads): (Vec<String>, Vec<Record>) = ready
            .into_iter()
            .map(|unit| (unit.source_id, unit.payload))
            .unzip();
        let results = self
            .ctx
            .retry
            .insert_with_resubmission(
                self.ctx.target.as_ref(),
                &object,
                &payloads,
                self.ctx.config.batch_size,
            )
            .await;

        for (source_id, result) in source_ids.iter().zip(results) {
            match result.id.as_deref() {
                Some(target_id) if result.success => {
                    self.ctx.identities.record(&object, source_id, target_id)?;
                    outcomes.push(OutcomeRecord::success(&object, source_id, target_id));
                }
                _ => outcomes.push(OutcomeRecord::failed(
                    &object,
                    source_id,
                    result.error_message(),
                )),
            }
        }

        let mapping = outcomes.successes();
        info!(summary = %outcomes.summary(), "stage complete");
        Ok(StageReport {
            object,
            outcomes,
            mapping,
        })
    }

    // =========================================================================
    // Fetch
    // =========================================================================

    async fn fetch(&self, selection: SourceSelection<'_>) -> Result<Vec<Record>> {
        let descriptor = &self.descriptor;
        let base = Query::select(descriptor.object.as_str(), descriptor.query_fields())
            .filter_opt(descriptor.condition.as_deref().and_then(Filter::raw));
        let chunk_size = self.ctx.config.query_chunk_size;

        let queries: Vec<Query> = match selection {
            SourceSelection::Condition => vec![base],
            SourceSelection::Ids(ids) => chunked(dedup_ids(ids), chunk_size)
                .map(|chunk| base.clone().filter(Filter::is_in("Id", chunk)))
                .collect(),
            SourceSelection::ByParent { field, parents } => {
                let mut keys: Vec<&String> = parents.keys().collect();
                keys.sort();
                chunked(keys, chunk_size)
                    .map(|chunk| base.clone().filter(Filter::is_in(field, chunk.into_iter().cloned())))
                    .collect()
            }
            SourceSelection::ByParentIds { field, parents } => chunked(dedup_ids(parents), chunk_size)
                .map(|chunk| base.clone().filter(Filter::is_in(field, chunk)))
                .collect(),
        };

        let operation = format!("fetch {}", descriptor.object);
        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for query in &queries {
            let page = self
                .ctx
                .retry
                .execute(&operation, || self.ctx.source.query(query))
                .await
                .into_result(&operation)?;
            for record in page {
                let fresh = record.id().is_some_and(|id| seen.insert(id.to_string()));
                if fresh {
                    records.push(record);
                }
            }
        }
        debug!(count = records.len(), "fetched source records");
        Ok(records)
    }

    // =========================================================================
    // Filter, resolve, transform
    // =========================================================================

    async fn prepare(
        &mut self,
        records: &[Record],
        settled: &mut OutcomeLog,
    ) -> Result<Vec<PreparedUnit>> {
        let object = self.descriptor.object.clone();
        let types = self.classify(records).await?;
        let eligible = self.eligible_parents(records, &types).await?;

        let mut candidates: Vec<&Record> = Vec::new();
        for record in records {
            let Some(id) = record.id() else { continue };
            match self.ineligibility(record, &eligible) {
                Some(reason) => settled.push(OutcomeRecord::ineligible(&object, id, reason)),
                None => candidates.push(record),
            }
        }

        // records that already carry a target twin are done
        let ids: Vec<&str> = candidates.iter().filter_map(|r| r.id()).collect();
        let existing = self.ctx.resolver().resolve(&object, ids).await?;
        if !existing.is_empty() {
            info!(count = existing.len(), "records already present on target");
        }
        candidates.retain(|record| match record.id() {
            Some(id) => match existing.get(id) {
                Some(target_id) => {
                    settled.push(OutcomeRecord::success(&object, id, target_id));
                    false
                }
                None => true,
            },
            None => false,
        });

        let resolution = self.resolve(&candidates, &types, &eligible).await?;
        let transform = RecordTransform::new(&self.descriptor, &self.ctx.config.legacy_id_field);
        let empty = ResolvedRefs::default();

        let mut ready = Vec::new();
        for record in candidates {
            let Some(id) = record.id() else { continue };
            let refs = resolution.refs.get(id).unwrap_or(&empty);
            match transform.build(
                record,
                refs,
                &resolution.content,
                resolution.record_type_id.as_deref(),
            ) {
                Some(payload) => ready.push(PreparedUnit {
                    source_id: id.to_string(),
                    payload,
                }),
                None => {
                    let reason = transform
                        .missing_reference(record, refs)
                        .unwrap_or_else(|| NO_PARENT_MAPPING.to_string());
                    settled.push(OutcomeRecord::missing_mapping(&object, id, reason));
                }
            }
        }
        Ok(ready)
    }

    /// Concrete types of polymorphic parent ids, from the relationship type
    /// path or else the key prefix.
    async fn classify(&mut self, records: &[Record]) -> Result<HashMap<String, String>> {
        let mut types = HashMap::new();
        let mut unknown = Vec::new();
        let mut candidates: Vec<String> = Vec::new();

        for fk in &self.descriptor.foreign_keys {
            let FkTarget::Polymorphic {
                type_path, allowed, ..
            } = &fk.target
            else {
                continue;
            };
            candidates.extend(allowed.iter().cloned());
            for record in records {
                let Some(parent) = record.path_str(&fk.field) else {
                    continue;
                };
                match record.path_str(type_path) {
                    Some(parent_type) => {
                        types.insert(parent.to_string(), parent_type.to_string());
                    }
                    None => unknown.push(parent.to_string()),
                }
            }
        }

        unknown.retain(|id| !types.contains_key(id));
        if unknown.is_empty() {
            return Ok(types);
        }
        if candidates.is_empty() {
            candidates.extend(self.ctx.config.eligibility.keys().cloned());
        }
        let candidates = dedup_ids(candidates);
        let unknown = dedup_ids(unknown);
        types.extend(self.ctx.resolver().object_types(&unknown, &candidates).await?);
        Ok(types)
    }

    /// Parent ids that satisfy their type's eligibility condition.
    async fn eligible_parents(
        &self,
        records: &[Record],
        types: &HashMap<String, String>,
    ) -> Result<HashSet<String>> {
        let mut by_type: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for fk in self.descriptor.foreign_keys.iter().filter(|fk| fk.check_eligibility) {
            for record in records {
                let Some(parent) = record.path_str(&fk.field) else {
                    continue;
                };
                let parent_type = match &fk.target {
                    FkTarget::Object(object) => Some(object),
                    FkTarget::Polymorphic { .. } => types.get(parent),
                    FkTarget::Owner | FkTarget::Provided(_) => None,
                };
                if let Some(parent_type) = parent_type.filter(|t| admits(fk, t)) {
                    by_type
                        .entry(parent_type.clone())
                        .or_default()
                        .push(parent.to_string());
                }
            }
        }

        let filter = self.ctx.eligibility();
        let mut eligible = HashSet::new();
        for (object, ids) in &by_type {
            eligible.extend(filter.eligible(object, ids).await?);
        }
        Ok(eligible)
    }

    fn ineligibility(&self, record: &Record, eligible: &HashSet<String>) -> Option<String> {
        for pattern in &self.descriptor.skip_patterns {
            let matched = record.path_str(&pattern.field).is_some_and(|value| {
                value
                    .to_lowercase()
                    .contains(&pattern.needle.to_lowercase())
            });
            if matched {
                return Some(format!("{} matches '{}'", pattern.field, pattern.needle));
            }
        }

        let parents: Vec<&str> = self
            .descriptor
            .foreign_keys
            .iter()
            .filter(|fk| fk.check_eligibility)
            .filter_map(|fk| record.path_str(&fk.field))
            .collect();
        if parents.is_empty() || parents.iter().any(|p| eligible.contains(*p)) {
            None
        } else {
            Some(PARENT_NOT_ELIGIBLE.to_string())
        }
    }

    async fn resolve(
        &mut self,
        records: &[&Record],
        types: &HashMap<String, String>,
        eligible: &HashSet<String>,
    ) -> Result<Resolution> {
        let mut resolution = Resolution::default();
        if records.is_empty() {
            return Ok(resolution);
        }

        let mut per_field: HashMap<String, IdMapping> = HashMap::new();
        for fk in &self.descriptor.foreign_keys {
            let values: Vec<&str> = records
                .iter()
                .filter_map(|r| r.path_str(&fk.field))
                .filter(|v| !fk.check_eligibility || eligible.contains(*v))
                .collect();
            if values.is_empty() {
                continue;
            }

            let mapping = match &fk.target {
                FkTarget::Object(object) => self.ctx.resolver().resolve(object, values).await?,
                FkTarget::Owner => self.ctx.resolver().resolve_owners(values).await?,
                FkTarget::Provided(name) => match self.provided.get(name) {
                    Some(provided) => values
                        .iter()
                        .filter_map(|v| provided.get(*v).map(|t| (v.to_string(), t.clone())))
                        .collect(),
                    None => {
                        warn!(mapping = %name, "no mapping provided");
                        IdMapping::new()
                    }
                },
                FkTarget::Polymorphic { .. } => {
                    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
                    for value in values {
                        if let Some(parent_type) = types.get(value) {
                            if admits(fk, parent_type) {
                                grouped
                                    .entry(parent_type.clone())
                                    .or_default()
                                    .push(value.to_string());
                            }
                        }
                    }
                    self.ctx.resolver().resolve_grouped(&grouped).await?
                }
            };
            per_field.insert(fk.field.clone(), mapping);
        }

        for record in records {
            let Some(id) = record.id() else { continue };
            let mut refs = ResolvedRefs::default();
            for fk in &self.descriptor.foreign_keys {
                let Some(value) = record.path_str(&fk.field) else {
                    continue;
                };
                let Some(target_id) = per_field.get(&fk.field).and_then(|m| m.get(value)) else {
                    continue;
                };
                refs.set(&fk.field, target_id.clone());
                if let Some(parent_type) = types.get(value) {
                    refs.parent_types
                        .insert(fk.field.clone(), parent_type.clone());
                }
            }
            resolution.refs.insert(id.to_string(), refs);
        }

        let documents: Vec<String> = records
            .iter()
            .flat_map(|record| {
                self.descriptor
                    .rich_text
                    .iter()
                    .filter_map(|field| record.path_str(field))
                    .flat_map(referenced_content)
                    .collect::<Vec<_>>()
            })
            .collect();
        if !documents.is_empty() {
            resolution.content = self.ctx.resolver().resolve_content_documents(&documents).await?;
        }

        if let Some(name) = &self.descriptor.record_type {
            resolution.record_type_id = self
                .ctx
                .resolver()
                .resolve_record_type(&self.descriptor.object, name)
                .await?;
        }
        Ok(resolution)
    }
}

/// Whether a polymorphic reference accepts a parent type.
fn admits(fk: &ForeignKey, parent_type: &str) -> bool {
    match &fk.target {
        FkTarget::Polymorphic { allowed, .. } => {
            allowed.is_empty() || allowed.iter().any(|t| t == parent_type)
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{self, Requirement};
    use crate::{MigrationConfig, Status};
    use orgbridge_api::MemoryOrg;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    const BRANDS: &str = "RecordType.Name = 'Brand'";

    fn context(source: &Arc<MemoryOrg>, target: &Arc<MemoryOrg>) -> MigrationContext {
        let mut config = MigrationConfig::default();
        config.retry.base_delay_ms = 1;
        config.retry.resubmit_delay_ms = 1;
        MigrationContext::new(source.clone(), target.clone(), config)
    }

    fn note() -> ObjectDescriptor {
        ObjectDescriptor::new("Note")
            .fields(&["Title"])
            .foreign_key(ForeignKey::new(
                "ParentId",
                FkTarget::Object("Account".to_string()),
                Requirement::Required,
            ))
    }

    #[tokio::test]
    async fn test_children_of_mapped_parents() {
        let source = Arc::new(MemoryOrg::new());
        let target = Arc::new(MemoryOrg::new());
        let n1 = source.seed("Note", json!({ "Title": "one", "ParentId": "001S1" }));
        let n2 = source.seed("Note", json!({ "Title": "two", "ParentId": "001S2" }));
        target.seed("Account", json!({ "Id": "001T1", "Legacy_Id__c": "001S1" }));
        let mut ctx = context(&source, &target);

        let report = DependencyOrderedMigrator::new(&mut ctx, note())
            .run(SourceSelection::Condition)
            .await
            .unwrap();

        let first = report.outcomes.find(&n1).unwrap();
        assert_eq!(first.status(), Status::Success);
        let second = report.outcomes.find(&n2).unwrap();
        assert_eq!(second.status(), Status::Skipped);
        assert_eq!(second.detail(), NO_PARENT_MAPPING);

        let created = target.records("Note");
        assert_eq!(created.len(), 1);
        assert_eq!(created[0]["ParentId"], json!("001T1"));
        assert_eq!(created[0]["Legacy_Id__c"], json!(n1.clone()));
        assert_eq!(report.mapping.len(), 1);
        assert_eq!(ctx.identities.get("Note", &n1), first.target_id());
    }

    #[tokio::test]
    async fn test_plan_writes_nothing() {
        let source = Arc::new(MemoryOrg::new());
        let target = Arc::new(MemoryOrg::new());
        source.seed("Note", json!({ "Title": "one", "ParentId": "001S1" }));
        target.seed("Account", json!({ "Id": "001T1", "Legacy_Id__c": "001S1" }));
        let mut ctx = context(&source, &target);

        let plan = DependencyOrderedMigrator::new(&mut ctx, note())
            .plan(SourceSelection::Condition)
            .await
            .unwrap();
        assert_eq!(plan.ready.len(), 1);
        assert_eq!(target.call_count("insert_batch"), 0);
    }

    #[tokio::test]
    async fn test_rerun_reports_existing_records() {
        let source = Arc::new(MemoryOrg::new());
        let target = Arc::new(MemoryOrg::new());
        let n1 = source.seed("Note", json!({ "Title": "one", "ParentId": "001S1" }));
        target.seed("Account", json!({ "Id": "001T1", "Legacy_Id__c": "001S1" }));

        let mut first = context(&source, &target);
        DependencyOrderedMigrator::new(&mut first, note())
            .run(SourceSelection::Ids(&[n1.clone()]))
            .await
            .unwrap();

        let mut second = context(&source, &target);
        let report = DependencyOrderedMigrator::new(&mut second, note())
            .run(SourceSelection::Ids(&[n1.clone()]))
            .await
            .unwrap();
        assert_eq!(report.summary().success, 1);
        assert_eq!(target.records("Note").len(), 1);
        assert_eq!(target.call_count("insert_batch:Note"), 1);
    }

    #[tokio::test]
    async fn test_ineligible_parent_skipped() {
        let source = Arc::new(MemoryOrg::new());
        let target = Arc::new(MemoryOrg::new());
        let brand = source.seed("Account", json!({ "RecordType": { "Name": "Brand" } }));
        let person = source.seed("Account", json!({ "RecordType": { "Name": "Person" } }));
        source.register_condition("Account", BRANDS, |r| {
            r.path_str("RecordType.Name") == Some("Brand")
        });
        let t1 = source.seed(
            "Task",
            json!({ "Subject": "a", "WhatId": brand, "What": { "Type": "Account" } }),
        );
        let t2 = source.seed(
            "Task",
            json!({ "Subject": "b", "WhatId": person, "What": { "Type": "Account" } }),
        );
        target.seed("Account", json!({ "Legacy_Id__c": brand }));
        target.seed("Account", json!({ "Legacy_Id__c": person }));

        let mut ctx = context(&source, &target);
        ctx.config
            .eligibility
            .insert("Account".to_string(), BRANDS.to_string());

        let report = DependencyOrderedMigrator::new(&mut ctx, descriptor::task())
            .run(SourceSelection::Condition)
            .await
            .unwrap();
        assert_eq!(report.outcomes.find(&t1).unwrap().status(), Status::Success);
        let skipped = report.outcomes.find(&t2).unwrap();
        assert_eq!(skipped.status(), Status::Skipped);
        assert_eq!(skipped.detail(), PARENT_NOT_ELIGIBLE);
    }

    #[tokio::test]
    async fn test_polymorphic_type_from_key_prefix() {
        let source = Arc::new(MemoryOrg::new());
        let target = Arc::new(MemoryOrg::new());
        let contact = source.seed("Contact", json!({}));
        let task = source.seed("Task", json!({ "Subject": "call", "WhoId": contact }));
        target.seed("Contact", json!({ "Id": "003T1", "Legacy_Id__c": contact }));

        let mut ctx = context(&source, &target);
        ctx.config.eligibility.insert("Contact".to_string(), String::new());

        let report = DependencyOrderedMigrator::new(&mut ctx, descriptor::task())
            .run(SourceSelection::Condition)
            .await
            .unwrap();
        assert_eq!(report.outcomes.find(&task).unwrap().status(), Status::Success);
        assert_eq!(target.records("Task")[0]["WhoId"], json!("003T1"));
    }

    #[tokio::test]
    async fn test_skip_pattern_marks_ineligible() {
        let source = Arc::new(MemoryOrg::new());
        let target = Arc::new(MemoryOrg::new());
        let item = source.seed(
            "FeedItem",
            json!({ "ParentId": "00TS1", "Body": "Status Changed To Closed" }),
        );
        let mapping = IdMapping::from([("00TS1".to_string(), "00TT1".to_string())]);
        let mut ctx = context(&source, &target);

        let report = DependencyOrderedMigrator::new(&mut ctx, descriptor::feed_item())
            .provide("parent", &mapping)
            .run(SourceSelection::ByParent {
                field: "ParentId",
                parents: &mapping,
            })
            .await
            .unwrap();
        assert_eq!(report.outcomes.find(&item).unwrap().status(), Status::Skipped);
        assert!(target.records("FeedItem").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_insert_is_failed_outcome() {
        let source = Arc::new(MemoryOrg::new());
        let target = Arc::new(MemoryOrg::new());
        let n1 = source.seed("Note", json!({ "Title": "bad", "ParentId": "001S1" }));
        let n2 = source.seed("Note", json!({ "Title": "good", "ParentId": "001S1" }));
        target.seed("Account", json!({ "Id": "001T1", "Legacy_Id__c": "001S1" }));
        target.reject_when("Note", "Title", json!("bad"), "Title not allowed", None);
        let mut ctx = context(&source, &target);

        let report = DependencyOrderedMigrator::new(&mut ctx, note())
            .run(SourceSelection::Condition)
            .await
            .unwrap();
        let failed = report.outcomes.find(&n1).unwrap();
        assert_eq!(failed.status(), Status::Failed);
        assert!(failed.detail().contains("Title not allowed"));
        assert_eq!(report.outcomes.find(&n2).unwrap().status(), Status::Success);
    }

    #[tokio::test]
    async fn test_malformed_eligibility_condition_aborts() {
        let source = Arc::new(MemoryOrg::new());
        let target = Arc::new(MemoryOrg::new());
        let account = source.seed("Account", json!({}));
        source.seed(
            "Task",
            json!({ "Subject": "a", "WhatId": account, "What": { "Type": "Account" } }),
        );
        target.seed("Account", json!({ "Legacy_Id__c": account }));

        let mut ctx = context(&source, &target);
        ctx.config
            .eligibility
            .insert("Account".to_string(), "Bogus__c = ".to_string());

        let err = DependencyOrderedMigrator::new(&mut ctx, descriptor::task())
            .run(SourceSelection::Condition)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Rejected { .. }));
        assert_eq!(source.call_count("query:Account"), 1);
        assert_eq!(target.call_count("insert_batch"), 0);
    }

    #[tokio::test]
    async fn test_exhausted_lookup_fails_undecided_records() {
        let source = Arc::new(MemoryOrg::new());
        let target = Arc::new(MemoryOrg::new());
        let n1 = source.seed("Note", json!({ "Title": "one", "ParentId": "001S1" }));
        target.seed("Account", json!({ "Id": "001T1", "Legacy_Id__c": "001S1" }));
        target.fail_next_calls(10);
        let mut ctx = context(&source, &target);

        let report = DependencyOrderedMigrator::new(&mut ctx, note())
            .run(SourceSelection::Condition)
            .await
            .unwrap();
        let failed = report.outcomes.find(&n1).unwrap();
        assert_eq!(failed.status(), Status::Failed);
        assert!(failed.detail().contains("failed after 4 attempts"));
        assert!(target.records("Note").is_empty());
    }
}
