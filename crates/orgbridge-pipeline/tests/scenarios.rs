//! End-to-end runs of the activity tree against in-memory orgs.

use std::collections::HashSet;
use std::sync::Arc;

use orgbridge_api::{MemoryOrg, OrgApi};
use orgbridge_pipeline::outcome::NO_PARENT_MAPPING;
use orgbridge_pipeline::resource_cache::LINK_KIND;
use orgbridge_pipeline::stages::activities::{Activity, migrate_activities};
use orgbridge_pipeline::stages::files::FILES_STAGE;
use orgbridge_pipeline::stages::tree::run_activity_tree;
use orgbridge_pipeline::{MigrationConfig, MigrationContext, Status};
use pretty_assertions::assert_eq;
use serde_json::json;

struct Orgs {
    source: Arc<MemoryOrg>,
    target: Arc<MemoryOrg>,
    dir: tempfile::TempDir,
}

impl Orgs {
    fn new() -> Self {
        Self {
            source: Arc::new(MemoryOrg::new()),
            target: Arc::new(MemoryOrg::new()),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn context(&self) -> MigrationContext {
        let config = MigrationConfig {
            output_dir: self.dir.path().to_path_buf(),
            ..MigrationConfig::default()
        };
        MigrationContext::new(
            Arc::clone(&self.source) as Arc<dyn OrgApi>,
            Arc::clone(&self.target) as Arc<dyn OrgApi>,
            config,
        )
    }

    fn task_on(&self, parent: &str) -> String {
        self.source.seed(
            "Task",
            json!({ "Subject": "Call back", "WhatId": parent, "What": { "Type": "Account" } }),
        )
    }
}

// Two accounts with target twins and one without
fn seed_accounts(orgs: &Orgs) -> (String, String, String) {
    let p1 = orgs.source.seed("Account", json!({ "Name": "Resolvable" }));
    let p2 = orgs.source.seed("Account", json!({ "Name": "Unresolvable" }));
    let p3 = orgs.source.seed("Account", json!({ "Name": "Also resolvable" }));
    orgs.target
        .seed("Account", json!({ "Id": "001T1", "Legacy_Id__c": p1 }));
    orgs.target
        .seed("Account", json!({ "Id": "001T3", "Legacy_Id__c": p3 }));
    (p1, p2, p3)
}

#[tokio::test]
async fn test_activity_with_unresolvable_parent_is_skipped() {
    let orgs = Orgs::new();
    let (p1, p2, _) = seed_accounts(&orgs);
    let a1 = orgs.task_on(&p1);
    let a2 = orgs.task_on(&p2);

    let mut ctx = orgs.context();
    let report = migrate_activities(&mut ctx, Activity::Task, None).await.unwrap();

    let first = report.outcomes.find(&a1).unwrap();
    assert_eq!(first.status(), Status::Success);
    let created = first.target_id().unwrap();
    assert_eq!(
        orgs.target.record("Task", created).unwrap()["WhatId"],
        json!("001T1")
    );

    let second = report.outcomes.find(&a2).unwrap();
    assert_eq!(second.status(), Status::Skipped);
    assert_eq!(second.detail(), NO_PARENT_MAPPING);
    assert_eq!(orgs.target.records("Task").len(), 1);
}

#[tokio::test]
async fn test_shared_document_links_only_migrated_parents() {
    let orgs = Orgs::new();
    let (p1, p2, p3) = seed_accounts(&orgs);
    let a1 = orgs.task_on(&p1);
    let a2 = orgs.task_on(&p2);
    let a3 = orgs.task_on(&p3);

    let document = orgs.source.seed("ContentDocument", json!({}));
    let version = orgs.source.seed(
        "ContentVersion",
        json!({
            "ContentDocumentId": document,
            "IsLatest": true,
            "Title": "Minutes",
            "PathOnClient": "minutes.txt",
            "ContentSize": 7,
        }),
    );
    orgs.source
        .seed_blob("ContentVersion", &version, b"minutes".to_vec());
    for task in [&a1, &a2, &a3] {
        orgs.source.seed(
            LINK_KIND,
            json!({ "ContentDocumentId": document, "LinkedEntityId": task, "ShareType": "V" }),
        );
    }

    let mut ctx = orgs.context();
    let tree = run_activity_tree(&mut ctx).await.unwrap();

    let tasks = tree.stage("Task").unwrap();
    assert_eq!(tasks.summary().success, 2);
    assert_eq!(tasks.summary().skipped, 1);

    assert_eq!(orgs.target.call_count("create:ContentVersion"), 1);
    let links = orgs.target.records(LINK_KIND);
    assert_eq!(links.len(), 2);
    let linked: HashSet<String> = links
        .iter()
        .filter_map(|l| l["LinkedEntityId"].as_str().map(str::to_string))
        .collect();
    let expected: HashSet<String> = [&a1, &a3]
        .into_iter()
        .map(|a| tasks.mapping[a].clone())
        .collect();
    assert_eq!(linked, expected);

    let files = tree.stage(FILES_STAGE).unwrap();
    let unsuccessful: Vec<_> = files
        .outcomes
        .records()
        .iter()
        .filter(|r| r.kind == LINK_KIND && r.status() != Status::Success)
        .collect();
    assert_eq!(unsuccessful.len(), 1);
    assert!(files.mapping.contains_key(&document));
}

#[tokio::test]
async fn test_rerun_creates_nothing_new() {
    let orgs = Orgs::new();
    let (p1, _, p3) = seed_accounts(&orgs);
    let a1 = orgs.task_on(&p1);
    let a3 = orgs.task_on(&p3);
    let document = orgs.source.seed("ContentDocument", json!({}));
    let version = orgs.source.seed(
        "ContentVersion",
        json!({ "ContentDocumentId": document, "IsLatest": true, "Title": "Deck", "ContentSize": 4 }),
    );
    orgs.source.seed_blob("ContentVersion", &version, b"deck".to_vec());
    for task in [&a1, &a3] {
        orgs.source.seed(
            LINK_KIND,
            json!({ "ContentDocumentId": document, "LinkedEntityId": task }),
        );
    }

    let mut first = orgs.context();
    let before = run_activity_tree(&mut first).await.unwrap();

    let mut second = orgs.context();
    let after = run_activity_tree(&mut second).await.unwrap();

    assert_eq!(orgs.target.records("Task").len(), 2);
    assert_eq!(orgs.target.call_count("create:ContentVersion"), 1);
    assert_eq!(orgs.target.records(LINK_KIND).len(), 2);
    assert_eq!(
        before.stage("Task").unwrap().mapping,
        after.stage("Task").unwrap().mapping
    );
    assert_eq!(after.summary().failed, 0);
}
