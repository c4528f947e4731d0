//! Per-object migration descriptors.
//!
//! A descriptor tells the generic pipeline what to fetch, which references to
//! resolve and how strictly, and how to shape the payload. The built-in
//! descriptors below cover the objects this tool migrates; configuration can
//! override their field lists, conditions and record types.

use std::collections::BTreeMap;

use orgbridge_api::Record;
use serde_json::Value;

use crate::MigrationConfig;
use crate::outcome::NO_PARENT_MAPPING;

/// Fields the target org sets itself and never accepts on insert.
pub const READ_ONLY_FIELDS: &[&str] = &[
    "Id",
    "LastModifiedDate",
    "LastModifiedById",
    "SystemModstamp",
    "IsDeleted",
    "attributes",
];

/// How a reference field is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FkTarget {
    /// A fixed object, resolved through its legacy id.
    Object(String),
    /// A polymorphic reference. The concrete type comes from `type_path`
    /// (e.g. `What.Type`) or, failing that, the id's key prefix.
    Polymorphic {
        type_path: String,
        /// Allowed concrete types; empty allows any.
        allowed: Vec<String>,
        /// Extra lookup field to fill when the parent is of a given type.
        mirror: BTreeMap<String, String>,
    },
    /// Owner or creator: users, queues, integration-user fallback.
    Owner,
    /// A mapping handed in by the caller under this name (prior stage
    /// output or an input table).
    Provided(String),
}

/// How a missing resolution affects the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Skip the record when unresolved.
    Required,
    /// Skip only if the source had a value that did not resolve.
    IfPresent,
    /// Omit the field when unresolved.
    Optional,
}

/// A reference field and its resolution policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub field: String,
    pub target: FkTarget,
    pub requirement: Requirement,
    /// Whether the parent's eligibility condition gates the record.
    pub check_eligibility: bool,
    /// Skip reason reported when the requirement is not met.
    pub missing_reason: String,
}

impl ForeignKey {
    pub fn new(field: &str, target: FkTarget, requirement: Requirement) -> Self {
        Self {
            field: field.to_string(),
            target,
            requirement,
            check_eligibility: false,
            missing_reason: NO_PARENT_MAPPING.to_string(),
        }
    }

    pub fn polymorphic(field: &str, type_path: &str) -> Self {
        Self::new(
            field,
            FkTarget::Polymorphic {
                type_path: type_path.to_string(),
                allowed: Vec::new(),
                mirror: BTreeMap::new(),
            },
            Requirement::Optional,
        )
    }

    pub fn requirement(mut self, requirement: Requirement) -> Self {
        self.requirement = requirement;
        self
    }

    pub fn eligibility(mut self) -> Self {
        self.check_eligibility = true;
        self
    }

    pub fn missing_reason(mut self, reason: &str) -> Self {
        self.missing_reason = reason.to_string();
        self
    }

    pub fn allowed_types(mut self, types: &[String]) -> Self {
        if let FkTarget::Polymorphic { allowed, .. } = &mut self.target {
            *allowed = types.to_vec();
        }
        self
    }

    pub fn mirror(mut self, parent_type: &str, field: &str) -> Self {
        if let FkTarget::Polymorphic { mirror, .. } = &mut self.target {
            mirror.insert(parent_type.to_string(), field.to_string());
        }
        self
    }

    /// Relationship path to select alongside the id, if any.
    pub fn type_path(&self) -> Option<&str> {
        match &self.target {
            FkTarget::Polymorphic { type_path, .. } => Some(type_path),
            _ => None,
        }
    }
}

/// A substring that marks a record as out of scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipPattern {
    pub field: String,
    pub needle: String,
}

/// Everything the generic pipeline needs to migrate one object type.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDescriptor {
    pub object: String,
    /// Plain fields copied into the payload when non-null.
    pub fields: Vec<String>,
    /// Source-side selection condition.
    pub condition: Option<String>,
    pub foreign_keys: Vec<ForeignKey>,
    /// At least one of these reference fields must resolve.
    pub required_any: Vec<String>,
    /// Extra fields removed from the payload on top of [`READ_ONLY_FIELDS`].
    pub strip: Vec<String>,
    /// Fixed values set on every payload.
    pub constants: Record,
    /// Target record type developer name.
    pub record_type: Option<String>,
    /// Bodies whose inline images are rewritten.
    pub rich_text: Vec<String>,
    /// Boolean field telling whether the body is rich text; plain bodies
    /// lose their markup.
    pub rich_text_flag: Option<String>,
    /// Reference field filled from the first inline image when empty.
    pub inline_image_reference: Option<String>,
    pub skip_patterns: Vec<SkipPattern>,
}

impl ObjectDescriptor {
    pub fn new(object: &str) -> Self {
        Self {
            object: object.to_string(),
            fields: Vec::new(),
            condition: None,
            foreign_keys: Vec::new(),
            required_any: Vec::new(),
            strip: Vec::new(),
            constants: Record::new(),
            record_type: None,
            rich_text: Vec::new(),
            rich_text_flag: None,
            inline_image_reference: None,
            skip_patterns: Vec::new(),
        }
    }

    pub fn fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn foreign_key(mut self, fk: ForeignKey) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    pub fn strip(mut self, fields: &[&str]) -> Self {
        self.strip.extend(fields.iter().map(|f| f.to_string()));
        self
    }

    pub fn constant(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.constants.insert(field.to_string(), value.into());
        self
    }

    pub fn foreign_key_for(&self, field: &str) -> Option<&ForeignKey> {
        self.foreign_keys.iter().find(|fk| fk.field == field)
    }

    /// Whether a field is removed from every payload.
    pub fn is_stripped(&self, field: &str) -> bool {
        READ_ONLY_FIELDS.contains(&field) || self.strip.iter().any(|f| f == field)
    }

    /// Every field the source query must select.
    pub fn query_fields(&self) -> Vec<String> {
        let mut fields = vec!["Id".to_string()];
        let mut add = |field: &str| {
            if !fields.iter().any(|f| f == field) {
                fields.push(field.to_string());
            }
        };
        for field in &self.fields {
            add(field);
        }
        for fk in &self.foreign_keys {
            add(&fk.field);
            if let Some(path) = fk.type_path() {
                add(path);
            }
        }
        for field in &self.rich_text {
            add(field);
        }
        if let Some(flag) = &self.rich_text_flag {
            add(flag);
        }
        for pattern in &self.skip_patterns {
            add(&pattern.field);
        }
        fields
    }

    /// Apply configured overrides for this object.
    pub fn with_overrides(mut self, config: &MigrationConfig) -> Self {
        let Some(overrides) = config.object_override(&self.object) else {
            return self;
        };
        if let Some(fields) = &overrides.fields {
            self.fields = fields.clone();
        }
        if let Some(condition) = &overrides.condition {
            self.condition = Some(condition.clone()).filter(|c| !c.trim().is_empty());
        }
        if let Some(record_type) = &overrides.record_type {
            self.record_type = Some(record_type.clone());
        }
        if let Some(types) = &overrides.parent_types {
            for fk in &mut self.foreign_keys {
                if let FkTarget::Polymorphic { allowed, .. } = &mut fk.target {
                    if fk.check_eligibility {
                        *allowed = types.clone();
                    }
                }
            }
        }
        self
    }
}

// =============================================================================
// Built-in descriptors
// =============================================================================

/// Skip reason for feed comments whose feed item did not migrate.
pub const FEED_ITEM_NOT_MIGRATED: &str = "Parent feed item not migrated";

/// Skip reason for emails whose template has no target equivalent.
pub const UNMAPPED_TEMPLATE: &str = "Unmapped email template";

/// Tasks: polymorphic `WhatId`/`WhoId`, at least one must resolve.
pub fn task() -> ObjectDescriptor {
    ObjectDescriptor::new("Task")
        .fields(&[
            "Subject",
            "ActivityDate",
            "Status",
            "Priority",
            "Description",
            "Type",
            "IsReminderSet",
            "TaskSubtype",
            "OPX_Start_Date__c",
            "Task_Complete_Date__c",
            "Task_Type__c",
            "CTO_Flow__c",
        ])
        .foreign_key(
            ForeignKey::polymorphic("WhatId", "What.Type")
                .eligibility()
                .mirror("Request__c", "Request__c"),
        )
        .foreign_key(ForeignKey::polymorphic("WhoId", "Who.Type").eligibility())
        .foreign_key(ForeignKey::new("OwnerId", FkTarget::Owner, Requirement::Optional))
        .strip(&["CreatedDate", "CreatedById", "IsRecurrence"])
        .with_required_any(&["WhatId", "WhoId"])
        .with_record_type("Task")
}

/// Events: same parent rules as tasks.
pub fn event() -> ObjectDescriptor {
    ObjectDescriptor::new("Event")
        .fields(&[
            "Subject",
            "StartDateTime",
            "EndDateTime",
            "ActivityDate",
            "ActivityDateTime",
            "DurationInMinutes",
            "ReminderDateTime",
            "IsReminderSet",
            "Description",
            "CTO_Flow__c",
        ])
        .foreign_key(ForeignKey::polymorphic("WhatId", "What.Type").eligibility())
        .foreign_key(ForeignKey::polymorphic("WhoId", "Who.Type").eligibility())
        .foreign_key(ForeignKey::new("OwnerId", FkTarget::Owner, Requirement::Optional))
        .strip(&["CreatedDate", "CreatedById", "IsRecurrence"])
        .with_required_any(&["WhatId", "WhoId"])
        .with_record_type("Event_0")
}

/// Feed posts. `ParentId` resolves through the mapping named `parent`.
pub fn feed_item() -> ObjectDescriptor {
    let mut descriptor = ObjectDescriptor::new("FeedItem")
        .fields(&["Body", "LinkUrl", "Type", "IsRichText", "Visibility", "Title", "CreatedDate"])
        .foreign_key(ForeignKey::new(
            "ParentId",
            FkTarget::Provided("parent".to_string()),
            Requirement::Required,
        ))
        .foreign_key(ForeignKey::new(
            "RelatedRecordId",
            FkTarget::Object("ContentVersion".to_string()),
            Requirement::Optional,
        ))
        .foreign_key(ForeignKey::new("CreatedById", FkTarget::Owner, Requirement::Optional));
    descriptor.rich_text = vec!["Body".to_string()];
    descriptor.rich_text_flag = Some("IsRichText".to_string());
    descriptor.inline_image_reference = Some("RelatedRecordId".to_string());
    descriptor.skip_patterns = vec![SkipPattern {
        field: "Body".to_string(),
        needle: "status changed to".to_string(),
    }];
    descriptor
}

/// Feed comments, resolved through the feed item stage's mapping.
pub fn feed_comment() -> ObjectDescriptor {
    let mut descriptor = ObjectDescriptor::new("FeedComment")
        .fields(&["CommentBody", "IsRichText", "CommentType", "CreatedDate"])
        .foreign_key(
            ForeignKey::new(
                "FeedItemId",
                FkTarget::Provided("FeedItem".to_string()),
                Requirement::Required,
            )
            .missing_reason(FEED_ITEM_NOT_MIGRATED),
        )
        .foreign_key(ForeignKey::new(
            "RelatedRecordId",
            FkTarget::Object("ContentVersion".to_string()),
            Requirement::Optional,
        ))
        .foreign_key(ForeignKey::new("CreatedById", FkTarget::Owner, Requirement::Optional))
        .strip(&["ParentId"]);
    descriptor.rich_text = vec!["CommentBody".to_string()];
    descriptor.rich_text_flag = Some("IsRichText".to_string());
    descriptor.inline_image_reference = Some("RelatedRecordId".to_string());
    descriptor
}

/// Email messages; the template mapping is provided as `EmailTemplate`.
pub fn email_message() -> ObjectDescriptor {
    ObjectDescriptor::new("EmailMessage")
        .fields(&[
            "Subject",
            "TextBody",
            "HtmlBody",
            "FromAddress",
            "FromName",
            "ToAddress",
            "CcAddress",
            "BccAddress",
            "MessageDate",
            "Incoming",
            "IsClientManaged",
            "ThreadIdentifier",
            "MessageIdentifier",
        ])
        .foreign_key(
            ForeignKey::polymorphic("RelatedToId", "RelatedTo.Type")
                .requirement(Requirement::Required)
                .eligibility(),
        )
        .foreign_key(ForeignKey::new(
            "FromId",
            FkTarget::Object("User".to_string()),
            Requirement::Optional,
        ))
        .foreign_key(
            ForeignKey::new(
                "EmailTemplateId",
                FkTarget::Provided("EmailTemplate".to_string()),
                Requirement::IfPresent,
            )
            .missing_reason(UNMAPPED_TEMPLATE),
        )
        .strip(&["ActivityId", "ValidatedFromAddress", "AttachmentIds", "RelatedTo"])
        .constant("Status", "5")
}

impl ObjectDescriptor {
    fn with_required_any(mut self, fields: &[&str]) -> Self {
        self.required_any = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    fn with_record_type(mut self, developer_name: &str) -> Self {
        self.record_type = Some(developer_name.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObjectOverride;

    #[test]
    fn test_query_fields_include_references_and_paths() {
        let fields = task().query_fields();
        for expected in ["Id", "Subject", "WhatId", "What.Type", "WhoId", "Who.Type", "OwnerId"] {
            assert!(fields.iter().any(|f| f == expected), "missing {expected}");
        }
        let unique: std::collections::HashSet<_> = fields.iter().collect();
        assert_eq!(unique.len(), fields.len());
    }

    #[test]
    fn test_stripped_fields() {
        let descriptor = email_message();
        assert!(descriptor.is_stripped("Id"));
        assert!(descriptor.is_stripped("AttachmentIds"));
        assert!(!descriptor.is_stripped("Subject"));
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = MigrationConfig::default();
        config.objects.insert(
            "Task".to_string(),
            ObjectOverride {
                fields: Some(vec!["Subject".to_string()]),
                condition: Some("CreatedDate = LAST_N_YEARS:2".to_string()),
                record_type: Some("Task".to_string()),
                parent_types: Some(vec!["Account".to_string()]),
            },
        );

        let descriptor = task().with_overrides(&config);
        assert_eq!(descriptor.fields, vec!["Subject".to_string()]);
        assert_eq!(descriptor.record_type.as_deref(), Some("Task"));
        assert!(descriptor.condition.is_some());
        match &descriptor.foreign_key_for("WhatId").unwrap().target {
            FkTarget::Polymorphic { allowed, mirror, .. } => {
                assert_eq!(allowed, &vec!["Account".to_string()]);
                assert_eq!(mirror.get("Request__c").map(String::as_str), Some("Request__c"));
            }
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[test]
    fn test_email_constants() {
        let descriptor = email_message();
        assert_eq!(descriptor.constants.get("Status"), Some(&Value::from("5")));
        assert_eq!(
            descriptor.foreign_key_for("EmailTemplateId").unwrap().requirement,
            Requirement::IfPresent
        );
    }
}
