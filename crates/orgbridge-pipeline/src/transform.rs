//! Source record to target payload.

use std::collections::HashMap;

use orgbridge_api::{Record, RecordExt};
use serde_json::Value;

use crate::descriptor::{FkTarget, ObjectDescriptor, Requirement};
use crate::markup::{rewrite_inline_images, strip_tags};
use crate::outcome::NO_PARENT_MAPPING;
use crate::resource_cache::ResourceMigrationRecord;

/// Target ids resolved for one source record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedRefs {
    /// Reference field to target id.
    pub targets: HashMap<String, String>,
    /// Reference field to the concrete parent type, for polymorphic keys.
    pub parent_types: HashMap<String, String>,
}

impl ResolvedRefs {
    pub fn set(&mut self, field: &str, target_id: impl Into<String>) {
        self.targets.insert(field.to_string(), target_id.into());
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.targets.get(field).map(String::as_str)
    }
}

/// Builds target payloads according to a descriptor.
pub struct RecordTransform<'a> {
    descriptor: &'a ObjectDescriptor,
    legacy_field: &'a str,
}

impl<'a> RecordTransform<'a> {
    pub fn new(descriptor: &'a ObjectDescriptor, legacy_field: &'a str) -> Self {
        Self {
            descriptor,
            legacy_field,
        }
    }

    /// Why the record cannot be built, if a required reference is unresolved.
    pub fn missing_reference(&self, source: &Record, refs: &ResolvedRefs) -> Option<String> {
        for fk in &self.descriptor.foreign_keys {
            let resolved = refs.get(&fk.field).is_some();
            let present = source.path_str(&fk.field).is_some();
            let missing = match fk.requirement {
                Requirement::Required => !resolved,
                Requirement::IfPresent => present && !resolved,
                Requirement::Optional => false,
            };
            if missing {
                return Some(fk.missing_reason.clone());
            }
        }
        if !self.descriptor.required_any.is_empty()
            && !self
                .descriptor
                .required_any
                .iter()
                .any(|field| refs.get(field).is_some())
        {
            return Some(NO_PARENT_MAPPING.to_string());
        }
        None
    }

    /// Build the insert payload, or `None` when a required reference is
    /// unresolved.
    ///
    /// `content` maps source document ids to their migrated documents and is
    /// used to rewrite inline images.
    pub fn build(
        &self,
        source: &Record,
        refs: &ResolvedRefs,
        content: &HashMap<String, ResourceMigrationRecord>,
        record_type_id: Option<&str>,
    ) -> Option<Record> {
        if self.missing_reference(source, refs).is_some() {
            return None;
        }
        let descriptor = self.descriptor;
        let mut payload = Record::new();

        for field in &descriptor.fields {
            if descriptor.foreign_key_for(field).is_some() {
                continue;
            }
            if let Some(value) = source.get(field).filter(|v| !v.is_null()) {
                payload.insert(field.clone(), value.clone());
            }
        }

        let mut first_image = None;
        for field in &descriptor.rich_text {
            let Some(body) = source.path_str(field) else {
                continue;
            };
            let is_rich = descriptor
                .rich_text_flag
                .as_deref()
                .map(|flag| source.path(flag).and_then(Value::as_bool).unwrap_or(false))
                .unwrap_or(true);
            let cleaned = if is_rich {
                let documents: HashMap<String, String> = content
                    .iter()
                    .map(|(id, record)| (id.clone(), record.target_document_id.clone()))
                    .collect();
                let rewrite = rewrite_inline_images(body, &documents);
                if first_image.is_none() {
                    first_image = rewrite.first_mapped;
                }
                rewrite.body
            } else {
                strip_tags(body)
            };
            payload.insert(field.clone(), Value::String(cleaned));
        }

        for fk in &descriptor.foreign_keys {
            let Some(target_id) = refs.get(&fk.field) else {
                continue;
            };
            payload.insert(fk.field.clone(), Value::String(target_id.to_string()));
            if let FkTarget::Polymorphic { mirror, .. } = &fk.target {
                let mirrored = refs
                    .parent_types
                    .get(&fk.field)
                    .and_then(|parent_type| mirror.get(parent_type));
                if let Some(mirror_field) = mirrored {
                    payload.insert(mirror_field.clone(), Value::String(target_id.to_string()));
                }
            }
        }

        if let (Some(field), Some(document)) = (&descriptor.inline_image_reference, first_image) {
            if !payload.contains_key(field) {
                if let Some(record) = content.get(&document) {
                    payload.insert(
                        field.clone(),
                        Value::String(record.target_version_id.clone()),
                    );
                }
            }
        }

        for (field, value) in &descriptor.constants {
            payload.insert(field.clone(), value.clone());
        }
        if let Some(id) = record_type_id {
            payload.insert("RecordTypeId".to_string(), Value::String(id.to_string()));
        }
        if let Some(id) = source.id() {
            payload.insert(self.legacy_field.to_string(), Value::String(id.to_string()));
        }

        payload.retain(|field, _| !descriptor.is_stripped(field));
        Some(payload)
    }
}
