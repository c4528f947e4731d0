//! Inactive picklist value audit.
//!
//! Records carrying a value that is inactive on the target are rejected on
//! insert, so the audit is run against the target before migrating.

use orgbridge_api::OrgApi;
use tracing::info;

use crate::audit::write_rows;
use crate::context::MigrationContext;
use crate::retry::RetryExecutor;
use crate::Result;

pub const PICKLIST_AUDIT_FILE: &str = "inactive_picklist_values.csv";

const HEADERS: [&str; 5] = [
    "Object Name",
    "Picklist Name",
    "Picklist Value",
    "Status",
    "Picklist Type",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InactivePicklistValue {
    pub object: String,
    pub field: String,
    pub value: String,
    pub field_type: String,
}

impl InactivePicklistValue {
    fn row(&self) -> [&str; 5] {
        [
            self.object.as_str(),
            self.field.as_str(),
            self.value.as_str(),
            "Inactive",
            self.field_type.as_str(),
        ]
    }
}

/// Inactive values of every picklist field of `objects`.
pub async fn inactive_values(
    org: &dyn OrgApi,
    retry: &RetryExecutor,
    objects: &[String],
) -> Result<Vec<InactivePicklistValue>> {
    let mut inactive = Vec::new();
    for object in objects {
        let operation = format!("describe {}", object);
        let describe = retry
            .execute(&operation, || org.describe(object))
            .await
            .into_result(&operation)?;
        let before = inactive.len();
        for field in describe.fields.iter().filter(|f| f.is_picklist()) {
            inactive.extend(field.picklist_values.iter().filter(|v| !v.active).map(|v| {
                InactivePicklistValue {
                    object: describe.name.clone(),
                    field: field.name.clone(),
                    value: v.value.clone(),
                    field_type: field.field_type.clone(),
                }
            }));
        }
        info!(object = %object, inactive = inactive.len() - before, "picklists audited");
    }
    Ok(inactive)
}

/// Audit the target org's picklists and write the inactive value table.
///
/// With no objects given, audits the configured eligibility objects plus
/// tasks and events.
#[tracing::instrument(skip_all)]
pub async fn audit_picklists(
    ctx: &MigrationContext,
    objects: &[String],
) -> Result<Vec<InactivePicklistValue>> {
    let objects: Vec<String> = if objects.is_empty() {
        let mut defaults: Vec<String> = ctx.config.eligibility.keys().cloned().collect();
        for activity in ["Task", "Event"] {
            if !defaults.iter().any(|o| o == activity) {
                defaults.push(activity.to_string());
            }
        }
        defaults
    } else {
        objects.to_vec()
    };

    let inactive = inactive_values(ctx.target.as_ref(), &ctx.retry, &objects).await?;
    write_rows(
        &ctx.output_path(PICKLIST_AUDIT_FILE),
        &HEADERS,
        inactive.iter().map(InactivePicklistValue::row),
    )?;
    Ok(inactive)
}
