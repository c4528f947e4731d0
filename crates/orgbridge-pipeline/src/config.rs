//! Migration policy loaded from TOML.
//!
//! Credentials are not part of this file; the binary takes them from the
//! command line or environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::retry::RetryPolicy;
use crate::{MigrateError, Result};

/// Largest id list a single IN clause or batch may carry.
pub const MAX_BATCH: usize = 2000;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub resubmit_rounds: u32,
    pub resubmit_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 2000,
            resubmit_rounds: 3,
            resubmit_delay_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContentConfig {
    /// Concurrent download/upload workers.
    pub workers: usize,
    /// Versions larger than this are skipped.
    pub max_upload_bytes: u64,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}

/// Overrides for one object's built-in descriptor.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObjectOverride {
    /// Replacement field allow-list.
    pub fields: Option<Vec<String>>,
    /// Source-side selection condition.
    pub condition: Option<String>,
    /// Target record type developer name.
    pub record_type: Option<String>,
    /// Allowed concrete types for the polymorphic parent.
    pub parent_types: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskKind {
    Phone,
    Email,
    Text,
}

/// Fields to mask on one target object.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MaskingPolicy {
    pub fields: BTreeMap<String, MaskKind>,
    /// Fields the org refuses in a WHERE clause; fetched but not filtered on.
    pub non_filterable: Vec<String>,
}

/// Run-wide migration policy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MigrationConfig {
    /// Target-org field holding the source record id.
    pub legacy_id_field: String,
    /// Records per insert/update call.
    pub batch_size: usize,
    /// Ids per IN clause.
    pub query_chunk_size: usize,
    /// Owner for records whose source owner has no target equivalent.
    pub integration_user_id: Option<String>,
    /// Folder for recreated email templates (defaults to the integration user).
    pub email_template_folder_id: Option<String>,
    /// Directory for audit logs and mapping exports.
    pub output_dir: PathBuf,
    pub retry: RetryConfig,
    pub content: ContentConfig,
    /// Object type to eligibility condition evaluated on the source org.
    pub eligibility: BTreeMap<String, String>,
    pub objects: BTreeMap<String, ObjectOverride>,
    pub masking: BTreeMap<String, MaskingPolicy>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            legacy_id_field: "Legacy_Id__c".to_string(),
            batch_size: 200,
            query_chunk_size: 200,
            integration_user_id: None,
            email_template_folder_id: None,
            output_dir: PathBuf::from("files"),
            retry: RetryConfig::default(),
            content: ContentConfig::default(),
            eligibility: BTreeMap::new(),
            objects: BTreeMap::new(),
            masking: BTreeMap::new(),
        }
    }
}

impl MigrationConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no config file, using defaults");
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        info!(path = %path.display(), "loaded migration config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.legacy_id_field.trim().is_empty() {
            return Err(MigrateError::Config("legacy_id_field must not be empty".into()));
        }
        for (name, value) in [
            ("batch_size", self.batch_size),
            ("query_chunk_size", self.query_chunk_size),
        ] {
            if value == 0 || value > MAX_BATCH {
                return Err(MigrateError::Config(format!(
                    "{} must be between 1 and {}, got {}",
                    name, MAX_BATCH, value
                )));
            }
        }
        if self.content.workers == 0 {
            return Err(MigrateError::Config("content.workers must be at least 1".into()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            resubmit_rounds: self.retry.resubmit_rounds,
            resubmit_delay: Duration::from_millis(self.retry.resubmit_delay_ms),
        }
    }

    /// Eligibility condition for an object type; blank means unconditional.
    pub fn eligibility_for(&self, object: &str) -> Option<&str> {
        self.eligibility
            .get(object)
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
    }

    pub fn object_override(&self, object: &str) -> Option<&ObjectOverride> {
        self.objects.get(object)
    }

    /// Path of an output file under `output_dir`.
    pub fn output_path(&self, file_name: &str) -> PathBuf {
        self.output_dir.join(file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn test_defaults_are_valid() {
        let config = MigrationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.content.workers, 5);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_parse_full_document() {
        let config = MigrationConfig::from_toml_str(
            r#"
            legacy_id_field = "Card_Legacy_Id__c"
            batch_size = 100
            integration_user_id = "005000000000INT"

            [retry]
            max_retries = 5

            [eligibility]
            Account = "RecordType.Name IN ('Brand','Dealer') AND IsPersonAccount = false"
            Contact = ""

            [objects.Task]
            record_type = "Task"
            parent_types = ["Account", "Request__c"]

            [masking.Contact.fields]
            Phone = "phone"
            Email = "email"
            Description = "text"

            [masking.Account]
            non_filterable = ["Bank_Account_Number__c"]

            [masking.Account.fields]
            Bank_Account_Number__c = "text"
            "#,
        )
        .unwrap();

        assert_eq!(config.legacy_id_field, "Card_Legacy_Id__c");
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 2000);
        assert!(config.eligibility_for("Account").is_some());
        assert_eq!(config.eligibility_for("Contact"), None);
        assert_eq!(
            config.object_override("Task").unwrap().parent_types,
            Some(vec!["Account".to_string(), "Request__c".to_string()])
        );
        assert_eq!(config.masking["Contact"].fields["Email"], MaskKind::Email);
        assert_eq!(
            config.masking["Account"].non_filterable,
            vec!["Bank_Account_Number__c".to_string()]
        );
    }

    #[test_case("batch_size = 0" ; "zero batch")]
    #[test_case("query_chunk_size = 5000" ; "chunk above limit")]
    #[test_case("legacy_id_field = \"\"" ; "empty legacy field")]
    #[test_case("[content]\nworkers = 0" ; "no workers")]
    fn test_invalid_config_rejected(text: &str) {
        assert!(matches!(
            MigrationConfig::from_toml_str(text),
            Err(MigrateError::Config(_))
        ));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(matches!(
            MigrationConfig::from_toml_str("batchsize = 10"),
            Err(MigrateError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = MigrationConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, MigrationConfig::default());
    }
}
