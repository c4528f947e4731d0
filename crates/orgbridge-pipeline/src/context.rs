//! Per-run state shared by every stage.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use orgbridge_api::OrgApi;
use tracing::info;
use uuid::Uuid;

use crate::MigrationConfig;
use crate::descriptor::ObjectDescriptor;
use crate::eligibility::EligibilityFilter;
use crate::identity::{IdentityResolver, KeyPrefixIndex, LegacyIdentityMap};
use crate::resource_cache::DeduplicatingResourceCache;
use crate::retry::RetryExecutor;

/// Clients, policy and caches for one migration run.
///
/// Built once per run and handed to each stage explicitly. The identity map
/// and resource cache start empty every run.
pub struct MigrationContext {
    pub source: Arc<dyn OrgApi>,
    pub target: Arc<dyn OrgApi>,
    pub config: MigrationConfig,
    pub identities: LegacyIdentityMap,
    pub resources: DeduplicatingResourceCache,
    pub retry: RetryExecutor,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    record_types: HashMap<(String, String), Option<String>>,
    key_prefixes: KeyPrefixIndex,
}

impl MigrationContext {
    pub fn new(source: Arc<dyn OrgApi>, target: Arc<dyn OrgApi>, config: MigrationConfig) -> Self {
        let retry = RetryExecutor::new(config.retry_policy());
        let run_id = Uuid::new_v4();
        info!(run_id = %run_id, "migration run started");
        Self {
            source,
            target,
            config,
            identities: LegacyIdentityMap::new(),
            resources: DeduplicatingResourceCache::new(),
            retry,
            run_id,
            started_at: Utc::now(),
            record_types: HashMap::new(),
            key_prefixes: KeyPrefixIndex::default(),
        }
    }

    /// Borrow an identity resolver over this run's caches.
    pub fn resolver(&mut self) -> IdentityResolver<'_> {
        IdentityResolver {
            source: self.source.as_ref(),
            target: self.target.as_ref(),
            retry: &self.retry,
            legacy_field: &self.config.legacy_id_field,
            chunk_size: self.config.query_chunk_size,
            integration_user: self.config.integration_user_id.as_deref(),
            identities: &mut self.identities,
            key_prefixes: &mut self.key_prefixes,
            record_types: &mut self.record_types,
            resources: &mut self.resources,
        }
    }

    pub fn eligibility(&self) -> EligibilityFilter<'_> {
        EligibilityFilter::new(self.source.as_ref(), &self.retry, &self.config)
    }

    /// A built-in descriptor with this run's overrides applied.
    pub fn descriptor(&self, base: ObjectDescriptor) -> ObjectDescriptor {
        base.with_overrides(&self.config)
    }

    pub fn output_path(&self, file_name: &str) -> PathBuf {
        self.config.output_path(file_name)
    }

    pub fn legacy_field(&self) -> &str {
        &self.config.legacy_id_field
    }
}
