//! Dependency-ordered record migration between two CRM orgs.
//!
//! This crate provides:
//! - Legacy-id identity resolution against the target org
//! - Parent eligibility filtering and polymorphic parent remapping
//! - A generic migrator that plans, transforms and writes one object type
//! - Batched writes with retry, backoff and failed-record resubmission
//! - Deduplicated file uploads shared between parents
//! - Per-record outcome logs and CSV mapping exports
//!
//! Object-specific stages (activities, attachments, files, feed, email,
//! content documents, masking and the picklist audit) live in [`stages`].

pub mod audit;
pub mod batch;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod eligibility;
mod error;
pub mod identity;
pub mod markup;
pub mod migrator;
pub mod outcome;
pub mod resource_cache;
pub mod retry;
pub mod stages;
pub mod transform;

pub use batch::{ChunkedBatcher, chunked};
pub use config::{ContentConfig, MaskKind, MaskingPolicy, MigrationConfig, ObjectOverride, RetryConfig};
pub use context::MigrationContext;
pub use descriptor::ObjectDescriptor;
pub use error::{MigrateError, Result};
pub use identity::{IdMapping, IdentityResolver, LegacyIdentityMap};
pub use migrator::{DependencyOrderedMigrator, SourceSelection, StagePlan, StageReport};
pub use outcome::{Outcome, OutcomeLog, OutcomeRecord, OutcomeSummary, SkipReason, Status};
pub use resource_cache::DeduplicatingResourceCache;
pub use retry::{RetryExecutor, RetryPolicy};
pub use transform::RecordTransform;
