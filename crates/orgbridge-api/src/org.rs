//! The data API surface the migration pipeline depends on.

use async_trait::async_trait;

use crate::{ApiError, ObjectDescribe, Query, Record, SaveResult};

/// Operations the pipeline performs against an org.
///
/// Implemented by [`crate::OrgClient`] for real orgs and by
/// [`crate::MemoryOrg`] for tests.
#[async_trait]
pub trait OrgApi: Send + Sync {
    /// Run a query and return every matching record (all pages).
    async fn query(&self, query: &Query) -> Result<Vec<Record>, ApiError>;

    /// Insert records of one object type. Returns one result per input
    /// record, in input order; individual rejections are not errors.
    async fn insert_batch(&self, object: &str, records: &[Record])
    -> Result<Vec<SaveResult>, ApiError>;

    /// Update records (each must carry `Id`). Same result contract as
    /// [`OrgApi::insert_batch`].
    async fn update_batch(&self, object: &str, records: &[Record])
    -> Result<Vec<SaveResult>, ApiError>;

    /// Create a single record and return its new id.
    async fn create(&self, object: &str, record: &Record) -> Result<String, ApiError>;

    /// Fetch a single record by id.
    async fn get(&self, object: &str, id: &str) -> Result<Record, ApiError>;

    /// Object metadata (fields, picklists, key prefix).
    async fn describe(&self, object: &str) -> Result<ObjectDescribe, ApiError>;

    /// Download a binary field (`Attachment.Body`, `ContentVersion.VersionData`).
    async fn download(&self, object: &str, id: &str, field: &str) -> Result<Vec<u8>, ApiError>;
}
