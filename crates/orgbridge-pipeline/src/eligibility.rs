//! Source-side eligibility checks.
//!
//! Whether a parent record is in scope is decided by a condition string from
//! configuration, evaluated by the source org itself.

use std::collections::HashSet;

use orgbridge_api::{Filter, OrgApi, Query, RecordExt};
use tracing::debug;

use crate::batch::chunked;
use crate::identity::dedup_ids;
use crate::retry::RetryExecutor;
use crate::{MigrationConfig, Result};

pub struct EligibilityFilter<'a> {
    source: &'a dyn OrgApi,
    retry: &'a RetryExecutor,
    config: &'a MigrationConfig,
}

impl<'a> EligibilityFilter<'a> {
    pub fn new(source: &'a dyn OrgApi, retry: &'a RetryExecutor, config: &'a MigrationConfig) -> Self {
        Self {
            source,
            retry,
            config,
        }
    }

    /// Whether `object` has a configured condition.
    pub fn is_conditional(&self, object: &str) -> bool {
        self.config.eligibility_for(object).is_some()
    }

    /// The subset of `ids` of type `object` that satisfy its condition.
    ///
    /// Objects without a condition are eligible without a query.
    pub async fn eligible<I, S>(&self, object: &str, ids: I) -> Result<HashSet<String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids = dedup_ids(ids);
        let Some(condition) = self.config.eligibility_for(object) else {
            return Ok(ids.into_iter().collect());
        };

        let mut eligible = HashSet::new();
        let operation = format!("eligibility {}", object);
        for chunk in chunked(ids, self.config.query_chunk_size) {
            let query = Query::select(object, ["Id"])
                .filter(Filter::is_in("Id", chunk))
                .filter_opt(Filter::raw(condition));
            let records = self
                .retry
                .execute(&operation, || self.source.query(&query))
                .await
                .into_result(&operation)?;
            eligible.extend(records.iter().filter_map(|r| r.id()).map(str::to_string));
        }
        debug!(object, eligible = eligible.len(), "eligibility evaluated");
        Ok(eligible)
    }

    /// Every record id of `object` that satisfies its condition.
    pub async fn eligible_parents(&self, object: &str) -> Result<Vec<String>> {
        let query = Query::select(object, ["Id"])
            .filter_opt(self.config.eligibility_for(object).and_then(Filter::raw));
        let operation = format!("eligible {}", object);
        let records = self
            .retry
            .execute(&operation, || self.source.query(&query))
            .await
            .into_result(&operation)?;
        Ok(records
            .iter()
            .filter_map(|r| r.id())
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orgbridge_api::MemoryOrg;
    use serde_json::json;

    const BRANDS: &str = "RecordType.Name = 'Brand'";

    fn config() -> MigrationConfig {
        let mut config = MigrationConfig::default();
        config
            .eligibility
            .insert("Account".to_string(), BRANDS.to_string());
        config
    }

    #[tokio::test]
    async fn test_unconditional_object_needs_no_query() {
        let source = MemoryOrg::new();
        let retry = RetryExecutor::default();
        let config = config();
        let filter = EligibilityFilter::new(&source, &retry, &config);

        let eligible = filter.eligible("Contact", ["003A", "003B"]).await.unwrap();
        assert_eq!(eligible.len(), 2);
        assert_eq!(source.call_count("query"), 0);
    }

    #[tokio::test]
    async fn test_condition_evaluated_on_source() {
        let source = MemoryOrg::new();
        let brand = source.seed("Account", json!({ "RecordType": { "Name": "Brand" } }));
        let person = source.seed("Account", json!({ "RecordType": { "Name": "Person" } }));
        source.register_condition("Account", BRANDS, |r| {
            r.path_str("RecordType.Name") == Some("Brand")
        });

        let retry = RetryExecutor::default();
        let config = config();
        let filter = EligibilityFilter::new(&source, &retry, &config);

        let eligible = filter.eligible("Account", [&brand, &person]).await.unwrap();
        assert!(eligible.contains(&brand));
        assert!(!eligible.contains(&person));

        let all = filter.eligible_parents("Account").await.unwrap();
        assert_eq!(all, vec![brand]);
    }
}
