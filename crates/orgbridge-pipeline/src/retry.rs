//! Retrying remote calls with exponential backoff.
//!
//! Two loops live here and stay separate:
//!
//! - [`RetryExecutor::execute`] re-invokes an operation whose whole call
//!   failed, waiting `base_delay * 2^(attempt-1)` between attempts.
//! - [`RetryExecutor::write_with_resubmission`] resubmits only the records a
//!   batch write reported as failed, in a bounded number of rounds.
//!
//! Only errors that report themselves transient are retried. Anything else
//! ends the call at once as [`RetryOutcome::Fatal`].

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use orgbridge_api::{ApiError, OrgApi, Record, SaveResult};
use tracing::{debug, warn};

use crate::MigrateError;
use crate::batch::chunked;

/// Upper bound on a single wait; far above any configured schedule.
const MAX_WAIT: Duration = Duration::from_secs(3600);

/// Retry limits and delays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Extra rounds for records a batch write rejected.
    pub resubmit_rounds: u32,
    pub resubmit_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            resubmit_rounds: 3,
            resubmit_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Deterministic doubling schedule starting at `base_delay`.
    fn schedule(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.base_delay)
            .with_randomization_factor(0.0)
            .with_multiplier(2.0)
            .with_max_interval(MAX_WAIT)
            .with_max_elapsed_time(None)
            .build()
    }

    /// The waits between attempts, in order.
    pub fn delays(&self) -> Vec<Duration> {
        let mut schedule = self.schedule();
        (0..self.max_retries)
            .map(|_| schedule.next_backoff().unwrap_or(MAX_WAIT))
            .collect()
    }
}

/// An error that knows whether repeating the call could help.
pub trait Retryable: Display {
    fn is_transient(&self) -> bool;
}

impl Retryable for ApiError {
    fn is_transient(&self) -> bool {
        ApiError::is_transient(self)
    }
}

/// Result of running an operation under retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    Succeeded { value: T, attempts: u32 },
    Exhausted { attempts: u32, last_error: String },
    /// The call failed with an error that retrying cannot fix.
    Fatal { attempts: u32, error: String },
}

impl<T> RetryOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::Fatal { attempts, .. } => *attempts,
        }
    }

    /// Convert to a `Result` for callers that cannot turn exhaustion into
    /// per-record outcomes.
    pub fn into_result(self, operation: &str) -> Result<T, MigrateError> {
        match self {
            RetryOutcome::Succeeded { value, .. } => Ok(value),
            RetryOutcome::Exhausted {
                attempts,
                last_error,
            } => Err(MigrateError::RetriesExhausted {
                operation: operation.to_string(),
                attempts,
                message: last_error,
            }),
            RetryOutcome::Fatal { error, .. } => Err(MigrateError::Rejected {
                operation: operation.to_string(),
                message: error,
            }),
        }
    }
}

/// Which batch endpoint a resubmission loop writes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Update,
}

/// Runs remote operations under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invoke `op` up to `max_retries + 1` times until it succeeds.
    ///
    /// Never returns an error: exhaustion is reported as
    /// [`RetryOutcome::Exhausted`] with the last error's message, and a
    /// non-transient error as [`RetryOutcome::Fatal`] without retrying.
    pub async fn execute<T, E, F, Fut>(&self, operation: &str, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        let mut schedule = self.policy.schedule();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "succeeded after retry");
                    }
                    return RetryOutcome::Succeeded {
                        value,
                        attempts: attempt,
                    };
                }
                Err(e) if !e.is_transient() => {
                    warn!(operation, attempts = attempt, error = %e, "remote call rejected");
                    return RetryOutcome::Fatal {
                        attempts: attempt,
                        error: e.to_string(),
                    };
                }
                Err(e) if attempt <= self.policy.max_retries => {
                    let wait = schedule.next_backoff().unwrap_or(MAX_WAIT);
                    warn!(
                        operation,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "remote call failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    warn!(operation, attempts = attempt, error = %e, "retries exhausted");
                    return RetryOutcome::Exhausted {
                        attempts: attempt,
                        last_error: e.to_string(),
                    };
                }
            }
        }
    }

    /// Insert records in chunks of `batch_size`, resubmitting rejected ones.
    pub async fn insert_with_resubmission(
        &self,
        api: &dyn OrgApi,
        object: &str,
        records: &[Record],
        batch_size: usize,
    ) -> Vec<SaveResult> {
        self.write_with_resubmission(api, WriteKind::Insert, object, records, batch_size)
            .await
    }

    /// Batch write with both retry loops.
    ///
    /// Returns exactly one result per input record, in input order. Chunks
    /// whose whole call exhausted its retries are marked failed and are not
    /// resubmitted; records rejected individually are resubmitted for up to
    /// `resubmit_rounds` further rounds.
    pub async fn write_with_resubmission(
        &self,
        api: &dyn OrgApi,
        kind: WriteKind,
        object: &str,
        records: &[Record],
        batch_size: usize,
    ) -> Vec<SaveResult> {
        let mut results: Vec<Option<SaveResult>> = vec![None; records.len()];
        let mut pending: Vec<usize> = (0..records.len()).collect();
        let operation = match kind {
            WriteKind::Insert => format!("insert {}", object),
            WriteKind::Update => format!("update {}", object),
        };

        for round in 0..=self.policy.resubmit_rounds {
            if pending.is_empty() {
                break;
            }
            if round > 0 {
                warn!(
                    object,
                    round,
                    count = pending.len(),
                    wait_ms = self.policy.resubmit_delay.as_millis() as u64,
                    "resubmitting rejected records"
                );
                tokio::time::sleep(self.policy.resubmit_delay).await;
            }

            let mut rejected = Vec::new();
            for chunk in chunked(pending.iter().copied(), batch_size) {
                let payload: Vec<Record> = chunk.iter().map(|&i| records[i].clone()).collect();
                let outcome = self
                    .execute(&operation, || async {
                        match kind {
                            WriteKind::Insert => api.insert_batch(object, &payload).await,
                            WriteKind::Update => api.update_batch(object, &payload).await,
                        }
                    })
                    .await;

                match outcome {
                    RetryOutcome::Succeeded { value, .. } if value.len() == chunk.len() => {
                        for (index, result) in chunk.into_iter().zip(value) {
                            if !result.success {
                                rejected.push(index);
                            }
                            results[index] = Some(result);
                        }
                    }
                    RetryOutcome::Succeeded { value, .. } => {
                        let message = format!(
                            "expected {} results, got {}",
                            chunk.len(),
                            value.len()
                        );
                        for index in chunk {
                            results[index] = Some(SaveResult::failed("INVALID_RESPONSE", &message));
                        }
                    }
                    RetryOutcome::Exhausted { last_error, .. } => {
                        for index in chunk {
                            results[index] =
                                Some(SaveResult::failed("RETRIES_EXHAUSTED", &last_error));
                        }
                    }
                    RetryOutcome::Fatal { error, .. } => {
                        for index in chunk {
                            results[index] = Some(SaveResult::failed("CALL_REJECTED", &error));
                        }
                    }
                }
            }
            pending = rejected;
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| SaveResult::failed("NOT_SUBMITTED", "record was not submitted")))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orgbridge_api::MemoryOrg;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            resubmit_rounds: 2,
            resubmit_delay: Duration::from_millis(500),
        }
    }

    fn record(subject: &str) -> Record {
        json!({ "Subject": subject }).as_object().cloned().unwrap()
    }

    fn unavailable(body: impl Into<String>) -> ApiError {
        ApiError::Server {
            status: 503,
            body: body.into(),
        }
    }

    fn malformed() -> ApiError {
        ApiError::Api {
            code: "MALFORMED_QUERY".to_string(),
            message: "unexpected token: '='".to_string(),
        }
    }

    #[test]
    fn test_delays_double() {
        let delays = policy(4).delays();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let executor = RetryExecutor::new(policy(3));
        let calls = AtomicU32::new(0);

        let outcome = executor
            .execute("flaky", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(unavailable("busy")) } else { Ok(n) }
            })
            .await;

        assert_eq!(
            outcome,
            RetryOutcome::Succeeded {
                value: 3,
                attempts: 3
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_last_error() {
        let executor = RetryExecutor::new(policy(3));
        let calls = AtomicU32::new(0);

        let outcome: RetryOutcome<()> = executor
            .execute("doomed", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err(unavailable(format!("failure {}", n)))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            outcome,
            RetryOutcome::Exhausted {
                attempts: 4,
                last_error: "server error (503): failure 4".to_string()
            }
        );
        assert!(matches!(
            outcome.into_result("doomed"),
            Err(MigrateError::RetriesExhausted { attempts: 4, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_follow_schedule() {
        let executor = RetryExecutor::new(policy(2));
        let start = tokio::time::Instant::now();

        let _: RetryOutcome<()> = executor
            .execute("timed", || async { Err(unavailable("no")) })
            .await;

        // 100ms + 200ms of backoff
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_means_one_attempt() {
        let executor = RetryExecutor::new(policy(0));
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<()> = executor
            .execute("once", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(unavailable("no"))
            })
            .await;
        assert_eq!(outcome.attempts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_error_is_not_retried() {
        let executor = RetryExecutor::new(policy(3));
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let outcome: RetryOutcome<()> = executor
            .execute("bad query", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(malformed())
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(matches!(outcome, RetryOutcome::Fatal { attempts: 1, .. }));
        assert!(matches!(
            outcome.into_result("bad query"),
            Err(MigrateError::Rejected { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_fatal_stops_at_fatal() {
        let executor = RetryExecutor::new(policy(3));
        let calls = AtomicU32::new(0);

        let outcome: RetryOutcome<()> = executor
            .execute("mixed", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 1 { Err(unavailable("busy")) } else { Err(malformed()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_whole_call_failure_is_retried() {
        let org = MemoryOrg::new();
        org.fail_next_calls(2);
        let executor = RetryExecutor::new(policy(3));

        let results = executor
            .insert_with_resubmission(&org, "Task", &[record("a"), record("b")], 200)
            .await;

        assert!(results.iter().all(|r| r.success));
        assert_eq!(org.call_count("insert_batch:Task"), 3);
        assert_eq!(org.records("Task").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_records_are_resubmitted() {
        let org = MemoryOrg::new();
        org.reject_when("Task", "Subject", "locked", "UNABLE_TO_LOCK_ROW", Some(1));
        let executor = RetryExecutor::new(policy(3));

        let records = vec![record("ok"), record("locked"), record("also ok")];
        let results = executor
            .insert_with_resubmission(&org, "Task", &records, 200)
            .await;

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.success));
        // First round with all three, second round with the rejected one only
        assert_eq!(org.call_count("insert_batch:Task"), 2);
        assert_eq!(org.records("Task").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_rejection_stops_after_rounds() {
        let org = MemoryOrg::new();
        org.reject_when("Task", "Subject", "bad", "validation rule", None);
        let executor = RetryExecutor::new(policy(3));

        let records = vec![record("bad"), record("good")];
        let results = executor
            .insert_with_resubmission(&org, "Task", &records, 200)
            .await;

        assert!(!results[0].success);
        assert!(results[0].error_message().contains("validation rule"));
        assert!(results[1].success);
        // Initial round plus two resubmission rounds
        assert_eq!(org.call_count("insert_batch:Task"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_chunk_marks_every_record_failed() {
        let org = MemoryOrg::new();
        org.fail_next_calls(10);
        let executor = RetryExecutor::new(policy(1));

        let records = vec![record("a"), record("b"), record("c")];
        let results = executor
            .insert_with_resubmission(&org, "Task", &records, 2)
            .await;

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| !r.success));
        assert!(results[0].error_message().starts_with("RETRIES_EXHAUSTED"));
        assert!(org.records("Task").is_empty());
    }
}
