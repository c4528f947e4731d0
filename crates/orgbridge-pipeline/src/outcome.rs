//! Per-record migration outcomes.

use std::collections::HashMap;
use std::fmt;

use crossbeam::queue::SegQueue;
use serde::{Deserialize, Serialize};

/// Skip reason when a required parent has no target mapping.
pub const NO_PARENT_MAPPING: &str = "No target parent mapping";

/// Terminal status of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Success,
    Failed,
    Skipped,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => write!(f, "Success"),
            Status::Failed => write!(f, "Failed"),
            Status::Skipped => write!(f, "Skipped"),
        }
    }
}

/// Why a record was never submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A required reference has no target-org equivalent.
    MissingMapping(String),
    /// The record or its parent falls outside the migration scope.
    Ineligible(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingMapping(reason) | SkipReason::Ineligible(reason) => {
                write!(f, "{}", reason)
            }
        }
    }
}

/// What happened to one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success { target_id: String },
    Failed { error: String },
    Skipped(SkipReason),
}

impl Outcome {
    pub fn status(&self) -> Status {
        match self {
            Outcome::Success { .. } => Status::Success,
            Outcome::Failed { .. } => Status::Failed,
            Outcome::Skipped(_) => Status::Skipped,
        }
    }
}

/// One line of the audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeRecord {
    /// Object type tag, e.g. `Task` or `ContentDocumentLink`.
    pub kind: String,
    pub source_id: String,
    pub outcome: Outcome,
}

impl OutcomeRecord {
    pub fn success(kind: &str, source_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            source_id: source_id.into(),
            outcome: Outcome::Success {
                target_id: target_id.into(),
            },
        }
    }

    pub fn failed(kind: &str, source_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            source_id: source_id.into(),
            outcome: Outcome::Failed {
                error: error.into(),
            },
        }
    }

    pub fn missing_mapping(kind: &str, source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            source_id: source_id.into(),
            outcome: Outcome::Skipped(SkipReason::MissingMapping(reason.into())),
        }
    }

    pub fn ineligible(kind: &str, source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            source_id: source_id.into(),
            outcome: Outcome::Skipped(SkipReason::Ineligible(reason.into())),
        }
    }

    pub fn status(&self) -> Status {
        self.outcome.status()
    }

    pub fn target_id(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Success { target_id } => Some(target_id),
            _ => None,
        }
    }

    /// Error or skip reason, empty on success.
    pub fn detail(&self) -> String {
        match &self.outcome {
            Outcome::Success { .. } => String::new(),
            Outcome::Failed { error } => error.clone(),
            Outcome::Skipped(reason) => reason.to_string(),
        }
    }
}

/// Counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeSummary {
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl OutcomeSummary {
    pub fn total(&self) -> usize {
        self.success + self.failed + self.skipped
    }
}

impl fmt::Display for OutcomeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} skipped",
            self.success, self.failed, self.skipped
        )
    }
}

/// Append-only collection of outcomes for one stage.
#[derive(Debug, Clone, Default)]
pub struct OutcomeLog {
    records: Vec<OutcomeRecord>,
}

impl OutcomeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: OutcomeRecord) {
        self.records.push(record);
    }

    pub fn extend(&mut self, records: impl IntoIterator<Item = OutcomeRecord>) {
        self.records.extend(records);
    }

    pub fn append(&mut self, other: OutcomeLog) {
        self.records.extend(other.records);
    }

    pub fn records(&self) -> &[OutcomeRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Find the outcome of a source record.
    pub fn find(&self, source_id: &str) -> Option<&OutcomeRecord> {
        self.records.iter().find(|r| r.source_id == source_id)
    }

    pub fn summary(&self) -> OutcomeSummary {
        let mut summary = OutcomeSummary::default();
        for record in &self.records {
            match record.status() {
                Status::Success => summary.success += 1,
                Status::Failed => summary.failed += 1,
                Status::Skipped => summary.skipped += 1,
            }
        }
        summary
    }

    /// Source id to target id for every successful record.
    pub fn successes(&self) -> HashMap<String, String> {
        self.records
            .iter()
            .filter_map(|r| r.target_id().map(|t| (r.source_id.clone(), t.to_string())))
            .collect()
    }
}

impl IntoIterator for OutcomeLog {
    type Item = OutcomeRecord;
    type IntoIter = std::vec::IntoIter<OutcomeRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

/// Lock-free outcome queue for concurrent workers.
///
/// Workers push; the orchestrator drains once the pool has finished.
#[derive(Debug, Default)]
pub struct OutcomeSink {
    queue: SegQueue<OutcomeRecord>,
}

impl OutcomeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: OutcomeRecord) {
        self.queue.push(record);
    }

    /// Move everything queued so far into a log.
    pub fn drain(&self) -> OutcomeLog {
        let mut log = OutcomeLog::new();
        while let Some(record) = self.queue.pop() {
            log.push(record);
        }
        log
    }
}
