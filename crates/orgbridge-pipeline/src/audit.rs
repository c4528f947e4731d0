//! CSV audit logs and mapping tables.
//!
//! Readers look columns up by header name; column order is not part of the
//! contract.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::Path;

use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use tracing::info;

use crate::identity::IdMapping;
use crate::outcome::{OutcomeLog, OutcomeRecord, Status};
use crate::{MigrateError, Result};

/// Header of every outcome log.
pub const OUTCOME_HEADERS: [&str; 5] = ["Type", "Source_Id", "Target_Id", "Status", "Error"];

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn outcome_row(record: &OutcomeRecord) -> [String; 5] {
    [
        record.kind.clone(),
        record.source_id.clone(),
        record.target_id().unwrap_or_default().to_string(),
        record.status().to_string(),
        record.detail(),
    ]
}

/// Write a complete outcome log, replacing any existing file.
pub fn write_outcomes(path: &Path, log: &OutcomeLog) -> Result<()> {
    ensure_parent(path)?;
    let mut writer = WriterBuilder::new().from_path(path)?;
    writer.write_record(OUTCOME_HEADERS)?;
    for record in log.records() {
        writer.write_record(outcome_row(record))?;
    }
    writer.flush()?;
    info!(path = %path.display(), rows = log.len(), summary = %log.summary(), "outcome log written");
    Ok(())
}

/// Appends outcomes batch by batch so progress survives an abort.
///
/// The header is written only when the file is new or empty.
pub struct CheckpointWriter {
    writer: csv::Writer<fs::File>,
}

impl CheckpointWriter {
    pub fn open(path: &Path) -> Result<Self> {
        ensure_parent(path)?;
        let fresh = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
        if fresh {
            writer.write_record(OUTCOME_HEADERS)?;
        }
        Ok(Self { writer })
    }

    pub fn append(&mut self, log: &OutcomeLog) -> Result<()> {
        for record in log.records() {
            self.writer.write_record(outcome_row(record))?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

/// Rows of a CSV file as header-keyed maps.
pub fn read_rows(path: &Path) -> Result<Vec<HashMap<String, String>>> {
    let mut reader = ReaderBuilder::new().from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(
            headers
                .iter()
                .cloned()
                .zip(record.iter().map(|v| v.trim().to_string()))
                .collect(),
        );
    }
    Ok(rows)
}

fn column_index(path: &Path, headers: &StringRecord, column: &str) -> Result<usize> {
    headers
        .iter()
        .position(|h| h.trim() == column)
        .ok_or_else(|| MigrateError::MissingColumn {
            path: path.to_path_buf(),
            column: column.to_string(),
        })
}

/// Read a two-column id mapping. Rows with a blank side are ignored.
pub fn read_id_mapping(path: &Path, source_column: &str, target_column: &str) -> Result<IdMapping> {
    let mut reader = ReaderBuilder::new().from_path(path)?;
    let headers = reader.headers()?.clone();
    let source = column_index(path, &headers, source_column)?;
    let target = column_index(path, &headers, target_column)?;

    let mut mapping = IdMapping::new();
    for record in reader.records() {
        let record = record?;
        let (Some(s), Some(t)) = (record.get(source), record.get(target)) else {
            continue;
        };
        let (s, t) = (s.trim(), t.trim());
        if !s.is_empty() && !t.is_empty() {
            mapping.insert(s.to_string(), t.to_string());
        }
    }
    Ok(mapping)
}

/// Source to target ids of the successful rows of an outcome log.
pub fn read_successful(path: &Path) -> Result<IdMapping> {
    let mut reader = ReaderBuilder::new().from_path(path)?;
    let headers = reader.headers()?.clone();
    let source = column_index(path, &headers, "Source_Id")?;
    let target = column_index(path, &headers, "Target_Id")?;
    let status = column_index(path, &headers, "Status")?;
    let success = Status::Success.to_string();

    let mut mapping = IdMapping::new();
    for record in reader.records() {
        let record = record?;
        if record.get(status).map(str::trim) != Some(success.as_str()) {
            continue;
        }
        if let (Some(s), Some(t)) = (record.get(source), record.get(target)) {
            if !s.trim().is_empty() && !t.trim().is_empty() {
                mapping.insert(s.trim().to_string(), t.trim().to_string());
            }
        }
    }
    Ok(mapping)
}

/// Selected columns of every row, in the order of `columns`.
///
/// Fails with [`MigrateError::MissingColumn`] when the header lacks one.
pub fn read_columns(path: &Path, columns: &[&str]) -> Result<Vec<Vec<String>>> {
    let mut reader = ReaderBuilder::new().from_path(path)?;
    let headers = reader.headers()?.clone();
    let indexes = columns
        .iter()
        .map(|c| column_index(path, &headers, c))
        .collect::<Result<Vec<_>>>()?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(
            indexes
                .iter()
                .map(|&i| record.get(i).unwrap_or_default().trim().to_string())
                .collect(),
        );
    }
    Ok(rows)
}

/// Write rows under the given headers, replacing any existing file.
pub fn write_rows<R, I, S>(path: &Path, headers: &[&str], rows: R) -> Result<usize>
where
    R: IntoIterator<Item = I>,
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    ensure_parent(path)?;
    let mut writer = WriterBuilder::new().from_path(path)?;
    writer.write_record(headers)?;
    let mut count = 0;
    for row in rows {
        writer.write_record(row)?;
        count += 1;
    }
    writer.flush()?;
    info!(path = %path.display(), rows = count, "table written");
    Ok(count)
}
