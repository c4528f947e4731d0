//! Error types for the migration pipeline.
//!
//! Per-record problems (missing mappings, rejected payloads) are reported as
//! [`crate::Outcome`] values, not errors. These variants are reserved for
//! conditions that stop a stage or the whole run.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that abort a migration stage.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// Org API error that was not converted into outcomes.
    #[error("org API error: {0}")]
    Api(#[from] orgbridge_api::ApiError),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// CSV read/write failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// File system failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Input table lacks a required column.
    #[error("missing column '{column}' in {}", path.display())]
    MissingColumn { path: PathBuf, column: String },

    /// The target org holds two records for one legacy id.
    #[error("legacy id {legacy_id} on {object} maps to both {first} and {second}")]
    IdentityConflict {
        object: String,
        legacy_id: String,
        first: String,
        second: String,
    },

    /// A remote call failed with an error retrying cannot fix.
    #[error("{operation} was rejected: {message}")]
    Rejected { operation: String, message: String },

    /// A remote call kept failing after every retry.
    #[error("{operation} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        message: String,
    },
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
