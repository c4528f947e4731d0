//! Core types shared by the org clients.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A record as returned by the query API: a JSON object keyed by field name.
///
/// Relationship fields (`What.Type`) appear as nested objects.
pub type Record = Map<String, Value>;

/// Key prefix of group ids (queues and public groups).
pub const GROUP_KEY_PREFIX: &str = "00G";

/// Key prefix of user ids.
pub const USER_KEY_PREFIX: &str = "005";

/// Convenience accessors on [`Record`].
pub trait RecordExt {
    /// The record's `Id` field.
    fn id(&self) -> Option<&str>;

    /// Look up a possibly dotted field path (`What.Type`).
    fn path(&self, path: &str) -> Option<&Value>;

    /// Look up a field path as a non-empty string.
    fn path_str(&self, path: &str) -> Option<&str>;
}

impl RecordExt for Record {
    fn id(&self) -> Option<&str> {
        self.path_str("Id")
    }

    fn path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        if current.is_null() { None } else { Some(current) }
    }

    fn path_str(&self, path: &str) -> Option<&str> {
        self.path(path)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// The three-character key prefix of a record id.
pub fn key_prefix(id: &str) -> Option<&str> {
    id.get(..3)
}

/// Authenticated session returned by the OAuth token endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub instance_url: String,
}

/// Credentials for one org.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrgCredentials {
    /// Login host, e.g. `https://login.salesforce.com`.
    pub login_url: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub security_token: String,
    pub client_id: String,
    pub client_secret: String,
}

/// One error entry attached to a rejected record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordError {
    #[serde(default)]
    pub status_code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.fields.is_empty() {
            write!(f, "{}: {}", self.status_code, self.message)
        } else {
            write!(
                f,
                "{}: {} ({})",
                self.status_code,
                self.message,
                self.fields.join(", ")
            )
        }
    }
}

/// Per-record result of a batch insert or update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveResult {
    #[serde(default)]
    pub id: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<RecordError>,
}

impl SaveResult {
    /// A successful result for the given id.
    pub fn ok(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            success: true,
            errors: Vec::new(),
        }
    }

    /// A failed result with a single error.
    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: None,
            success: false,
            errors: vec![RecordError {
                status_code: code.into(),
                message: message.into(),
                fields: Vec::new(),
            }],
        }
    }

    /// All errors joined into one line.
    pub fn error_message(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// One picklist entry of a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PicklistValue {
    pub value: String,
    #[serde(default)]
    pub label: Option<String>,
    pub active: bool,
}

/// Field metadata from the describe call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescribe {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub createable: bool,
    #[serde(default)]
    pub updateable: bool,
    #[serde(default)]
    pub filterable: bool,
    #[serde(default)]
    pub picklist_values: Vec<PicklistValue>,
}

impl FieldDescribe {
    /// Whether this is a picklist or multi-select picklist.
    pub fn is_picklist(&self) -> bool {
        matches!(self.field_type.as_str(), "picklist" | "multipicklist")
    }
}

/// Object metadata from the describe call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDescribe {
    pub name: String,
    #[serde(default)]
    pub key_prefix: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDescribe>,
}

impl ObjectDescribe {
    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldDescribe> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Response page of the query endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QueryPage {
    pub records: Vec<Record>,
    pub done: bool,
    #[serde(default)]
    pub next_records_url: Option<String>,
}
