//! Structured queries, rendered to SOQL for the REST client.
//!
//! Callers build a [`Query`] from typed filters instead of formatting query
//! strings by hand; the in-memory org evaluates the same structure directly.

use serde_json::Value;

/// A single WHERE-clause term. Terms of one query are joined with AND.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `field IN ('a', 'b')`
    In { field: String, values: Vec<String> },
    /// `field = value`
    Eq { field: String, value: Value },
    /// `field != null`
    NotNull(String),
    /// `(a != null OR b != null ...)`
    AnyNotNull(Vec<String>),
    /// An opaque condition supplied by configuration, wrapped in parentheses.
    Raw(String),
}

impl Filter {
    pub fn is_in<I, S>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Filter::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn not_null(field: impl Into<String>) -> Self {
        Filter::NotNull(field.into())
    }

    pub fn any_not_null<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Filter::AnyNotNull(fields.into_iter().map(Into::into).collect())
    }

    /// A raw condition. Blank conditions become `None` so callers can pass
    /// optional policy strings straight through.
    pub fn raw(condition: &str) -> Option<Self> {
        let trimmed = condition.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Filter::Raw(trimmed.to_string()))
        }
    }

    fn to_soql(&self) -> String {
        match self {
            Filter::In { field, values } => {
                let quoted: Vec<String> = values.iter().map(|v| quote(v)).collect();
                format!("{} IN ({})", field, quoted.join(", "))
            }
            Filter::Eq { field, value } => format!("{} = {}", field, literal(value)),
            Filter::NotNull(field) => format!("{} != null", field),
            Filter::AnyNotNull(fields) => {
                let terms: Vec<String> = fields.iter().map(|f| format!("{} != null", f)).collect();
                format!("({})", terms.join(" OR "))
            }
            Filter::Raw(condition) => format!("({})", condition),
        }
    }
}

/// A SELECT over one object.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub object: String,
    pub fields: Vec<String>,
    pub filters: Vec<Filter>,
    pub order_by: Option<String>,
    pub limit: Option<usize>,
}

impl Query {
    /// Start a query selecting `fields` from `object`.
    pub fn select<I, S>(object: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            object: object.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Add a filter if present.
    pub fn filter_opt(mut self, filter: Option<Filter>) -> Self {
        if let Some(filter) = filter {
            self.filters.push(filter);
        }
        self
    }

    pub fn order_by(mut self, clause: impl Into<String>) -> Self {
        self.order_by = Some(clause.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Render as a SOQL statement.
    pub fn to_soql(&self) -> String {
        let fields = if self.fields.is_empty() {
            "Id".to_string()
        } else {
            self.fields.join(", ")
        };
        let mut soql = format!("SELECT {} FROM {}", fields, self.object);
        if !self.filters.is_empty() {
            let terms: Vec<String> = self.filters.iter().map(Filter::to_soql).collect();
            soql.push_str(" WHERE ");
            soql.push_str(&terms.join(" AND "));
        }
        if let Some(order) = &self.order_by {
            soql.push_str(" ORDER BY ");
            soql.push_str(order);
        }
        if let Some(limit) = self.limit {
            soql.push_str(&format!(" LIMIT {}", limit));
        }
        soql
    }
}

/// Quote a string literal, escaping backslashes and single quotes.
fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

fn literal(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote(s),
        other => quote(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_render_in_and_raw() {
        let query = Query::select("Task", ["Id", "WhatId", "What.Type"])
            .filter(Filter::is_in("WhatId", ["001A", "001B"]))
            .filter_opt(Filter::raw("Status != 'Deferred'"));
        assert_eq!(
            query.to_soql(),
            "SELECT Id, WhatId, What.Type FROM Task WHERE WhatId IN ('001A', '001B') AND (Status != 'Deferred')"
        );
    }

    #[test]
    fn test_render_eq_literals() {
        let query = Query::select("ContentVersion", ["Id"])
            .filter(Filter::eq("IsLatest", true))
            .filter(Filter::eq("Title", "it's"))
            .order_by("CreatedDate DESC")
            .limit(1);
        assert_eq!(
            query.to_soql(),
            "SELECT Id FROM ContentVersion WHERE IsLatest = true AND Title = 'it\\'s' ORDER BY CreatedDate DESC LIMIT 1"
        );
    }

    #[test]
    fn test_blank_raw_condition_is_dropped() {
        assert_eq!(Filter::raw("   "), None);
        let query = Query::select("Account", Vec::<String>::new()).filter_opt(Filter::raw(""));
        assert_eq!(query.to_soql(), "SELECT Id FROM Account");
    }

    #[test]
    fn test_not_null() {
        let query = Query::select("Contact", ["Id"]).filter(Filter::not_null("Legacy_Id__c"));
        assert_eq!(
            query.to_soql(),
            "SELECT Id FROM Contact WHERE Legacy_Id__c != null"
        );
    }

    #[test]
    fn test_any_not_null() {
        let query = Query::select("Contact", ["Id", "Phone", "Email"])
            .filter(Filter::any_not_null(["Phone", "Email"]))
            .filter(Filter::not_null("Legacy_Id__c"));
        assert_eq!(
            query.to_soql(),
            "SELECT Id, Phone, Email FROM Contact WHERE (Phone != null OR Email != null) AND Legacy_Id__c != null"
        );
    }

    /// Undo [`quote`]: strip the outer quotes and resolve escapes. `None` if
    /// a quote inside the literal is left unescaped.
    fn unquote(literal: &str) -> Option<String> {
        let inner = literal.strip_prefix('\'')?.strip_suffix('\'')?;
        let mut out = String::new();
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => out.push(chars.next()?),
                '\'' => return None,
                other => out.push(other),
            }
        }
        Some(out)
    }

    proptest::proptest! {
        #[test]
        fn quoted_literals_never_break_out(value in ".{0,40}") {
            let literal = quote(&value);
            proptest::prop_assert_eq!(unquote(&literal), Some(value));
        }
    }
}
