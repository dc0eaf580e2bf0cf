//! Document filters

use serde_json::Value;

/// Primary key field of every stored document
pub const ID_FIELD: &str = "_id";

/// Stored document (always a JSON object with an `_id` string)
pub type Document = Value;

/// Equality filter over top-level document fields
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every document
    All,
    /// Field equals value
    Eq(String, Value),
    /// Every sub-filter matches
    And(Vec<Filter>),
    /// At least one sub-filter matches
    Or(Vec<Filter>),
}

impl Filter {
    /// `field == value`
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    /// Match on primary key
    pub fn by_id(id: &str) -> Self {
        Self::eq(ID_FIELD, id)
    }

    /// Evaluate against a document
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::All => true,
            Self::Eq(field, value) => doc.get(field) == Some(value),
            Self::And(filters) => filters.iter().all(|f| f.matches(doc)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(doc)),
        }
    }
}

/// Read a document's primary key
pub fn document_id(doc: &Document) -> Option<&str> {
    doc.get(ID_FIELD).and_then(Value::as_str)
}
