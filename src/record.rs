//! Subjects and records.
//!
//! A subject is identified by its queryable (entity type) and primary key. A
//! record is what the store returns for a subject: its scalar fields plus any
//! association paths that were requested for preloading.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::value::{Key, Value};

/// Name of a queryable entity type (a table, collection or model).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Queryable(String);

impl Queryable {
    /// Creates a queryable, rejecting blank names.
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyQueryable);
        }
        Ok(Self(name))
    }

    /// Returns the name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Checks the name is not blank.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.0.trim().is_empty() {
            Err(ValidationError::EmptyQueryable)
        } else {
            Ok(())
        }
    }
}

impl fmt::Display for Queryable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Queryable {
    fn from(v: &str) -> Self {
        Self(v.to_string())
    }
}

impl From<String> for Queryable {
    fn from(v: String) -> Self {
        Self(v)
    }
}

/// Reference to one subject: queryable plus primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectRef {
    /// Entity type of the subject.
    pub queryable: Queryable,
    /// Primary key within the queryable.
    pub key: Key,
}

impl SubjectRef {
    /// Creates a subject reference.
    #[must_use]
    pub fn new(queryable: impl Into<Queryable>, key: impl Into<Key>) -> Self {
        Self {
            queryable: queryable.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.queryable, self.key)
    }
}

/// A preloaded association on a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cardinality", content = "records", rename_all = "snake_case")]
pub enum Related {
    /// To-one association; `None` when the foreign record does not exist.
    One(Option<Box<Record>>),
    /// To-many association, in store order.
    Many(Vec<Record>),
}

/// A record as returned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Which subject this record is.
    pub subject: SubjectRef,
    /// Scalar fields. A field holding `Null` is loaded and nil.
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    /// Preloaded associations keyed by association name.
    #[serde(default)]
    pub related: BTreeMap<String, Related>,
}

impl Record {
    /// Creates a record with no fields.
    #[must_use]
    pub fn new(subject: SubjectRef) -> Self {
        Self {
            subject,
            fields: BTreeMap::new(),
            related: BTreeMap::new(),
        }
    }

    /// Sets a field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Attaches a to-one association.
    #[must_use]
    pub fn with_one(mut self, name: impl Into<String>, record: Option<Record>) -> Self {
        self.related.insert(name.into(), Related::One(record.map(Box::new)));
        self
    }

    /// Attaches a to-many association.
    #[must_use]
    pub fn with_many(mut self, name: impl Into<String>, records: Vec<Record>) -> Self {
        self.related.insert(name.into(), Related::Many(records));
        self
    }

    /// Returns a field value, if present.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}
