//! Data needs: structurally identified pieces of missing data.
//!
//! Evaluation that touches data absent from the cache does not fail; it returns
//! the set of needs that would let it continue. Needs deduplicate by structural
//! equality and keep first-seen order, so batching stays reproducible.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::error::ValidationError;
use crate::record::{Queryable, SubjectRef};

/// Dotted path of field or association names, e.g. `manager.department.name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Creates a path from segments, rejecting empty paths and segments.
    pub fn new<I, S>(segments: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() || segments.iter().any(|s| s.trim().is_empty()) {
            return Err(ValidationError::EmptyFieldPath);
        }
        Ok(Self(segments))
    }

    /// Parses a dotted path.
    pub fn parse(path: &str) -> Result<Self, ValidationError> {
        Self::new(path.split('.'))
    }

    /// Returns the path segments.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Number of segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the path has no segments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First segment.
    #[must_use]
    pub fn head(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Path without its first segment, or `None` for single-segment paths.
    #[must_use]
    pub fn tail(&self) -> Option<Self> {
        (self.0.len() > 1).then(|| Self(self.0[1..].to_vec()))
    }

    /// Path of the first `n` segments, or `None` when `n` is zero.
    #[must_use]
    pub fn prefix(&self, n: usize) -> Option<Self> {
        (n > 0).then(|| Self(self.0[..n.min(self.0.len())].to_vec()))
    }

    /// Appends a segment.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// Returns true if `self` is a (non-strict) prefix of `other`.
    #[must_use]
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// Unchecked conversion for literals; empty segments are dropped.
impl From<&str> for FieldPath {
    fn from(v: &str) -> Self {
        Self(
            v.split('.')
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
                .collect(),
        )
    }
}

/// A missing piece of data blocking evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataNeed {
    /// The subject's own record is not cached.
    Subject {
        /// Subject to load.
        subject: SubjectRef,
    },
    /// An association chain hanging off a cached subject is not loaded.
    Path {
        /// Subject owning the chain.
        subject: SubjectRef,
        /// Association chain to preload.
        path: FieldPath,
    },
    /// A predicate query whose matching subjects are not known.
    Query {
        /// What to query.
        queryable: Queryable,
        /// Filter, with bound references already substituted.
        filter: Condition,
        /// Association paths to preload on the matches.
        preload: Vec<FieldPath>,
    },
}

impl DataNeed {
    /// Need for a subject's base record.
    #[must_use]
    pub fn subject(subject: SubjectRef) -> Self {
        Self::Subject { subject }
    }

    /// Need for an association chain on a subject.
    #[must_use]
    pub fn path(subject: SubjectRef, path: FieldPath) -> Self {
        Self::Path { subject, path }
    }

    /// Need for the result of a predicate query.
    #[must_use]
    pub fn query(queryable: Queryable, filter: Condition, preload: Vec<FieldPath>) -> Self {
        Self::Query {
            queryable,
            filter,
            preload,
        }
    }

    /// Queryable the need is fetched from.
    #[must_use]
    pub fn queryable(&self) -> &Queryable {
        match self {
            Self::Subject { subject } | Self::Path { subject, .. } => &subject.queryable,
            Self::Query { queryable, .. } => queryable,
        }
    }
}

impl fmt::Display for DataNeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subject { subject } => write!(f, "need({subject})"),
            Self::Path { subject, path } => write!(f, "need({subject}, {path})"),
            Self::Query { queryable, .. } => write!(f, "need(query {queryable})"),
        }
    }
}

/// Insertion-ordered set of needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<DataNeed>", into = "Vec<DataNeed>")]
pub struct NeedSet {
    order: Vec<DataNeed>,
    seen: HashSet<DataNeed>,
}

impl NeedSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set holding one need.
    #[must_use]
    pub fn single(need: DataNeed) -> Self {
        let mut set = Self::new();
        set.insert(need);
        set
    }

    /// Inserts a need. Returns false if it was already present.
    pub fn insert(&mut self, need: DataNeed) -> bool {
        if self.seen.contains(&need) {
            return false;
        }
        self.seen.insert(need.clone());
        self.order.push(need);
        true
    }

    /// Adds every need of `other`, keeping first-seen order.
    pub fn union_with(&mut self, other: Self) {
        for need in other.order {
            self.insert(need);
        }
    }

    /// Returns the union of two sets.
    #[must_use]
    pub fn union(mut self, other: Self) -> Self {
        self.union_with(other);
        self
    }

    /// Returns true if the need is present.
    #[must_use]
    pub fn contains(&self, need: &DataNeed) -> bool {
        self.seen.contains(need)
    }

    /// Number of distinct needs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if there are no needs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Iterates in first-seen order.
    pub fn iter(&self) -> std::slice::Iter<'_, DataNeed> {
        self.order.iter()
    }
}

// Set semantics: order is an implementation detail of reproducible batching.
impl PartialEq for NeedSet {
    fn eq(&self, other: &Self) -> bool {
        self.seen == other.seen
    }
}

impl Eq for NeedSet {}

impl From<Vec<DataNeed>> for NeedSet {
    fn from(needs: Vec<DataNeed>) -> Self {
        needs.into_iter().collect()
    }
}

impl From<NeedSet> for Vec<DataNeed> {
    fn from(set: NeedSet) -> Self {
        set.order
    }
}

impl FromIterator<DataNeed> for NeedSet {
    fn from_iter<I: IntoIterator<Item = DataNeed>>(iter: I) -> Self {
        let mut set = Self::new();
        for need in iter {
            set.insert(need);
        }
        set
    }
}

impl Extend<DataNeed> for NeedSet {
    fn extend<I: IntoIterator<Item = DataNeed>>(&mut self, iter: I) {
        for need in iter {
            self.insert(need);
        }
    }
}

impl IntoIterator for NeedSet {
    type Item = DataNeed;
    type IntoIter = std::vec::IntoIter<DataNeed>;

    fn into_iter(self) -> Self::IntoIter {
        self.order.into_iter()
    }
}

impl<'a> IntoIterator for &'a NeedSet {
    type Item = &'a DataNeed;
    type IntoIter = std::slice::Iter<'a, DataNeed>;

    fn into_iter(self) -> Self::IntoIter {
        self.order.iter()
    }
}
