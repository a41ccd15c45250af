//! Lazy query descriptions.
//!
//! A [`Scope`] names a queryable and the conditions its subjects must satisfy.
//! It never runs by itself: a unit asks the context for its matches, which
//! either answers from the cache or reports a query need that the resolution
//! loop lowers into a fetch.

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::error::{EvalError, ValidationError};
use crate::facts::FactSource;
use crate::need::{DataNeed, FieldPath};
use crate::outcome::{Binds, Outcome};
use crate::record::{Queryable, SubjectRef};
use crate::value::Value;

/// A query over one queryable, narrowed by conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    queryable: Queryable,
    #[serde(default)]
    conditions: Vec<Condition>,
    #[serde(default)]
    preload: Vec<FieldPath>,
    #[serde(default)]
    binds: Binds,
}

impl Scope {
    /// A scope matching every subject of `queryable`.
    #[must_use]
    pub fn new(queryable: impl Into<Queryable>) -> Self {
        Self {
            queryable: queryable.into(),
            conditions: Vec::new(),
            preload: Vec::new(),
            binds: Binds::new(),
        }
    }

    #[must_use]
    pub const fn queryable(&self) -> &Queryable {
        &self.queryable
    }

    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    #[must_use]
    pub fn preloads(&self) -> &[FieldPath] {
        &self.preload
    }

    /// Narrows the scope.
    #[must_use]
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Returns a narrowed copy, leaving `self` untouched.
    #[must_use]
    pub fn add_conditions(&self, extra: impl IntoIterator<Item = Condition>) -> Self {
        let mut scope = self.clone();
        scope.conditions.extend(extra);
        scope
    }

    /// Requests an association chain to be loaded with every match.
    #[must_use]
    pub fn preload(mut self, path: impl Into<FieldPath>) -> Self {
        let path = path.into();
        if !self.preload.contains(&path) {
            self.preload.push(path);
        }
        self
    }

    /// Binds a value for `Bound` operands in the conditions.
    #[must_use]
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.binds.insert(name.into(), value.into());
        self
    }

    /// Conjunction of all conditions.
    #[must_use]
    pub fn filter(&self) -> Condition {
        self.conditions
            .iter()
            .cloned()
            .fold(Condition::always(), Condition::conjoin)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.queryable.validate()?;
        self.conditions.iter().try_for_each(Condition::validate)
    }

    fn bound_filter(&self, env: &Binds) -> Result<Condition, EvalError> {
        let mut all = env.clone();
        all.extend(self.binds.clone());
        self.filter().bind_refs(&all)
    }

    /// The query need for this scope, with bound references substituted.
    pub fn need(&self, env: &Binds) -> Result<DataNeed, EvalError> {
        Ok(DataNeed::query(
            self.queryable.clone(),
            self.bound_filter(env)?,
            self.preload.clone(),
        ))
    }

    /// Subjects currently known to match, in store order.
    pub fn lookup<S: FactSource + ?Sized>(&self, source: &S, env: &Binds) -> Outcome<Vec<SubjectRef>> {
        match self.bound_filter(env) {
            Ok(filter) => source.query_subjects(&self.queryable, &filter, &self.preload),
            Err(e) => Outcome::error(e),
        }
    }

    /// Tests one subject for membership.
    pub fn matches<S: FactSource + ?Sized>(&self, subject: &SubjectRef, source: &S, env: &Binds) -> Outcome<bool> {
        if subject.queryable != self.queryable {
            return Outcome::ok(false);
        }
        let mut all = env.clone();
        all.extend(self.binds.clone());
        self.filter().evaluate(subject, source, &all)
    }
}
