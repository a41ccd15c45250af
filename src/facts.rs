//! Read access to subject data, shared by the evaluation cache and stores.
//!
//! Paths follow one convention everywhere: every segment but the last names an
//! association, the last names a field. Association chains are walked hop by
//! hop; a hop that is not loaded yields a single need for the whole remaining
//! chain so the store can preload it in one fetch.

use crate::condition::Condition;
use crate::need::FieldPath;
use crate::outcome::{self, Binds, Outcome};
use crate::record::{Queryable, SubjectRef};
use crate::value::Value;

/// Subjects reached by following an association chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reached {
    /// Only to-one hops so far.
    One(Option<SubjectRef>),
    /// At least one to-many hop.
    Many(Vec<SubjectRef>),
}

impl Reached {
    /// Flattens into a list of subjects.
    #[must_use]
    pub fn into_vec(self) -> Vec<SubjectRef> {
        match self {
            Self::One(s) => s.into_iter().collect(),
            Self::Many(v) => v,
        }
    }
}

/// Something that can answer questions about subjects.
///
/// The evaluation cache answers with `NotLoaded` when data is missing; a store
/// always has the data and never does.
pub trait FactSource {
    /// Reads a scalar field of a subject. Absent subjects read as `Null`.
    fn field_of(&self, subject: &SubjectRef, field: &str) -> Outcome<Value>;

    /// Follows one association. `chain` is the remaining chain starting with
    /// `association`, used to describe what to load when the hop is missing.
    fn hop(&self, subject: &SubjectRef, association: &str, chain: &[String]) -> Outcome<Reached>;

    /// Subjects of `queryable` matching `filter`.
    fn query_subjects(
        &self,
        queryable: &Queryable,
        filter: &Condition,
        preload: &[FieldPath],
    ) -> Outcome<Vec<SubjectRef>>;

    /// Evaluates a named rule for a subject.
    fn call_rule(&self, rule: &str, subject: &SubjectRef, args: &Binds) -> Outcome<Value>;

    /// Looks up a caller-supplied argument.
    fn arg(&self, _name: &str) -> Option<Value> {
        None
    }
}

/// Follows an association chain from `start`.
pub fn follow<S: FactSource + ?Sized>(source: &S, start: &SubjectRef, chain: &[String]) -> Outcome<Reached> {
    let mut frontier = Reached::One(Some(start.clone()));
    for (i, association) in chain.iter().enumerate() {
        let rest = &chain[i..];
        let next = match frontier {
            Reached::One(None) => return Outcome::ok(Reached::One(None)),
            Reached::One(Some(subject)) => source.hop(&subject, association, rest),
            Reached::Many(subjects) => outcome::map_all(&subjects, |s| source.hop(s, association, rest))
                .map(|parts| Reached::Many(parts.into_iter().flat_map(Reached::into_vec).collect())),
        };
        frontier = match next {
            Outcome::Ok { value, .. } => value,
            Outcome::NotLoaded(needs) => return Outcome::NotLoaded(needs),
            Outcome::Error(e) => return Outcome::Error(e),
        };
    }
    Outcome::ok(frontier)
}

/// What a path read produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Read {
    /// The field of a single subject (possibly itself a list).
    One(Value),
    /// The field of every subject reached through a to-many hop.
    Fanned(Vec<Value>),
}

impl Read {
    /// Collapses a fan-out into a list value.
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Self::One(v) => v,
            Self::Fanned(vs) => Value::List(vs),
        }
    }
}

/// Reads `path`, keeping track of whether a to-many association was crossed.
pub fn read_values<S: FactSource + ?Sized>(source: &S, subject: &SubjectRef, path: &FieldPath) -> Outcome<Read> {
    let segments = path.segments();
    let Some((field, chain)) = segments.split_last() else {
        return Outcome::ok(Read::One(Value::Ref(subject.clone())));
    };
    follow(source, subject, chain).then(|reached| match reached {
        Reached::One(None) => Outcome::ok(Read::One(Value::Null)),
        Reached::One(Some(target)) => source.field_of(&target, field).map(Read::One),
        Reached::Many(targets) => outcome::map_all(&targets, |t| source.field_of(t, field)).map(Read::Fanned),
    })
}

/// Reads the value at `path`. Crossing a to-many association yields a list.
pub fn read_path<S: FactSource + ?Sized>(source: &S, subject: &SubjectRef, path: &FieldPath) -> Outcome<Value> {
    read_values(source, subject, path).map(Read::into_value)
}

/// Subjects at the end of an all-association path.
pub fn related<S: FactSource + ?Sized>(source: &S, subject: &SubjectRef, path: &FieldPath) -> Outcome<Vec<SubjectRef>> {
    follow(source, subject, path.segments()).map(Reached::into_vec)
}
