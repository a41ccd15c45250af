//! Grouping of data needs into fetch specifications.
//!
//! Needs that share a queryable and a path are merged into one fetch with a
//! `KeyIn` filter over all their keys, so loading the manager of N people is a
//! single request rather than N. Groups and the keys inside them keep the order
//! in which needs were first added; the same needs in the same order always
//! produce byte-identical fetch specifications.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::need::{DataNeed, FieldPath, NeedSet};
use crate::record::Queryable;
use crate::value::Key;

/// A request the store can execute: subjects of `queryable` matching `filter`,
/// with the association `paths` preloaded on each.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetchSpec {
    /// What to fetch.
    pub queryable: Queryable,
    /// Which subjects; a `KeyIn` filter for key loads.
    pub filter: Condition,
    /// Association chains to preload on every result.
    #[serde(default)]
    pub paths: Vec<FieldPath>,
}

impl FetchSpec {
    /// Creates a fetch specification.
    #[must_use]
    pub fn new(queryable: Queryable, filter: Condition, paths: Vec<FieldPath>) -> Self {
        Self {
            queryable,
            filter,
            paths,
        }
    }

    /// Keys of a pure key lookup, if that is what this spec is.
    #[must_use]
    pub fn keys(&self) -> Option<&[Key]> {
        match &self.filter {
            Condition::KeyIn { keys } => Some(keys),
            _ => None,
        }
    }

    /// Content hash used to detect a spec that was already fetched.
    ///
    /// Stable within a process; not meant to be persisted.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Blake3Hasher(blake3::Hasher::new());
        self.hash(&mut hasher);
        Fingerprint(*hasher.0.finalize().as_bytes())
    }
}

impl fmt::Display for FetchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.keys() {
            Some(keys) => write!(f, "fetch {} ({} keys)", self.queryable, keys.len())?,
            None => write!(f, "fetch {} (query)", self.queryable)?,
        }
        if !self.paths.is_empty() {
            let paths: Vec<String> = self.paths.iter().map(ToString::to_string).collect();
            write!(f, " with [{}]", paths.join(", "))?;
        }
        Ok(())
    }
}

/// Routes `Hash` output into blake3 so the digest is full width.
struct Blake3Hasher(blake3::Hasher);

impl Hasher for Blake3Hasher {
    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn finish(&self) -> u64 {
        let digest = self.0.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(head)
    }
}

/// blake3 digest of a [`FetchSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum GroupKey {
    Load {
        queryable: Queryable,
        path: Option<FieldPath>,
    },
    Query {
        queryable: Queryable,
        preload: Vec<FieldPath>,
    },
}

#[derive(Debug, Clone)]
enum Members {
    Keys(Vec<Key>),
    Filters(Vec<Condition>),
}

#[derive(Debug, Clone)]
struct Group {
    key: GroupKey,
    members: Members,
    needs: Vec<DataNeed>,
}

/// One merged fetch and the needs it satisfies.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// The merged fetch.
    pub spec: FetchSpec,
    /// Needs answered by it, in first-seen order.
    pub needs: Vec<DataNeed>,
}

/// Accumulates needs into groups.
#[derive(Debug, Clone, Default)]
pub struct BatchState {
    groups: Vec<Group>,
    index: HashMap<GroupKey, usize>,
}

impl BatchState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a state from a need set, in the set's order.
    #[must_use]
    pub fn from_needs(needs: &NeedSet) -> Self {
        let mut state = Self::new();
        for need in needs {
            state.push(need.clone());
        }
        state
    }

    /// Adds a need, returning the updated state.
    #[must_use]
    pub fn add_need(mut self, need: DataNeed) -> Self {
        self.push(need);
        self
    }

    /// Adds a need in place. Adding a need already present is a no-op.
    pub fn push(&mut self, need: DataNeed) {
        let (key, member) = match &need {
            DataNeed::Subject { subject } => (
                GroupKey::Load {
                    queryable: subject.queryable.clone(),
                    path: None,
                },
                Member::Key(subject.key.clone()),
            ),
            DataNeed::Path { subject, path } => (
                GroupKey::Load {
                    queryable: subject.queryable.clone(),
                    path: Some(path.clone()),
                },
                Member::Key(subject.key.clone()),
            ),
            DataNeed::Query {
                queryable,
                filter,
                preload,
            } => (
                GroupKey::Query {
                    queryable: queryable.clone(),
                    preload: preload.clone(),
                },
                Member::Filter(filter.clone()),
            ),
        };

        let slot = match self.index.get(&key) {
            Some(&i) => i,
            None => {
                let members = match member {
                    Member::Key(_) => Members::Keys(Vec::new()),
                    Member::Filter(_) => Members::Filters(Vec::new()),
                };
                self.groups.push(Group {
                    key: key.clone(),
                    members,
                    needs: Vec::new(),
                });
                self.index.insert(key, self.groups.len() - 1);
                self.groups.len() - 1
            }
        };

        let group = &mut self.groups[slot];
        let added = match (&mut group.members, member) {
            (Members::Keys(keys), Member::Key(k)) => push_unique(keys, k),
            (Members::Filters(filters), Member::Filter(f)) => push_unique(filters, f),
            // Group keys encode the member kind, so these never mix.
            _ => false,
        };
        if added {
            group.needs.push(need);
        }
    }

    /// Number of distinct groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// One fetch specification per group, in first-seen order.
    #[must_use]
    pub fn get_batches(&self) -> Vec<FetchSpec> {
        self.groups.iter().map(Group::spec).collect()
    }

    /// Fetch specifications paired with the needs each one covers.
    #[must_use]
    pub fn batches(&self) -> Vec<Batch> {
        self.groups
            .iter()
            .map(|g| Batch {
                spec: g.spec(),
                needs: g.needs.clone(),
            })
            .collect()
    }
}

enum Member {
    Key(Key),
    Filter(Condition),
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) -> bool {
    if items.contains(&item) {
        return false;
    }
    items.push(item);
    true
}

impl Group {
    fn spec(&self) -> FetchSpec {
        match (&self.key, &self.members) {
            (GroupKey::Load { queryable, path }, Members::Keys(keys)) => FetchSpec::new(
                queryable.clone(),
                Condition::key_in(keys.clone()),
                path.iter().cloned().collect(),
            ),
            (GroupKey::Query { queryable, preload }, Members::Filters(filters)) => {
                let filter = match filters.as_slice() {
                    [single] => single.clone(),
                    many => Condition::or(many.to_vec()),
                };
                // Enough associations come along to re-check each filter locally.
                let mut paths = preload.clone();
                for filter in filters {
                    for p in filter.association_paths() {
                        if !paths.contains(&p) {
                            paths.push(p);
                        }
                    }
                }
                FetchSpec::new(queryable.clone(), filter, paths)
            }
            (GroupKey::Load { queryable, .. } | GroupKey::Query { queryable, .. }, _) => {
                FetchSpec::new(queryable.clone(), Condition::never(), Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SubjectRef;
    use crate::value::Value;

    fn person(key: i64) -> SubjectRef {
        SubjectRef::new("Person", key)
    }

    fn manager_of(key: i64) -> DataNeed {
        DataNeed::path(person(key), FieldPath::from("manager"))
    }

    #[test]
    fn test_same_path_needs_merge_into_one_fetch() {
        let state = BatchState::new()
            .add_need(manager_of(1))
            .add_need(manager_of(2))
            .add_need(manager_of(3));

        let specs = state.get_batches();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].queryable.as_str(), "Person");
        assert_eq!(specs[0].keys(), Some(&[Key::Int(1), Key::Int(2), Key::Int(3)][..]));
        assert_eq!(specs[0].paths, vec![FieldPath::from("manager")]);
    }

    #[test]
    fn test_different_paths_stay_apart() {
        let state = BatchState::new()
            .add_need(manager_of(1))
            .add_need(DataNeed::subject(person(2)))
            .add_need(DataNeed::subject(SubjectRef::new("Team", 9)))
            .add_need(manager_of(4));

        let specs = state.get_batches();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].keys(), Some(&[Key::Int(1), Key::Int(4)][..]));
        assert!(specs[1].paths.is_empty());
        assert_eq!(specs[2].queryable.as_str(), "Team");
    }

    #[test]
    fn test_duplicate_need_is_ignored() {
        let state = BatchState::new().add_need(manager_of(1)).add_need(manager_of(1));
        let batches = state.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].needs.len(), 1);
        assert_eq!(batches[0].spec.keys().map(<[Key]>::len), Some(1));
    }

    #[test]
    fn test_query_needs_merge_with_or() {
        let q = Queryable::from("Person");
        let a = DataNeed::query(q.clone(), Condition::eq("team_id", 1), Vec::new());
        let b = DataNeed::query(q, Condition::eq("manager.team_id", 2), Vec::new());
        let specs = BatchState::new().add_need(a).add_need(b).get_batches();
        assert_eq!(specs.len(), 1);
        assert_eq!(
            specs[0].filter,
            Condition::or(vec![Condition::eq("team_id", 1), Condition::eq("manager.team_id", 2)])
        );
        assert_eq!(specs[0].paths, vec![FieldPath::from("manager")]);
    }

    #[test]
    fn test_batches_are_deterministic() {
        let needs: NeedSet = vec![manager_of(3), DataNeed::subject(person(1)), manager_of(2)].into();
        let first = BatchState::from_needs(&needs).get_batches();
        let second = BatchState::from_needs(&needs).get_batches();
        assert_eq!(first, second);
        let fp: Vec<_> = first.iter().map(FetchSpec::fingerprint).collect();
        let fp2: Vec<_> = second.iter().map(FetchSpec::fingerprint).collect();
        assert_eq!(fp, fp2);
    }

    #[test]
    fn test_fingerprint_differs_by_keys() {
        let a = BatchState::new().add_need(manager_of(1)).get_batches();
        let b = BatchState::new().add_need(manager_of(2)).get_batches();
        assert_ne!(a[0].fingerprint(), b[0].fingerprint());
    }

    #[test]
    fn test_fingerprint_covers_every_operand() {
        let spec = |v: Value| FetchSpec::new(Queryable::from("Person"), Condition::eq("score", v), Vec::new());
        let nan = spec(Value::Float(f64::NAN));
        assert_eq!(nan.fingerprint(), nan.clone().fingerprint());
        assert_ne!(nan.fingerprint(), spec(Value::Null).fingerprint());

        let a = spec(Value::Structured(serde_json::json!({"tier": 1})));
        let b = spec(Value::Structured(serde_json::json!({"tier": 2})));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_spec_display() {
        let spec = BatchState::new().add_need(manager_of(1)).get_batches().remove(0);
        assert_eq!(spec.to_string(), "fetch Person (1 keys) with [manager]");
    }
}
