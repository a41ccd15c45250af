//! In-memory storage backend.
//!
//! Tables of records keyed by primary key, plus declared associations that
//! resolve through foreign-key fields. Filters are evaluated with the same
//! [`Condition`] evaluator the engine uses, over a view that always has the
//! data. Every fetch is logged so tests can assert on batching behaviour.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};

use crate::batch::FetchSpec;
use crate::condition::Condition;
use crate::error::EvalError;
use crate::facts::{FactSource, Reached};
use crate::need::FieldPath;
use crate::outcome::{Binds, Outcome};
use crate::record::{Queryable, Record, Related, SubjectRef};
use crate::storage::traits::{Store, StoreError};
use crate::value::{Key, Value};

fn lock_err(context: &'static str) -> StoreError {
    StoreError::Backend(format!("poisoned lock: {context}"))
}

/// How an association resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Association {
    /// The owner's `foreign_key` field holds the target's key.
    BelongsTo { target: Queryable, foreign_key: String },
    /// Every target whose `foreign_key` field holds the owner's key.
    HasMany { target: Queryable, foreign_key: String },
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<Queryable, BTreeMap<Key, Record>>,
    associations: HashMap<(Queryable, String), Association>,
}

impl State {
    fn table(&self, queryable: &Queryable) -> Result<&BTreeMap<Key, Record>, StoreError> {
        self.tables
            .get(queryable)
            .ok_or_else(|| StoreError::UnknownQueryable(queryable.to_string()))
    }

    fn association(&self, owner: &Queryable, name: &str) -> Result<&Association, StoreError> {
        self.associations
            .get(&(owner.clone(), name.to_string()))
            .ok_or_else(|| StoreError::UnknownPath {
                queryable: owner.to_string(),
                association: name.to_string(),
            })
    }

    fn resolve(&self, subject: &SubjectRef, name: &str) -> Result<Reached, StoreError> {
        match self.association(&subject.queryable, name)? {
            Association::BelongsTo { target, foreign_key } => {
                let fk = self
                    .tables
                    .get(&subject.queryable)
                    .and_then(|t| t.get(&subject.key))
                    .and_then(|r| r.field(foreign_key));
                let found = fk.and_then(|value| {
                    let table = self.tables.get(target)?;
                    Key::candidates(value)
                        .into_iter()
                        .find(|key| table.contains_key(key))
                        .map(|key| SubjectRef::new(target.clone(), key))
                });
                Ok(Reached::One(found))
            }
            Association::HasMany { target, foreign_key } => {
                let owner_key = subject.key.to_value();
                let matches = self
                    .table(target)?
                    .values()
                    .filter(|r| r.field(foreign_key).is_some_and(|v| v.loose_eq(&owner_key)))
                    .map(|r| r.subject.clone())
                    .collect();
                Ok(Reached::Many(matches))
            }
        }
    }

    fn check_paths(&self, queryable: &Queryable, paths: &[FieldPath]) -> Result<(), StoreError> {
        for path in paths {
            let mut current = queryable.clone();
            for segment in path.segments() {
                current = match self.association(&current, segment)? {
                    Association::BelongsTo { target, .. } | Association::HasMany { target, .. } => target.clone(),
                };
            }
        }
        Ok(())
    }

    fn matching(&self, queryable: &Queryable, filter: &Condition) -> Result<Vec<SubjectRef>, StoreError> {
        let table = self.table(queryable)?;
        let view = StoreView { state: self };
        let env = Binds::new();

        let candidates: Vec<&Record> = match filter {
            Condition::KeyIn { keys } => keys.iter().filter_map(|k| table.get(k)).collect(),
            _ => table.values().collect(),
        };

        let mut out = Vec::new();
        for record in candidates {
            match filter.evaluate(&record.subject, &view, &env) {
                Outcome::Ok { value: true, .. } => out.push(record.subject.clone()),
                Outcome::Ok { value: false, .. } => {}
                Outcome::NotLoaded(_) => {
                    return Err(StoreError::Backend("filter asked for data the store holds".to_string()));
                }
                Outcome::Error(e) => return Err(StoreError::Backend(e.to_string())),
            }
        }
        Ok(out)
    }

    /// Builds a record with the given association paths preloaded.
    fn build(&self, subject: &SubjectRef, paths: &[FieldPath]) -> Result<Option<Record>, StoreError> {
        let Some(base) = self.tables.get(&subject.queryable).and_then(|t| t.get(&subject.key)) else {
            return Ok(None);
        };
        let mut record = Record::new(subject.clone());
        record.fields = base.fields.clone();

        // Group tails by first hop so each association is resolved once.
        let mut by_head: Vec<(String, Vec<FieldPath>)> = Vec::new();
        for path in paths {
            let Some(head) = path.head() else { continue };
            let slot = match by_head.iter().position(|(h, _)| h == head) {
                Some(i) => i,
                None => {
                    by_head.push((head.to_string(), Vec::new()));
                    by_head.len() - 1
                }
            };
            if let Some(tail) = path.tail() {
                by_head[slot].1.push(tail);
            }
        }

        for (name, tails) in by_head {
            let related = match self.resolve(subject, &name)? {
                Reached::One(target) => {
                    let nested = match target {
                        Some(t) => self.build(&t, &tails)?,
                        None => None,
                    };
                    Related::One(nested.map(Box::new))
                }
                Reached::Many(targets) => {
                    let mut records = Vec::with_capacity(targets.len());
                    for t in &targets {
                        if let Some(r) = self.build(t, &tails)? {
                            records.push(r);
                        }
                    }
                    Related::Many(records)
                }
            };
            record.related.insert(name, related);
        }
        Ok(Some(record))
    }
}

/// Read view over the tables, used to evaluate filters.
struct StoreView<'a> {
    state: &'a State,
}

impl FactSource for StoreView<'_> {
    fn field_of(&self, subject: &SubjectRef, field: &str) -> Outcome<Value> {
        let value = self
            .state
            .tables
            .get(&subject.queryable)
            .and_then(|t| t.get(&subject.key))
            .and_then(|r| r.field(field))
            .cloned()
            .unwrap_or(Value::Null);
        Outcome::ok(value)
    }

    fn hop(&self, subject: &SubjectRef, association: &str, _chain: &[String]) -> Outcome<Reached> {
        match self.state.resolve(subject, association) {
            Ok(reached) => Outcome::ok(reached),
            Err(e) => Outcome::error(e.into()),
        }
    }

    fn query_subjects(&self, queryable: &Queryable, filter: &Condition, _preload: &[FieldPath]) -> Outcome<Vec<SubjectRef>> {
        match self.state.matching(queryable, filter) {
            Ok(found) => Outcome::ok(found),
            Err(e) => Outcome::error(e.into()),
        }
    }

    fn call_rule(&self, rule: &str, _subject: &SubjectRef, _args: &Binds) -> Outcome<Value> {
        Outcome::error(EvalError::generic(format!(
            "rule '{rule}' cannot be evaluated inside the store"
        )))
    }
}

/// Thread-safe in-memory [`Store`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
    log: Mutex<Vec<FetchSpec>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record. Preloaded associations on it are ignored;
    /// relations come from declared associations.
    pub fn insert(&self, record: Record) -> Result<(), StoreError> {
        record
            .subject
            .queryable
            .validate()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut state = self.state.write().map_err(|_| lock_err("insert"))?;
        let mut base = Record::new(record.subject.clone());
        base.fields = record.fields;
        state
            .tables
            .entry(record.subject.queryable.clone())
            .or_default()
            .insert(record.subject.key.clone(), base);
        Ok(())
    }

    /// Declares an empty table so that fetches against it succeed.
    pub fn create_table(&self, queryable: impl Into<Queryable>) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| lock_err("create_table"))?;
        state.tables.entry(queryable.into()).or_default();
        Ok(())
    }

    /// Declares `owner.name` as a to-one association through `owner.foreign_key`.
    pub fn belongs_to(
        &self,
        owner: impl Into<Queryable>,
        name: impl Into<String>,
        target: impl Into<Queryable>,
        foreign_key: impl Into<String>,
    ) -> Result<(), StoreError> {
        self.declare(
            owner.into(),
            name.into(),
            Association::BelongsTo {
                target: target.into(),
                foreign_key: foreign_key.into(),
            },
        )
    }

    /// Declares `owner.name` as a to-many association through `target.foreign_key`.
    pub fn has_many(
        &self,
        owner: impl Into<Queryable>,
        name: impl Into<String>,
        target: impl Into<Queryable>,
        foreign_key: impl Into<String>,
    ) -> Result<(), StoreError> {
        self.declare(
            owner.into(),
            name.into(),
            Association::HasMany {
                target: target.into(),
                foreign_key: foreign_key.into(),
            },
        )
    }

    fn declare(&self, owner: Queryable, name: String, association: Association) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| lock_err("declare"))?;
        state.tables.entry(owner.clone()).or_default();
        match &association {
            Association::BelongsTo { target, .. } | Association::HasMany { target, .. } => {
                state.tables.entry(target.clone()).or_default();
            }
        }
        state.associations.insert((owner, name), association);
        Ok(())
    }

    /// Number of fetches served since creation or the last [`reset_log`](Self::reset_log).
    pub fn fetch_count(&self) -> Result<usize, StoreError> {
        let log = self.log.lock().map_err(|_| lock_err("fetch_count"))?;
        Ok(log.len())
    }

    /// Fetches served, in order.
    pub fn fetched_specs(&self) -> Result<Vec<FetchSpec>, StoreError> {
        let log = self.log.lock().map_err(|_| lock_err("fetched_specs"))?;
        Ok(log.clone())
    }

    pub fn reset_log(&self) -> Result<(), StoreError> {
        self.log.lock().map_err(|_| lock_err("reset_log"))?.clear();
        Ok(())
    }
}

impl Store for InMemoryStore {
    fn fetch(&self, spec: &FetchSpec) -> Result<Vec<Record>, StoreError> {
        self.log.lock().map_err(|_| lock_err("fetch log"))?.push(spec.clone());
        let state = self.state.read().map_err(|_| lock_err("fetch"))?;

        state.check_paths(&spec.queryable, &spec.paths)?;
        let subjects = state.matching(&spec.queryable, &spec.filter)?;
        let mut out = Vec::with_capacity(subjects.len());
        for subject in &subjects {
            if let Some(record) = state.build(subject, &spec.paths)? {
                out.push(record);
            }
        }
        tracing::trace!(spec = %spec, records = out.len(), "in-memory fetch");
        Ok(out)
    }
}
