//! Evaluation context: configuration, the per-call cache, and the read view
//! handed to evaluation units.
//!
//! An [`EvaluationContext`] is owned by one resolution loop. Units never see it
//! directly; they get an [`EvalContext`], a borrowed read-only view that answers
//! from the cache and reports anything missing as a [`DataNeed`]. The cache is
//! written only by the loop, between passes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::batch::{Batch, Fingerprint};
use crate::condition::Condition;
use crate::error::{AbortReason, EvalError, ValidationError};
use crate::facts::{self, FactSource, Reached};
use crate::need::{DataNeed, FieldPath};
use crate::outcome::{self, Binds, Outcome};
use crate::record::{Queryable, Record, Related, SubjectRef};
use crate::rules::RuleRegistry;
use crate::scope::Scope;
use crate::value::Value;

/// Nested rule calls deeper than this fail instead of overflowing the stack.
const MAX_RULE_DEPTH: usize = 64;

/// Per-call evaluation options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalOptions {
    /// Wall-clock budget for the whole call.
    pub timeout_ms: u64,
    /// Maximum number of fetch rounds.
    pub max_passes: usize,
    /// Raise absent results and aborted calls as errors.
    pub strict: bool,
    /// Conditions every evaluated subject (or queried match) must also satisfy.
    pub extra_filters: Vec<Condition>,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_passes: 16,
            strict: true,
            extra_filters: Vec::new(),
        }
    }
}

impl EvalOptions {
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    #[must_use]
    pub fn with_max_passes(mut self, max_passes: usize) -> Self {
        self.max_passes = max_passes;
        self
    }

    #[must_use]
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    #[must_use]
    pub fn with_extra_filter(mut self, filter: Condition) -> Self {
        self.extra_filters.push(filter);
        self
    }

    /// The timeout as a duration.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Conjunction of the extra filters (`true` when there are none).
    #[must_use]
    pub fn guard(&self) -> Condition {
        self.extra_filters
            .iter()
            .cloned()
            .fold(Condition::always(), Condition::conjoin)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.timeout_ms == 0 {
            return Err(ValidationError::InvalidOptions {
                reason: "timeout_ms must be greater than zero".to_string(),
            });
        }
        if self.max_passes == 0 {
            return Err(ValidationError::InvalidOptions {
                reason: "max_passes must be greater than zero".to_string(),
            });
        }
        self.extra_filters.iter().try_for_each(Condition::validate)
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Threads used to run the fetches of one pass. 1 runs them sequentially.
    pub fetch_workers: usize,
    /// Options used by calls that do not pass their own.
    pub default_options: EvalOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fetch_workers: 4,
            default_options: EvalOptions::default(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn with_fetch_workers(mut self, fetch_workers: usize) -> Self {
        self.fetch_workers = fetch_workers;
        self
    }

    #[must_use]
    pub fn with_default_options(mut self, options: EvalOptions) -> Self {
        self.default_options = options;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.fetch_workers == 0 {
            return Err(ValidationError::InvalidOptions {
                reason: "fetch_workers must be at least 1".to_string(),
            });
        }
        self.default_options.validate()
    }
}

/// Counters for one context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassStats {
    /// Fetch rounds run.
    pub passes: usize,
    /// Fetch specifications executed.
    pub fetches: usize,
    /// Records absorbed into the cache, preloaded ones included.
    pub records: usize,
}

#[derive(Debug, Clone)]
struct CachedRecord {
    fields: BTreeMap<String, Value>,
    // Complete records came from the store and hold every field; primed ones may not.
    complete: bool,
}

/// What has been loaded so far.
#[derive(Debug, Clone, Default)]
pub struct Cache {
    records: HashMap<SubjectRef, CachedRecord>,
    related: HashMap<(SubjectRef, String), Reached>,
    missing: HashSet<SubjectRef>,
    queries: HashMap<(Queryable, Condition), Vec<SubjectRef>>,
}

impl Cache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of subjects with a cached record.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.missing.is_empty() && self.queries.is_empty()
    }

    /// Returns true if the store reported the subject as absent.
    #[must_use]
    pub fn is_missing(&self, subject: &SubjectRef) -> bool {
        self.missing.contains(subject)
    }

    /// Stores a record and everything preloaded on it. Returns the number of
    /// records absorbed.
    fn absorb(&mut self, record: Record, complete: bool) -> usize {
        let Record {
            subject,
            fields,
            related,
        } = record;
        let mut absorbed = 1;

        self.missing.remove(&subject);
        let entry = self.records.entry(subject.clone()).or_insert_with(|| CachedRecord {
            fields: BTreeMap::new(),
            complete: false,
        });
        entry.fields.extend(fields);
        entry.complete |= complete;

        for (name, rel) in related {
            let reached = match &rel {
                Related::One(r) => Reached::One(r.as_ref().map(|r| r.subject.clone())),
                Related::Many(rs) => Reached::Many(rs.iter().map(|r| r.subject.clone()).collect()),
            };
            self.related.insert((subject.clone(), name), reached);
            match rel {
                Related::One(Some(r)) => absorbed += self.absorb(*r, complete),
                Related::One(None) => {}
                Related::Many(rs) => {
                    for r in rs {
                        absorbed += self.absorb(r, complete);
                    }
                }
            }
        }
        absorbed
    }

    fn mark_missing(&mut self, subject: SubjectRef) {
        if !self.records.contains_key(&subject) {
            self.missing.insert(subject);
        }
    }

    fn record_query(&mut self, queryable: Queryable, filter: Condition, subjects: Vec<SubjectRef>) {
        self.queries.insert((queryable, filter), subjects);
    }
}

impl FactSource for Cache {
    fn field_of(&self, subject: &SubjectRef, field: &str) -> Outcome<Value> {
        match self.records.get(subject) {
            Some(cached) => match cached.fields.get(field) {
                Some(v) => Outcome::ok(v.clone()),
                None if cached.complete => Outcome::ok(Value::Null),
                None => Outcome::not_loaded(DataNeed::subject(subject.clone())),
            },
            None if self.missing.contains(subject) => Outcome::ok(Value::Null),
            None => Outcome::not_loaded(DataNeed::subject(subject.clone())),
        }
    }

    fn hop(&self, subject: &SubjectRef, association: &str, chain: &[String]) -> Outcome<Reached> {
        if let Some(reached) = self.related.get(&(subject.clone(), association.to_string())) {
            return Outcome::ok(reached.clone());
        }
        if self.missing.contains(subject) {
            return Outcome::ok(Reached::One(None));
        }
        match FieldPath::new(chain.iter().cloned()) {
            Ok(path) => Outcome::not_loaded(DataNeed::path(subject.clone(), path)),
            Err(e) => Outcome::error(EvalError::generic(e.to_string())),
        }
    }

    fn query_subjects(&self, queryable: &Queryable, filter: &Condition, preload: &[FieldPath]) -> Outcome<Vec<SubjectRef>> {
        match self.queries.get(&(queryable.clone(), filter.clone())) {
            Some(found) => Outcome::ok(found.clone()),
            None => Outcome::not_loaded(DataNeed::query(queryable.clone(), filter.clone(), preload.to_vec())),
        }
    }

    fn call_rule(&self, rule: &str, _subject: &SubjectRef, _args: &Binds) -> Outcome<Value> {
        Outcome::error(EvalError::rules_not_found(rule))
    }
}

/// The state one resolution loop owns: options, cache, budget and counters.
///
/// Can be kept after a call and passed to the next one as a warm cache. Not
/// synchronized; callers sharing one across threads must serialize access.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    options: EvalOptions,
    cache: Cache,
    passes: usize,
    started: Instant,
    fetched: HashSet<Fingerprint>,
    stats: PassStats,
}

impl EvaluationContext {
    /// Creates an empty context.
    pub fn new(options: EvalOptions) -> Result<Self, ValidationError> {
        options.validate()?;
        Ok(Self {
            options,
            cache: Cache::new(),
            passes: 0,
            started: Instant::now(),
            fetched: HashSet::new(),
            stats: PassStats::default(),
        })
    }

    #[must_use]
    pub const fn options(&self) -> &EvalOptions {
        &self.options
    }

    /// Replaces the options, keeping the cache.
    pub fn set_options(&mut self, options: EvalOptions) -> Result<(), ValidationError> {
        options.validate()?;
        self.options = options;
        Ok(())
    }

    #[must_use]
    pub const fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Seeds the cache with data the caller already has.
    ///
    /// Primed records are partial: fields they lack are still fetched on demand.
    /// Associations present on the record are taken as loaded.
    pub fn prime(&mut self, record: Record) {
        self.cache.absorb(record, false);
    }

    /// Fetch rounds run since the last budget reset.
    #[must_use]
    pub const fn passes(&self) -> usize {
        self.passes
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    #[must_use]
    pub const fn stats(&self) -> PassStats {
        self.stats
    }

    /// Restarts the pass counter and the clock. The cache is kept.
    pub fn reset_budget(&mut self) {
        self.passes = 0;
        self.started = Instant::now();
    }

    /// Why another fetch round is not allowed, if it is not.
    #[must_use]
    pub fn budget_exhausted(&self) -> Option<AbortReason> {
        if self.passes >= self.options.max_passes {
            Some(AbortReason::MaxPasses)
        } else if self.elapsed() > self.options.timeout() {
            Some(AbortReason::Deadline)
        } else {
            None
        }
    }

    /// A read view for units.
    #[must_use]
    pub fn view<'a>(&'a self, rules: &'a RuleRegistry, args: &'a Binds) -> EvalContext<'a> {
        EvalContext {
            cache: &self.cache,
            rules,
            args,
            depth: 0,
        }
    }

    pub(crate) fn was_fetched(&self, fingerprint: &Fingerprint) -> bool {
        self.fetched.contains(fingerprint)
    }

    pub(crate) fn begin_pass(&mut self) -> usize {
        self.passes += 1;
        self.stats.passes += 1;
        self.passes
    }

    /// Merges the records returned for one batch into the cache.
    ///
    /// Keys that were asked for and not returned are remembered as missing.
    /// Query results are recorded per need; when several queries were merged
    /// into one fetch, each need's filter is re-checked on the fetched data.
    pub(crate) fn absorb(&mut self, batch: &Batch, records: Vec<Record>) -> Result<(), EvalError> {
        self.fetched.insert(batch.spec.fingerprint());
        self.stats.fetches += 1;

        let returned: Vec<SubjectRef> = records.iter().map(|r| r.subject.clone()).collect();
        for record in records {
            self.stats.records += self.cache.absorb(record, true);
        }

        if let Some(keys) = batch.spec.keys() {
            for key in keys {
                if !returned.iter().any(|s| &s.key == key) {
                    self.cache
                        .mark_missing(SubjectRef::new(batch.spec.queryable.clone(), key.clone()));
                }
            }
        }

        let single = batch.needs.len() == 1;
        for need in &batch.needs {
            let DataNeed::Query { queryable, filter, .. } = need else {
                continue;
            };
            let matched = if single {
                returned.clone()
            } else {
                let env = Binds::new();
                match outcome::filter(&returned, |s| filter.evaluate(s, &self.cache, &env)) {
                    Outcome::Ok { value, .. } => value,
                    Outcome::NotLoaded(needs) => {
                        return Err(EvalError::generic(format!(
                            "store result for merged query on {queryable} is missing {} item(s) needed to split it",
                            needs.len()
                        )));
                    }
                    Outcome::Error(e) => return Err(e),
                }
            };
            self.cache.record_query(queryable.clone(), filter.clone(), matched);
        }
        Ok(())
    }
}

/// Read-only view over the cache, handed to evaluation units.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    cache: &'a Cache,
    rules: &'a RuleRegistry,
    args: &'a Binds,
    depth: usize,
}

impl std::fmt::Debug for EvalContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvalContext")
            .field("cached", &self.cache.len())
            .field("args", self.args)
            .field("depth", &self.depth)
            .finish()
    }
}

impl<'a> EvalContext<'a> {
    /// The subject's cached record (fields only), or `None` if the store has no
    /// such subject.
    pub fn record(&self, subject: &SubjectRef) -> Outcome<Option<Record>> {
        if self.cache.is_missing(subject) {
            return Outcome::ok(None);
        }
        match self.cache.records.get(subject) {
            Some(cached) if cached.complete => {
                let mut record = Record::new(subject.clone());
                record.fields = cached.fields.clone();
                Outcome::ok(Some(record))
            }
            _ => Outcome::not_loaded(DataNeed::subject(subject.clone())),
        }
    }

    /// Value at `path`, following associations.
    pub fn field(&self, subject: &SubjectRef, path: impl Into<FieldPath>) -> Outcome<Value> {
        facts::read_path(self, subject, &path.into())
    }

    /// Target of a to-one association chain.
    pub fn related_one(&self, subject: &SubjectRef, path: impl Into<FieldPath>) -> Outcome<Option<SubjectRef>> {
        let path = path.into();
        facts::follow(self, subject, path.segments()).then(|reached| match reached {
            Reached::One(target) => Outcome::ok(target),
            Reached::Many(_) => Outcome::error(EvalError::generic(format!(
                "'{path}' is a to-many association"
            ))),
        })
    }

    /// Targets of an association chain.
    pub fn related_many(&self, subject: &SubjectRef, path: impl Into<FieldPath>) -> Outcome<Vec<SubjectRef>> {
        facts::related(self, subject, &path.into())
    }

    pub fn count_related(&self, subject: &SubjectRef, path: impl Into<FieldPath>) -> Outcome<usize> {
        self.related_many(subject, path).map(|v| v.len())
    }

    /// Subjects matching a scope, in store order.
    pub fn query(&self, scope: &Scope) -> Outcome<Vec<SubjectRef>> {
        scope.lookup(self, self.args)
    }

    /// A caller-supplied argument.
    pub fn arg(&self, name: &str) -> Outcome<Value> {
        match self.args.get(name) {
            Some(v) => Outcome::ok(v.clone()),
            None => Outcome::error(EvalError::Unbound { name: name.to_string() }),
        }
    }

    #[must_use]
    pub const fn args(&self) -> &Binds {
        self.args
    }

    /// Evaluates a registered rule for `subject`.
    pub fn rule(&self, id: &str, subject: &SubjectRef, args: &Binds) -> Outcome<Value> {
        if self.depth >= MAX_RULE_DEPTH {
            return Outcome::error(EvalError::generic(format!(
                "rule '{id}' exceeded the nesting limit of {MAX_RULE_DEPTH}"
            )));
        }
        let Some(unit) = self.rules.get(id) else {
            return Outcome::error(EvalError::rules_not_found(id));
        };
        let nested = EvalContext {
            cache: self.cache,
            rules: self.rules,
            args,
            depth: self.depth + 1,
        };
        unit.evaluate(subject, args, &nested)
    }
}

impl FactSource for EvalContext<'_> {
    fn field_of(&self, subject: &SubjectRef, field: &str) -> Outcome<Value> {
        self.cache.field_of(subject, field)
    }

    fn hop(&self, subject: &SubjectRef, association: &str, chain: &[String]) -> Outcome<Reached> {
        self.cache.hop(subject, association, chain)
    }

    fn query_subjects(&self, queryable: &Queryable, filter: &Condition, preload: &[FieldPath]) -> Outcome<Vec<SubjectRef>> {
        self.cache.query_subjects(queryable, filter, preload)
    }

    fn call_rule(&self, rule: &str, subject: &SubjectRef, args: &Binds) -> Outcome<Value> {
        self.rule(rule, subject, args)
    }

    fn arg(&self, name: &str) -> Option<Value> {
        self.args.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchState;
    use crate::value::Key;

    fn person(key: i64) -> SubjectRef {
        SubjectRef::new("Person", key)
    }

    fn ctx() -> EvaluationContext {
        EvaluationContext::new(EvalOptions::default()).unwrap()
    }

    #[test]
    fn test_options_defaults_and_validation() {
        let opts = EvalOptions::default();
        assert_eq!(opts.timeout_ms, 5_000);
        assert_eq!(opts.max_passes, 16);
        assert!(opts.strict);
        assert_eq!(opts.timeout(), Duration::from_secs(5));

        assert!(EvalOptions::default().with_max_passes(0).validate().is_err());
        assert!(EvalOptions::default().with_timeout_ms(0).validate().is_err());
        assert!(EngineConfig::default().with_fetch_workers(0).validate().is_err());
        assert!(EvaluationContext::new(EvalOptions::default().with_max_passes(0)).is_err());
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let opts: EvalOptions = serde_json::from_str(r#"{"max_passes": 3}"#).unwrap();
        assert_eq!(opts.max_passes, 3);
        assert_eq!(opts.timeout_ms, 5_000);
    }

    #[test]
    fn test_guard_conjoins_extra_filters() {
        let opts = EvalOptions::default()
            .with_extra_filter(Condition::eq("active", true))
            .with_extra_filter(Condition::ge("age", 18));
        assert_eq!(
            opts.guard(),
            Condition::and(vec![Condition::eq("active", true), Condition::ge("age", 18)])
        );
        assert_eq!(EvalOptions::default().guard(), Condition::always());
    }

    #[test]
    fn test_unloaded_subject_reports_need() {
        let ctx = ctx();
        let rules = RuleRegistry::new();
        let args = Binds::new();
        let view = ctx.view(&rules, &args);
        let out = view.field(&person(1), "age");
        assert_eq!(out.needs().map(|n| n.len()), Some(1));
        assert!(out.needs().unwrap().contains(&DataNeed::subject(person(1))));
    }

    #[test]
    fn test_primed_record_is_partial() {
        let mut ctx = ctx();
        ctx.prime(Record::new(person(1)).with_field("age", 15));
        let rules = RuleRegistry::new();
        let args = Binds::new();
        let view = ctx.view(&rules, &args);
        assert_eq!(view.field(&person(1), "age").into_value(), Some(Value::Int(15)));
        assert!(view.field(&person(1), "has_parental_consent").is_not_loaded());
        assert!(view.record(&person(1)).is_not_loaded());
    }

    #[test]
    fn test_absorb_marks_missing_keys() {
        let mut ctx = ctx();
        let batch = BatchState::new()
            .add_need(DataNeed::subject(person(1)))
            .add_need(DataNeed::subject(person(2)))
            .batches()
            .remove(0);
        let records = vec![Record::new(person(1)).with_field("name", "Ada")];
        ctx.absorb(&batch, records).unwrap();

        let rules = RuleRegistry::new();
        let args = Binds::new();
        let view = ctx.view(&rules, &args);
        assert_eq!(view.field(&person(1), "name").into_value(), Some(Value::from("Ada")));
        // Complete records read absent fields as nil.
        assert_eq!(view.field(&person(1), "nickname").into_value(), Some(Value::Null));
        assert_eq!(view.field(&person(2), "name").into_value(), Some(Value::Null));
        assert_eq!(view.record(&person(2)).into_value(), Some(None));
        assert!(ctx.was_fetched(&batch.spec.fingerprint()));
        assert_eq!(ctx.stats().fetches, 1);
    }

    #[test]
    fn test_absorb_preloaded_chain() {
        let mut ctx = ctx();
        let dept = Record::new(SubjectRef::new("Department", 9)).with_field("name", "R&D");
        let boss = Record::new(person(1)).with_one("department", Some(dept));
        let batch = BatchState::new()
            .add_need(DataNeed::path(person(2), FieldPath::from("manager.department")))
            .batches()
            .remove(0);
        ctx.absorb(&batch, vec![Record::new(person(2)).with_one("manager", Some(boss))])
            .unwrap();
        assert_eq!(ctx.stats().records, 3);

        let rules = RuleRegistry::new();
        let args = Binds::new();
        let view = ctx.view(&rules, &args);
        assert_eq!(
            view.field(&person(2), "manager.department.name").into_value(),
            Some(Value::from("R&D"))
        );
        assert_eq!(view.related_one(&person(2), "manager").into_value(), Some(Some(person(1))));
        // Not preloaded on the manager.
        assert!(view.related_one(&person(1), "manager").is_not_loaded());
    }

    #[test]
    fn test_merged_queries_are_split_locally() {
        let mut ctx = ctx();
        let q = Queryable::from("Person");
        let young = Condition::lt("age", 30);
        let old = Condition::ge("age", 30);
        let batch = BatchState::new()
            .add_need(DataNeed::query(q.clone(), young.clone(), Vec::new()))
            .add_need(DataNeed::query(q.clone(), old.clone(), Vec::new()))
            .batches()
            .remove(0);
        let records = vec![
            Record::new(person(1)).with_field("age", 20),
            Record::new(person(2)).with_field("age", 40),
        ];
        ctx.absorb(&batch, records).unwrap();

        let rules = RuleRegistry::new();
        let args = Binds::new();
        let view = ctx.view(&rules, &args);
        assert_eq!(view.query(&Scope::new("Person").with_condition(young)).into_value(), Some(vec![person(1)]));
        assert_eq!(view.query(&Scope::new("Person").with_condition(old)).into_value(), Some(vec![person(2)]));
    }

    #[test]
    fn test_budget_exhaustion() {
        let mut ctx = EvaluationContext::new(EvalOptions::default().with_max_passes(1)).unwrap();
        assert_eq!(ctx.budget_exhausted(), None);
        ctx.begin_pass();
        assert_eq!(ctx.budget_exhausted(), Some(AbortReason::MaxPasses));
        ctx.reset_budget();
        assert_eq!(ctx.budget_exhausted(), None);
        assert_eq!(ctx.stats().passes, 1);
    }

    #[test]
    fn test_unknown_rule_and_arg() {
        let ctx = ctx();
        let rules = RuleRegistry::new();
        let mut args = Binds::new();
        args.insert("limit".to_string(), Value::Int(3));
        let view = ctx.view(&rules, &args);
        assert_eq!(view.arg("limit").into_value(), Some(Value::Int(3)));
        assert!(view.arg("other").is_error());
        let out = view.rule("ghost", &person(1), &Binds::new());
        assert_eq!(out.err(), Some(&EvalError::rules_not_found("ghost")));
    }

    #[test]
    fn test_key_lookup_spec_keys() {
        let batch = BatchState::new().add_need(DataNeed::subject(person(5))).batches().remove(0);
        assert_eq!(batch.spec.keys(), Some(&[Key::Int(5)][..]));
    }
}
