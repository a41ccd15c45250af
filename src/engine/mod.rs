//! Caller API.
//!
//! [`Engine`] ties a store, a rule registry and configuration together and
//! exposes strict and tolerant entry points. Strict calls raise absent results
//! and exhausted budgets as errors; tolerant calls return a [`Tolerant`]
//! sentinel instead. Every call builds a fresh [`EvaluationContext`] unless the
//! `*_warm` variant is used to carry a cache from one call to the next.

use std::fmt;
use std::sync::Arc;

use crate::condition::Condition;
use crate::context::{EngineConfig, EvalContext, EvalOptions, EvaluationContext};
use crate::error::{AbortReason, EvalError, RuleResult};
use crate::need::NeedSet;
use crate::outcome::{self, Binds, Outcome};
use crate::record::SubjectRef;
use crate::resolver::{Resolution, Resolver};
use crate::rules::RuleRegistry;
use crate::scope::Scope;
use crate::storage::Store;
use crate::value::Value;

/// Result of a tolerant call.
#[derive(Debug, Clone, PartialEq)]
pub enum Tolerant<T> {
    /// Resolved to a value.
    Value(T),
    /// Resolved, but there is nothing there.
    NotFound,
    /// The budget ran out first.
    Unresolved {
        /// Which budget ran out.
        reason: AbortReason,
        /// Needs of the last pass.
        pending: NeedSet,
    },
}

impl<T> Tolerant<T> {
    #[must_use]
    pub fn value(self) -> Option<T> {
        match self {
            Self::Value(v) => Some(v),
            Self::NotFound | Self::Unresolved { .. } => None,
        }
    }

    #[must_use]
    pub const fn is_unresolved(&self) -> bool {
        matches!(self, Self::Unresolved { .. })
    }
}

/// Rule evaluation engine.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn Store>,
    rules: Arc<RuleRegistry>,
    config: EngineConfig,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("rules", &self.rules)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn elapsed_ms(ctx: &EvaluationContext) -> u64 {
    u64::try_from(ctx.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Turns an aborted resolution into a timeout error.
fn finish<T>(ctx: &EvaluationContext, resolution: Resolution<T>) -> RuleResult<T> {
    match resolution {
        Resolution::Done(v) => Ok(v),
        Resolution::Aborted { reason, .. } => Err(EvalError::Timeout {
            reason,
            passes: ctx.passes(),
            elapsed_ms: elapsed_ms(ctx),
        }
        .into()),
    }
}

/// Evaluates `rule` for `subject` if it passes `guard`, else reads as nil.
fn guarded(view: &EvalContext<'_>, guard: &Condition, rule: &str, subject: &SubjectRef, args: &Binds) -> Outcome<Value> {
    guard.evaluate(subject, view, args).then(|pass| {
        if pass {
            view.rule(rule, subject, args)
        } else {
            Outcome::ok(Value::Null)
        }
    })
}

impl Engine {
    /// Creates an engine. Fails if the configuration is invalid.
    pub fn new(store: Arc<dyn Store>, rules: RuleRegistry, config: EngineConfig) -> RuleResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            rules: Arc::new(rules),
            config,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn rules(&self) -> &RuleRegistry {
        &self.rules
    }

    /// A fresh context with the engine's default options.
    pub fn context(&self) -> RuleResult<EvaluationContext> {
        Ok(EvaluationContext::new(self.config.default_options.clone())?)
    }

    fn resolver(&self) -> Resolver<'_> {
        Resolver::new(self.store.as_ref(), &self.rules, self.config.fetch_workers)
    }

    fn run_rule(
        &self,
        ctx: &mut EvaluationContext,
        rule: &str,
        subject: &SubjectRef,
        args: &Binds,
    ) -> RuleResult<Resolution<Value>> {
        if !self.rules.contains(rule) {
            return Err(EvalError::rules_not_found(rule).into());
        }
        let guard = ctx.options().guard();
        Ok(self
            .resolver()
            .resolve(ctx, args, |view| guarded(view, &guard, rule, subject, args))?)
    }

    /// Evaluates a rule, raising absent results (strict mode) and timeouts.
    pub fn evaluate(&self, rule: &str, subject: &SubjectRef, args: &Binds) -> RuleResult<Value> {
        let mut ctx = self.context()?;
        self.evaluate_warm(&mut ctx, rule, subject, args)
    }

    /// [`evaluate`](Self::evaluate) over a caller-owned context.
    #[tracing::instrument(level = "debug", skip_all, fields(rule = rule, subject = %subject))]
    pub fn evaluate_warm(
        &self,
        ctx: &mut EvaluationContext,
        rule: &str,
        subject: &SubjectRef,
        args: &Binds,
    ) -> RuleResult<Value> {
        let resolution = self.run_rule(ctx, rule, subject, args)?;
        let value = finish(ctx, resolution)?;
        if ctx.options().strict && value.is_null() {
            return Err(EvalError::not_found(format!("{rule} for {subject}")).into());
        }
        Ok(value)
    }

    /// Evaluates a rule, returning a sentinel instead of raising absent or
    /// unresolved results. Rule errors are still errors.
    pub fn evaluate_tolerant(&self, rule: &str, subject: &SubjectRef, args: &Binds) -> RuleResult<Tolerant<Value>> {
        let mut ctx = self.context()?;
        self.evaluate_tolerant_warm(&mut ctx, rule, subject, args)
    }

    /// [`evaluate_tolerant`](Self::evaluate_tolerant) over a caller-owned context.
    #[tracing::instrument(level = "debug", skip_all, fields(rule = rule, subject = %subject))]
    pub fn evaluate_tolerant_warm(
        &self,
        ctx: &mut EvaluationContext,
        rule: &str,
        subject: &SubjectRef,
        args: &Binds,
    ) -> RuleResult<Tolerant<Value>> {
        Ok(match self.run_rule(ctx, rule, subject, args)? {
            Resolution::Done(Value::Null) => Tolerant::NotFound,
            Resolution::Done(v) => Tolerant::Value(v),
            Resolution::Aborted { reason, pending } => Tolerant::Unresolved { reason, pending },
        })
    }

    /// Evaluates with explicit options and returns the raw resolution.
    pub fn evaluate_with(
        &self,
        rule: &str,
        subject: &SubjectRef,
        args: &Binds,
        options: EvalOptions,
    ) -> RuleResult<Resolution<Value>> {
        let mut ctx = EvaluationContext::new(options)?;
        self.run_rule(&mut ctx, rule, subject, args)
    }

    /// Evaluates one rule for many subjects in a single loop, so needs of all
    /// subjects are batched together. Absent results read as `Null`.
    pub fn evaluate_all(&self, rule: &str, subjects: &[SubjectRef], args: &Binds) -> RuleResult<Vec<Value>> {
        let mut ctx = self.context()?;
        self.evaluate_all_warm(&mut ctx, rule, subjects, args)
    }

    /// [`evaluate_all`](Self::evaluate_all) over a caller-owned context.
    #[tracing::instrument(level = "debug", skip_all, fields(rule = rule, subjects = subjects.len()))]
    pub fn evaluate_all_warm(
        &self,
        ctx: &mut EvaluationContext,
        rule: &str,
        subjects: &[SubjectRef],
        args: &Binds,
    ) -> RuleResult<Vec<Value>> {
        if !self.rules.contains(rule) {
            return Err(EvalError::rules_not_found(rule).into());
        }
        let guard = ctx.options().guard();
        let resolution = self.resolver().resolve(ctx, args, |view| {
            outcome::map_all(subjects, |s| guarded(view, &guard, rule, s, args))
        })?;
        finish(ctx, resolution)
    }

    /// Evaluates `rule` for many subjects in one loop and pairs each subject
    /// with its value. In strict mode an absent value is a not-found error.
    pub fn load(&self, rule: &str, subjects: &[SubjectRef], args: &Binds) -> RuleResult<Vec<(SubjectRef, Value)>> {
        let mut ctx = self.context()?;
        self.load_warm(&mut ctx, rule, subjects, args)
    }

    /// [`load`](Self::load) over a caller-owned context.
    pub fn load_warm(
        &self,
        ctx: &mut EvaluationContext,
        rule: &str,
        subjects: &[SubjectRef],
        args: &Binds,
    ) -> RuleResult<Vec<(SubjectRef, Value)>> {
        let values = self.evaluate_all_warm(ctx, rule, subjects, args)?;
        let strict = ctx.options().strict;
        subjects
            .iter()
            .cloned()
            .zip(values)
            .map(|(subject, value)| {
                if strict && value.is_null() {
                    Err(EvalError::not_found(format!("{rule} for {subject}")).into())
                } else {
                    Ok((subject, value))
                }
            })
            .collect()
    }

    /// The subjects, in the given order, that satisfy `condition` and the
    /// extra filters. Needs of all subjects are batched together.
    pub fn filter(&self, condition: &Condition, subjects: &[SubjectRef], args: &Binds) -> RuleResult<Vec<SubjectRef>> {
        let mut ctx = self.context()?;
        self.filter_warm(&mut ctx, condition, subjects, args)
    }

    /// [`filter`](Self::filter) over a caller-owned context.
    pub fn filter_warm(
        &self,
        ctx: &mut EvaluationContext,
        condition: &Condition,
        subjects: &[SubjectRef],
        args: &Binds,
    ) -> RuleResult<Vec<SubjectRef>> {
        condition.validate()?;
        self.select(ctx, condition.clone(), subjects, args)
    }

    /// The subjects that pass the extra filters but not `condition`.
    pub fn reject(&self, condition: &Condition, subjects: &[SubjectRef], args: &Binds) -> RuleResult<Vec<SubjectRef>> {
        let mut ctx = self.context()?;
        self.reject_warm(&mut ctx, condition, subjects, args)
    }

    /// [`reject`](Self::reject) over a caller-owned context.
    pub fn reject_warm(
        &self,
        ctx: &mut EvaluationContext,
        condition: &Condition,
        subjects: &[SubjectRef],
        args: &Binds,
    ) -> RuleResult<Vec<SubjectRef>> {
        condition.validate()?;
        self.select(ctx, Condition::not(condition.clone()), subjects, args)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(subjects = subjects.len()))]
    fn select(
        &self,
        ctx: &mut EvaluationContext,
        condition: Condition,
        subjects: &[SubjectRef],
        args: &Binds,
    ) -> RuleResult<Vec<SubjectRef>> {
        let test = ctx.options().guard().conjoin(condition);
        let resolution = self.resolver().resolve(ctx, args, |view| {
            outcome::filter(subjects, |s| test.evaluate(s, view, args))
        })?;
        finish(ctx, resolution)
    }

    /// Every subject matching `scope` (narrowed by the extra filters), in store order.
    pub fn query_all(&self, scope: &Scope) -> RuleResult<Vec<SubjectRef>> {
        let mut ctx = self.context()?;
        self.query_all_warm(&mut ctx, scope)
    }

    /// [`query_all`](Self::query_all) over a caller-owned context.
    #[tracing::instrument(level = "debug", skip_all, fields(queryable = %scope.queryable()))]
    pub fn query_all_warm(&self, ctx: &mut EvaluationContext, scope: &Scope) -> RuleResult<Vec<SubjectRef>> {
        scope.validate()?;
        let scope = scope.add_conditions(ctx.options().extra_filters.clone());
        let args = Binds::new();
        let resolution = self.resolver().resolve(ctx, &args, |view| view.query(&scope))?;
        finish(ctx, resolution)
    }

    /// The single subject matching `scope`.
    ///
    /// More than one match is an error. No match is `None`, or a not-found
    /// error in strict mode.
    pub fn query_one(&self, scope: &Scope) -> RuleResult<Option<SubjectRef>> {
        let mut ctx = self.context()?;
        self.query_one_warm(&mut ctx, scope)
    }

    /// [`query_one`](Self::query_one) over a caller-owned context.
    pub fn query_one_warm(&self, ctx: &mut EvaluationContext, scope: &Scope) -> RuleResult<Option<SubjectRef>> {
        let mut found = self.query_all_warm(ctx, scope)?;
        match found.len() {
            0 if ctx.options().strict => {
                Err(EvalError::not_found(format!("no {} matches the query", scope.queryable())).into())
            }
            0 => Ok(None),
            1 => Ok(found.pop()),
            n => Err(EvalError::generic(format!(
                "expected at most one {} but {n} matched",
                scope.queryable()
            ))
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::record::Record;
    use crate::rules::ConditionRule;
    use crate::storage::InMemoryStore;

    fn person(key: i64) -> SubjectRef {
        SubjectRef::new("Person", key)
    }

    fn engine(config: EngineConfig) -> (Engine, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        store.belongs_to("Person", "manager", "Person", "manager_id").unwrap();
        store
            .insert(Record::new(person(1)).with_field("name", "Ada").with_field("age", 50))
            .unwrap();
        store
            .insert(Record::new(person(2)).with_field("age", 15).with_field("manager_id", 1))
            .unwrap();

        let mut rules = RuleRegistry::new();
        rules.register("adult", ConditionRule(Condition::ge("age", 18))).unwrap();
        rules
            .register_fn("manager_name", |s, _, ctx| ctx.field(s, "manager.name"))
            .unwrap();
        let engine = Engine::new(store.clone(), rules, config).unwrap();
        (engine, store)
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let err = Engine::new(store, RuleRegistry::new(), EngineConfig::default().with_fetch_workers(0)).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_strict_and_tolerant_absent() {
        let (engine, _) = engine(EngineConfig::default());
        let args = Binds::new();
        assert_eq!(engine.evaluate("manager_name", &person(2), &args).unwrap(), Value::from("Ada"));

        let err = engine.evaluate("manager_name", &person(1), &args).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Generic));
        assert_eq!(
            engine.evaluate_tolerant("manager_name", &person(1), &args).unwrap(),
            Tolerant::NotFound
        );
    }

    #[test]
    fn test_unknown_rule() {
        let (engine, store) = engine(EngineConfig::default());
        let err = engine.evaluate("ghost", &person(1), &Binds::new()).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::RulesNotFound));
        assert_eq!(store.fetch_count().unwrap(), 0);
    }

    #[test]
    fn test_extra_filters_guard_subjects() {
        let options = EvalOptions::default().with_strict(false).with_extra_filter(Condition::ge("age", 18));
        let (engine, _) = engine(EngineConfig::default().with_default_options(options));
        let args = Binds::new();
        assert_eq!(engine.evaluate("adult", &person(1), &args).unwrap(), Value::Bool(true));
        assert_eq!(engine.evaluate("adult", &person(2), &args).unwrap(), Value::Null);
    }

    #[test]
    fn test_query_one_and_all() {
        let (engine, _) = engine(EngineConfig::default());
        let adults = Scope::new("Person").with_condition(Condition::ge("age", 18));
        assert_eq!(engine.query_one(&adults).unwrap(), Some(person(1)));
        assert_eq!(engine.query_all(&Scope::new("Person")).unwrap(), vec![person(1), person(2)]);
        assert!(engine.query_one(&Scope::new("Person")).is_err());

        let nobody = Scope::new("Person").with_condition(Condition::gt("age", 100));
        assert!(engine.query_one(&nobody).unwrap_err().is_evaluation());
    }

    #[test]
    fn test_warm_context_reuses_cache() {
        let (engine, store) = engine(EngineConfig::default().with_fetch_workers(1));
        let mut ctx = engine.context().unwrap();
        let args = Binds::new();
        engine.evaluate_warm(&mut ctx, "manager_name", &person(2), &args).unwrap();
        let after_first = store.fetch_count().unwrap();
        engine.evaluate_warm(&mut ctx, "manager_name", &person(2), &args).unwrap();
        assert_eq!(store.fetch_count().unwrap(), after_first);
    }
}
