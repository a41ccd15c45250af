//! Evaluation units and the rule registry.
//!
//! An evaluation unit is rule logic written against [`Outcome`] and the
//! read-only [`EvalContext`]. It must be re-entrant: run again over a cache that
//! holds more data, it reaches the same value or gets further. Units never
//! perform I/O; they report what they are missing and the resolution loop
//! fetches it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::context::EvalContext;
use crate::error::ValidationError;
use crate::need::{FieldPath, NeedSet};
use crate::outcome::{Binds, Outcome};
use crate::record::SubjectRef;
use crate::value::Value;

/// Rule logic evaluated by the resolution loop.
pub trait EvaluationUnit: Send + Sync {
    fn evaluate(&self, subject: &SubjectRef, args: &Binds, ctx: &EvalContext<'_>) -> Outcome<Value>;
}

impl<F> EvaluationUnit for F
where
    F: Fn(&SubjectRef, &Binds, &EvalContext<'_>) -> Outcome<Value> + Send + Sync,
{
    fn evaluate(&self, subject: &SubjectRef, args: &Binds, ctx: &EvalContext<'_>) -> Outcome<Value> {
        self(subject, args, ctx)
    }
}

/// Named evaluation units.
#[derive(Clone, Default)]
pub struct RuleRegistry {
    units: HashMap<String, Arc<dyn EvaluationUnit>>,
}

impl fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&String> = self.units.keys().collect();
        ids.sort();
        f.debug_struct("RuleRegistry").field("rules", &ids).finish()
    }
}

impl RuleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a unit under `id`. Identifiers are unique.
    pub fn register<U>(&mut self, id: impl Into<String>, unit: U) -> Result<(), ValidationError>
    where
        U: EvaluationUnit + 'static,
    {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ValidationError::EmptyRuleId);
        }
        if self.units.contains_key(&id) {
            return Err(ValidationError::DuplicateRule { rule: id });
        }
        self.units.insert(id, Arc::new(unit));
        Ok(())
    }

    /// Registers a closure. Same as [`register`](Self::register), but gives the
    /// compiler the closure signature.
    pub fn register_fn<F>(&mut self, id: impl Into<String>, f: F) -> Result<(), ValidationError>
    where
        F: Fn(&SubjectRef, &Binds, &EvalContext<'_>) -> Outcome<Value> + Send + Sync + 'static,
    {
        self.register(id, f)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn EvaluationUnit>> {
        self.units.get(id).cloned()
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.units.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Right-hand side of a clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Expr {
    Value(Value),
    /// Caller argument or a name bound by the clause's condition.
    Bound(String),
    /// Path read on the subject.
    Field(FieldPath),
}

impl Expr {
    fn eval(&self, subject: &SubjectRef, env: &Binds, ctx: &EvalContext<'_>) -> Outcome<Value> {
        match self {
            Self::Value(v) => Outcome::ok(v.clone()),
            Self::Bound(name) => match env.get(name) {
                Some(v) => Outcome::ok(v.clone()),
                None => ctx.arg(name),
            },
            Self::Field(path) => ctx.field(subject, path.clone()),
        }
    }
}

impl From<Value> for Expr {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

impl From<bool> for Expr {
    fn from(v: bool) -> Self {
        Self::Value(Value::from(v))
    }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Self {
        Self::Value(Value::from(v))
    }
}

impl From<i64> for Expr {
    fn from(v: i64) -> Self {
        Self::Value(Value::from(v))
    }
}

impl From<&str> for Expr {
    fn from(v: &str) -> Self {
        Self::Value(Value::from(v))
    }
}

/// One `when => then` arm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clause {
    pub when: Condition,
    pub then: Expr,
}

/// An ordered list of clauses with a fallback, like a `cond` expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredicateRules {
    pub clauses: Vec<Clause>,
    pub default: Expr,
}

impl PredicateRules {
    #[must_use]
    pub fn new(default: impl Into<Expr>) -> Self {
        Self {
            clauses: Vec::new(),
            default: default.into(),
        }
    }

    /// Appends a clause.
    #[must_use]
    pub fn when(mut self, condition: Condition, then: impl Into<Expr>) -> Self {
        self.clauses.push(Clause {
            when: condition,
            then: then.into(),
        });
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.clauses.iter().try_for_each(|c| c.when.validate())
    }
}

impl EvaluationUnit for PredicateRules {
    fn evaluate(&self, subject: &SubjectRef, args: &Binds, ctx: &EvalContext<'_>) -> Outcome<Value> {
        let mut pending = NeedSet::new();
        for clause in &self.clauses {
            match clause.when.evaluate(subject, ctx, args) {
                Outcome::Ok { value: true, binds } => {
                    // An earlier undecided clause may still be the real match.
                    if !pending.is_empty() {
                        return Outcome::pending(pending);
                    }
                    let mut env = args.clone();
                    env.extend(binds);
                    return clause.then.eval(subject, &env, ctx);
                }
                Outcome::Ok { value: false, .. } => {}
                Outcome::NotLoaded(needs) => pending.union_with(needs),
                Outcome::Error(e) => return Outcome::Error(e),
            }
        }
        if pending.is_empty() {
            self.default.eval(subject, args, ctx)
        } else {
            Outcome::pending(pending)
        }
    }
}

/// Wraps a condition as a unit returning `Bool`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionRule(pub Condition);

impl EvaluationUnit for ConditionRule {
    fn evaluate(&self, subject: &SubjectRef, args: &Binds, ctx: &EvalContext<'_>) -> Outcome<Value> {
        self.0.evaluate(subject, ctx, args).map(Value::Bool)
    }
}

impl From<Condition> for ConditionRule {
    fn from(c: Condition) -> Self {
        Self(c)
    }
}
