//! Declarative predicate trees.
//!
//! A [`Condition`] describes what a rule tests: field comparisons, association
//! quantifiers, references to other rules and bound values, combined with
//! `and`/`or`/`not`. Conditions are immutable values; evaluating one against a
//! [`FactSource`] either decides it, or reports the data it is missing.
//!
//! `and` stops at the first child that is decided `false` and `or` at the first
//! child decided `true`; needs of the other children are dropped because
//! loading them cannot change the answer.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{OnceLock, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{EvalError, ValidationError};
use crate::facts::{self, FactSource, Read};
use crate::need::{FieldPath, NeedSet};
use crate::outcome::{self, Binds, Outcome};
use crate::record::SubjectRef;
use crate::value::{Key, Value};

const REGEX_CACHE_MAX: usize = 1024;

static REGEX_CACHE: OnceLock<RwLock<HashMap<String, regex::Regex>>> = OnceLock::new();

fn cached_regex(pattern: &str) -> Result<regex::Regex, EvalError> {
    let cache = REGEX_CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    {
        let guard = cache
            .read()
            .map_err(|_| EvalError::generic("regex cache lock poisoned"))?;
        if let Some(re) = guard.get(pattern) {
            return Ok(re.clone());
        }
    }

    let compiled = regex::Regex::new(pattern)
        .map_err(|e| EvalError::generic(format!("invalid regex '{pattern}': {e}")))?;

    let mut guard = cache
        .write()
        .map_err(|_| EvalError::generic("regex cache lock poisoned"))?;

    if guard.len() >= REGEX_CACHE_MAX {
        guard.clear();
    }

    guard
        .entry(pattern.to_string())
        .or_insert_with(|| compiled.clone());
    Ok(compiled)
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Left value is one of the operand list.
    In,
    /// Left list contains the operand, or left string contains the operand string.
    Contains,
    /// Left string matches the operand regex.
    Matches,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::In => "in",
            Self::Contains => "contains",
            Self::Matches => "=~",
        };
        f.write_str(s)
    }
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Operand {
    /// A literal.
    Value(Value),
    /// A named value from the caller's arguments or an earlier `Bind`.
    Bound(String),
    /// Another path on the same subject.
    Field(FieldPath),
}

impl From<Value> for Operand {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

/// A boolean predicate over one subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Const {
        value: bool,
    },
    Compare {
        field: FieldPath,
        op: CompareOp,
        operand: Operand,
    },
    IsNil {
        field: FieldPath,
    },
    /// Subject key is one of `keys`. Needs no data; used for batched loads.
    KeyIn {
        keys: Vec<Key>,
    },
    /// Binds the value at `field` under `name`. Always true once loaded.
    Bind {
        name: String,
        field: FieldPath,
    },
    /// Named rule result equals `equals`.
    Predicate {
        rule: String,
        equals: Value,
    },
    /// Some subject reached through the association `path` satisfies `condition`.
    Any {
        path: FieldPath,
        condition: Box<Condition>,
    },
    /// Every subject reached through the association `path` satisfies `condition`.
    All {
        path: FieldPath,
        condition: Box<Condition>,
    },
    And {
        conditions: Vec<Condition>,
    },
    Or {
        conditions: Vec<Condition>,
    },
    Not {
        condition: Box<Condition>,
    },
}

#[allow(missing_docs)]
impl Condition {
    #[must_use]
    pub const fn always() -> Self {
        Self::Const { value: true }
    }

    #[must_use]
    pub const fn never() -> Self {
        Self::Const { value: false }
    }

    #[must_use]
    pub fn compare(field: impl Into<FieldPath>, op: CompareOp, operand: impl Into<Value>) -> Self {
        Self::Compare {
            field: field.into(),
            op,
            operand: Operand::Value(operand.into()),
        }
    }

    #[must_use]
    pub fn eq(field: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Eq, value)
    }

    #[must_use]
    pub fn ne(field: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Ne, value)
    }

    #[must_use]
    pub fn lt(field: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Lt, value)
    }

    #[must_use]
    pub fn le(field: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Le, value)
    }

    #[must_use]
    pub fn gt(field: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Gt, value)
    }

    #[must_use]
    pub fn ge(field: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Ge, value)
    }

    #[must_use]
    pub fn one_of(field: impl Into<FieldPath>, values: Vec<Value>) -> Self {
        Self::compare(field, CompareOp::In, Value::List(values))
    }

    #[must_use]
    pub fn matches(field: impl Into<FieldPath>, pattern: impl Into<String>) -> Self {
        Self::compare(field, CompareOp::Matches, Value::String(pattern.into()))
    }

    #[must_use]
    pub fn eq_bound(field: impl Into<FieldPath>, name: impl Into<String>) -> Self {
        Self::Compare {
            field: field.into(),
            op: CompareOp::Eq,
            operand: Operand::Bound(name.into()),
        }
    }

    #[must_use]
    pub fn eq_field(field: impl Into<FieldPath>, other: impl Into<FieldPath>) -> Self {
        Self::Compare {
            field: field.into(),
            op: CompareOp::Eq,
            operand: Operand::Field(other.into()),
        }
    }

    #[must_use]
    pub fn is_nil(field: impl Into<FieldPath>) -> Self {
        Self::IsNil { field: field.into() }
    }

    #[must_use]
    pub fn key_in(keys: Vec<Key>) -> Self {
        Self::KeyIn { keys }
    }

    #[must_use]
    pub fn bind(name: impl Into<String>, field: impl Into<FieldPath>) -> Self {
        Self::Bind {
            name: name.into(),
            field: field.into(),
        }
    }

    #[must_use]
    pub fn predicate(rule: impl Into<String>, equals: impl Into<Value>) -> Self {
        Self::Predicate {
            rule: rule.into(),
            equals: equals.into(),
        }
    }

    #[must_use]
    pub fn any(path: impl Into<FieldPath>, condition: Self) -> Self {
        Self::Any {
            path: path.into(),
            condition: Box::new(condition),
        }
    }

    #[must_use]
    pub fn all(path: impl Into<FieldPath>, condition: Self) -> Self {
        Self::All {
            path: path.into(),
            condition: Box::new(condition),
        }
    }

    #[must_use]
    pub fn and(conditions: Vec<Self>) -> Self {
        Self::And { conditions }
    }

    #[must_use]
    pub fn or(conditions: Vec<Self>) -> Self {
        Self::Or { conditions }
    }

    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn not(condition: Self) -> Self {
        Self::Not {
            condition: Box::new(condition),
        }
    }

    /// Conjoins two conditions, flattening nested `And`s and dropping `true`.
    #[must_use]
    pub fn conjoin(self, other: Self) -> Self {
        let mut parts = Vec::new();
        for c in [self, other] {
            match c {
                Self::Const { value: true } => {}
                Self::And { conditions } => parts.extend(conditions),
                other => parts.push(other),
            }
        }
        match parts.len() {
            0 => Self::always(),
            1 => parts.remove(0),
            _ => Self::And { conditions: parts },
        }
    }

    /// Checks regexes and paths up front.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidCondition { reason };
        match self {
            Self::Compare { field, operand, op } => {
                if field.is_empty() {
                    return Err(ValidationError::EmptyFieldPath);
                }
                if let (CompareOp::Matches, Operand::Value(Value::String(p))) = (op, operand) {
                    cached_regex(p).map_err(|e| invalid(e.to_string()))?;
                }
                Ok(())
            }
            Self::IsNil { field } | Self::Bind { field, .. } => {
                if field.is_empty() {
                    Err(ValidationError::EmptyFieldPath)
                } else {
                    Ok(())
                }
            }
            Self::Predicate { rule, .. } if rule.trim().is_empty() => Err(ValidationError::EmptyRuleId),
            Self::Any { path, condition } | Self::All { path, condition } => {
                if path.is_empty() {
                    return Err(ValidationError::EmptyFieldPath);
                }
                condition.validate()
            }
            Self::And { conditions } | Self::Or { conditions } => {
                conditions.iter().try_for_each(Self::validate)
            }
            Self::Not { condition } => condition.validate(),
            Self::Const { .. } | Self::KeyIn { .. } | Self::Predicate { .. } => Ok(()),
        }
    }

    /// Substitutes `Bound` operands with values from `binds`.
    ///
    /// Names introduced by `Bind` leaves inside the condition itself are left
    /// in place; any other unknown name is an error.
    pub fn bind_refs(&self, binds: &Binds) -> Result<Self, EvalError> {
        let mut local = HashSet::new();
        self.collect_bind_names(&mut local);
        self.substitute(binds, &local)
    }

    fn collect_bind_names(&self, out: &mut HashSet<String>) {
        match self {
            Self::Bind { name, .. } => {
                out.insert(name.clone());
            }
            Self::And { conditions } | Self::Or { conditions } => {
                conditions.iter().for_each(|c| c.collect_bind_names(out));
            }
            Self::Not { condition } | Self::Any { condition, .. } | Self::All { condition, .. } => {
                condition.collect_bind_names(out);
            }
            _ => {}
        }
    }

    fn substitute(&self, binds: &Binds, local: &HashSet<String>) -> Result<Self, EvalError> {
        Ok(match self {
            Self::Compare {
                field,
                op,
                operand: Operand::Bound(name),
            } if !local.contains(name) => {
                let value = binds
                    .get(name)
                    .cloned()
                    .ok_or_else(|| EvalError::Unbound { name: name.clone() })?;
                Self::Compare {
                    field: field.clone(),
                    op: *op,
                    operand: Operand::Value(value),
                }
            }
            Self::And { conditions } => Self::And {
                conditions: conditions
                    .iter()
                    .map(|c| c.substitute(binds, local))
                    .collect::<Result<_, _>>()?,
            },
            Self::Or { conditions } => Self::Or {
                conditions: conditions
                    .iter()
                    .map(|c| c.substitute(binds, local))
                    .collect::<Result<_, _>>()?,
            },
            Self::Not { condition } => Self::not(condition.substitute(binds, local)?),
            Self::Any { path, condition } => Self::any(path.clone(), condition.substitute(binds, local)?),
            Self::All { path, condition } => Self::all(path.clone(), condition.substitute(binds, local)?),
            other => other.clone(),
        })
    }

    /// Association chains this condition traverses, in first-seen order.
    ///
    /// Fetching these alongside candidate records is enough to re-evaluate the
    /// condition locally on the fetched data.
    #[must_use]
    pub fn association_paths(&self) -> Vec<FieldPath> {
        let mut out = Vec::new();
        self.collect_paths(None, &mut out);
        // Keep only maximal chains; a preloaded chain loads its prefixes too.
        let maximal: Vec<FieldPath> = out
            .iter()
            .filter(|p| !out.iter().any(|q| q != *p && p.is_prefix_of(q)))
            .cloned()
            .collect();
        maximal
    }

    fn collect_paths(&self, base: Option<&FieldPath>, out: &mut Vec<FieldPath>) {
        let push_chain = |field: &FieldPath, out: &mut Vec<FieldPath>| {
            let chain = field.prefix(field.len().saturating_sub(1));
            let full = match (base, chain) {
                (Some(b), Some(c)) => Some(c.segments().iter().fold(b.clone(), |acc, s| acc.child(s.clone()))),
                (Some(b), None) => Some(b.clone()),
                (None, c) => c,
            };
            if let Some(p) = full {
                if !out.contains(&p) {
                    out.push(p);
                }
            }
        };
        match self {
            Self::Compare { field, operand, .. } => {
                push_chain(field, out);
                if let Operand::Field(other) = operand {
                    push_chain(other, out);
                }
            }
            Self::IsNil { field } | Self::Bind { field, .. } => push_chain(field, out),
            Self::Any { path, condition } | Self::All { path, condition } => {
                let nested = match base {
                    Some(b) => path.segments().iter().fold(b.clone(), |acc, s| acc.child(s.clone())),
                    None => path.clone(),
                };
                if !out.contains(&nested) {
                    out.push(nested.clone());
                }
                condition.collect_paths(Some(&nested), out);
            }
            Self::And { conditions } | Self::Or { conditions } => {
                conditions.iter().for_each(|c| c.collect_paths(base, out));
            }
            Self::Not { condition } => condition.collect_paths(base, out),
            Self::Const { .. } | Self::KeyIn { .. } | Self::Predicate { .. } => {}
        }
    }

    /// Evaluates the condition for `subject`.
    ///
    /// `env` holds caller arguments and bindings visible to `Bound` operands.
    pub fn evaluate<S: FactSource + ?Sized>(&self, subject: &SubjectRef, source: &S, env: &Binds) -> Outcome<bool> {
        match self {
            Self::Const { value } => Outcome::ok(*value),
            Self::KeyIn { keys } => Outcome::ok(keys.contains(&subject.key)),
            Self::Compare { field, op, operand } => {
                let left = facts::read_values(source, subject, field);
                let right = match operand {
                    Operand::Value(v) => Outcome::ok(v.clone()),
                    Operand::Bound(name) => lookup_bound(name, env, source),
                    Operand::Field(path) => facts::read_path(source, subject, path),
                };
                left.zip(right).then(|(l, r)| match l {
                    Read::One(l) => apply(*op, &l, &r),
                    Read::Fanned(items) => apply_fanned(*op, items, &r),
                })
            }
            Self::IsNil { field } => facts::read_path(source, subject, field).map(|v| v.is_null()),
            Self::Bind { name, field } => facts::read_path(source, subject, field)
                .then(|v| Outcome::ok(true).with_bind(name.clone(), v)),
            Self::Predicate { rule, equals } => source
                .call_rule(rule, subject, env)
                .map(|v| v.loose_eq(equals)),
            Self::Any { path, condition } => facts::related(source, subject, path)
                .then(|targets| outcome::any(&targets, |t| condition.evaluate(t, source, env))),
            Self::All { path, condition } => facts::related(source, subject, path)
                .then(|targets| outcome::all(&targets, |t| condition.evaluate(t, source, env))),
            Self::And { conditions } => evaluate_and(conditions, subject, source, env),
            Self::Or { conditions } => evaluate_or(conditions, subject, source, env),
            Self::Not { condition } => condition.evaluate(subject, source, env).map(|v| !v),
        }
    }
}

impl Default for Condition {
    fn default() -> Self {
        Self::always()
    }
}

fn lookup_bound<S: FactSource + ?Sized>(name: &str, env: &Binds, source: &S) -> Outcome<Value> {
    match env.get(name).cloned().or_else(|| source.arg(name)) {
        Some(v) => Outcome::ok(v),
        None => Outcome::error(EvalError::Unbound {
            name: name.to_string(),
        }),
    }
}

// Children see bindings of earlier decided siblings.
fn evaluate_and<S: FactSource + ?Sized>(
    conditions: &[Condition],
    subject: &SubjectRef,
    source: &S,
    env: &Binds,
) -> Outcome<bool> {
    let mut scope = env.clone();
    let mut produced = Binds::new();
    let mut needs = NeedSet::new();
    for condition in conditions {
        match condition.evaluate(subject, source, &scope) {
            Outcome::Ok { value: false, .. } => return Outcome::ok(false),
            Outcome::Ok { value: true, binds } => {
                scope.extend(binds.clone());
                produced.extend(binds);
            }
            Outcome::NotLoaded(more) => needs.union_with(more),
            // The binding may come from a sibling that is still loading.
            Outcome::Error(EvalError::Unbound { .. }) if !needs.is_empty() => {}
            Outcome::Error(e) => return Outcome::Error(e),
        }
    }
    if needs.is_empty() {
        Outcome::ok_with(true, produced)
    } else {
        Outcome::NotLoaded(needs)
    }
}

fn evaluate_or<S: FactSource + ?Sized>(
    conditions: &[Condition],
    subject: &SubjectRef,
    source: &S,
    env: &Binds,
) -> Outcome<bool> {
    outcome::any(conditions, |c| c.evaluate(subject, source, env))
}

// A path through a to-many association holds if any reached value satisfies
// the comparison; `!=` holds if none is equal.
fn apply_fanned(op: CompareOp, items: Vec<Value>, right: &Value) -> Outcome<bool> {
    match op {
        CompareOp::Contains => apply(op, &Value::List(items), right),
        CompareOp::Ne => outcome::any(&items, |item| apply(CompareOp::Eq, item, right)).map(|eq| !eq),
        _ => outcome::any(&items, |item| apply(op, item, right)),
    }
}

fn apply(op: CompareOp, left: &Value, right: &Value) -> Outcome<bool> {
    // Nil never orders against anything, itself included.
    let ordered = |check: fn(std::cmp::Ordering) -> bool| {
        let comparable = !left.is_null() && !right.is_null();
        Outcome::ok(comparable && left.compare(right).is_some_and(check))
    };
    match op {
        CompareOp::Eq => Outcome::ok(left.loose_eq(right)),
        CompareOp::Ne => Outcome::ok(!left.loose_eq(right)),
        CompareOp::Lt => ordered(std::cmp::Ordering::is_lt),
        CompareOp::Le => ordered(std::cmp::Ordering::is_le),
        CompareOp::Gt => ordered(std::cmp::Ordering::is_gt),
        CompareOp::Ge => ordered(std::cmp::Ordering::is_ge),
        CompareOp::In => match right {
            Value::List(options) => Outcome::ok(options.iter().any(|o| left.loose_eq(o))),
            other => Outcome::error(EvalError::generic(format!(
                "'in' expects a list operand, got {}",
                other.type_name()
            ))),
        },
        CompareOp::Contains => match (left, right) {
            (Value::List(items), needle) => Outcome::ok(items.iter().any(|i| i.loose_eq(needle))),
            (Value::String(haystack), Value::String(needle)) => Outcome::ok(haystack.contains(needle.as_str())),
            (Value::Null, _) => Outcome::ok(false),
            (l, r) => Outcome::error(EvalError::generic(format!(
                "'contains' is not defined for {} and {}",
                l.type_name(),
                r.type_name()
            ))),
        },
        CompareOp::Matches => match (left, right) {
            (Value::String(s), Value::String(pattern)) => match cached_regex(pattern) {
                Ok(re) => Outcome::ok(re.is_match(s)),
                Err(e) => Outcome::error(e),
            },
            (Value::Null, _) => Outcome::ok(false),
            (l, r) => Outcome::error(EvalError::generic(format!(
                "'=~' is not defined for {} and {}",
                l.type_name(),
                r.type_name()
            ))),
        },
    }
}
