//! The tri-state evaluation result and its combinators.
//!
//! An [`Outcome`] is either resolved (`Ok`, with any named bindings produced on
//! the way), blocked on missing data (`NotLoaded`, with the needs that would
//! unblock it), or failed (`Error`). Every combinator follows the same
//! precedence: the first error in left-to-right order wins; otherwise any
//! pending input makes the output pending with the union of all needs; only
//! all-`Ok` inputs produce `Ok`.
//!
//! # Example
//! ```
//! use kyrorules::{DataNeed, Outcome, SubjectRef};
//!
//! let a: Outcome<i64> = Outcome::ok(2);
//! let b: Outcome<i64> = Outcome::not_loaded(DataNeed::subject(SubjectRef::new("Person", 1)));
//! let sum = a.merge(b, |x, y| x + y);
//! assert!(sum.is_not_loaded());
//! ```

use std::collections::BTreeMap;
use std::ops::ControlFlow;

use crate::error::EvalError;
use crate::need::{DataNeed, NeedSet};
use crate::value::Value;

/// Named intermediate values threaded through a rule.
pub type Binds = BTreeMap<String, Value>;

/// Result of evaluating (part of) a rule against the current cache.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub enum Outcome<T> {
    /// Fully resolved.
    Ok {
        /// The value.
        value: T,
        /// Bindings produced while computing it.
        binds: Binds,
    },
    /// Blocked on data that is not cached yet. Never carries a usable value.
    NotLoaded(NeedSet),
    /// Failed for a reason that retrying will not fix.
    Error(EvalError),
}

impl<T> Outcome<T> {
    /// Resolved value without bindings.
    pub fn ok(value: T) -> Self {
        Self::Ok {
            value,
            binds: Binds::new(),
        }
    }

    /// Resolved value with bindings.
    pub fn ok_with(value: T, binds: Binds) -> Self {
        Self::Ok { value, binds }
    }

    /// Pending on one need.
    pub fn not_loaded(need: DataNeed) -> Self {
        Self::NotLoaded(NeedSet::single(need))
    }

    /// Pending on a set of needs.
    pub fn pending(needs: NeedSet) -> Self {
        Self::NotLoaded(needs)
    }

    /// Failed.
    pub fn error(err: EvalError) -> Self {
        Self::Error(err)
    }

    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    #[must_use]
    pub const fn is_not_loaded(&self) -> bool {
        matches!(self, Self::NotLoaded(_))
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// The resolved value, if any.
    #[must_use]
    pub const fn value(&self) -> Option<&T> {
        match self {
            Self::Ok { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Consumes the outcome, returning the resolved value, if any.
    #[must_use]
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Ok { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Bindings of a resolved outcome.
    #[must_use]
    pub const fn binds(&self) -> Option<&Binds> {
        match self {
            Self::Ok { binds, .. } => Some(binds),
            _ => None,
        }
    }

    /// Needs of a pending outcome.
    #[must_use]
    pub const fn needs(&self) -> Option<&NeedSet> {
        match self {
            Self::NotLoaded(needs) => Some(needs),
            _ => None,
        }
    }

    /// Error of a failed outcome.
    #[must_use]
    pub const fn err(&self) -> Option<&EvalError> {
        match self {
            Self::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Adds a binding to a resolved outcome.
    pub fn with_bind(self, name: impl Into<String>, value: Value) -> Self {
        match self {
            Self::Ok { value: v, mut binds } => {
                binds.insert(name.into(), value);
                Self::Ok { value: v, binds }
            }
            other => other,
        }
    }

    /// Transforms the resolved value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Ok { value, binds } => Outcome::Ok {
                value: f(value),
                binds,
            },
            Self::NotLoaded(needs) => Outcome::NotLoaded(needs),
            Self::Error(e) => Outcome::Error(e),
        }
    }

    /// Transforms the error.
    pub fn map_err(self, f: impl FnOnce(EvalError) -> EvalError) -> Self {
        match self {
            Self::Error(e) => Self::Error(f(e)),
            other => other,
        }
    }

    /// Chains a dependent computation. Bindings of both steps are kept, the
    /// inner step winning on name clashes.
    pub fn then<U>(self, f: impl FnOnce(T) -> Outcome<U>) -> Outcome<U> {
        self.then_with(|value, _| f(value))
    }

    /// Alias of [`Outcome::then`].
    pub fn and_then<U>(self, f: impl FnOnce(T) -> Outcome<U>) -> Outcome<U> {
        self.then(f)
    }

    /// Like [`Outcome::then`], but the continuation also sees the bindings so far.
    pub fn then_with<U>(self, f: impl FnOnce(T, &Binds) -> Outcome<U>) -> Outcome<U> {
        match self {
            Self::Ok { value, binds } => match f(value, &binds) {
                Outcome::Ok {
                    value,
                    binds: inner,
                } => {
                    let mut merged = binds;
                    merged.extend(inner);
                    Outcome::Ok {
                        value,
                        binds: merged,
                    }
                }
                other => other,
            },
            Self::NotLoaded(needs) => Outcome::NotLoaded(needs),
            Self::Error(e) => Outcome::Error(e),
        }
    }

    /// Keeps the value only if the predicate resolves to true.
    pub fn filter(self, pred: impl FnOnce(&T) -> Outcome<bool>) -> Outcome<Option<T>> {
        self.then(|value| pred(&value).map(|keep| keep.then_some(value)))
    }

    /// Combines two outcomes.
    ///
    /// The error of `self` wins over the error of `other`; with no error, the
    /// needs of both are unioned; with both resolved, `f` combines the values.
    pub fn merge<U, V>(self, other: Outcome<U>, f: impl FnOnce(T, U) -> V) -> Outcome<V> {
        match (self, other) {
            (Self::Error(e), _) | (_, Outcome::Error(e)) => Outcome::Error(e),
            (Self::NotLoaded(a), Outcome::NotLoaded(b)) => Outcome::NotLoaded(a.union(b)),
            (Self::NotLoaded(a), Outcome::Ok { .. }) => Outcome::NotLoaded(a),
            (Self::Ok { .. }, Outcome::NotLoaded(b)) => Outcome::NotLoaded(b),
            (
                Self::Ok { value: a, binds },
                Outcome::Ok {
                    value: b,
                    binds: other_binds,
                },
            ) => {
                let mut merged = binds;
                merged.extend(other_binds);
                Outcome::Ok {
                    value: f(a, b),
                    binds: merged,
                }
            }
        }
    }

    /// Pairs two outcomes.
    pub fn zip<U>(self, other: Outcome<U>) -> Outcome<(T, U)> {
        self.merge(other, |a, b| (a, b))
    }

    /// Folds into a plain value, using `fallback` for pending or failed outcomes.
    pub fn transform<R>(self, on_ok: impl FnOnce(T) -> R, fallback: impl FnOnce() -> R) -> R {
        match self {
            Self::Ok { value, .. } => on_ok(value),
            Self::NotLoaded(_) | Self::Error(_) => fallback(),
        }
    }

    /// The resolved value, or `default`.
    pub fn unwrap_or(self, default: T) -> T {
        self.transform(|v| v, || default)
    }
}

impl<T> From<EvalError> for Outcome<T> {
    fn from(err: EvalError) -> Self {
        Self::Error(err)
    }
}

/// Accumulates element outcomes in order, applying the shared precedence.
struct Accumulator {
    needs: NeedSet,
    binds: Binds,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            needs: NeedSet::new(),
            binds: Binds::new(),
        }
    }

    fn pending(&self) -> bool {
        !self.needs.is_empty()
    }

    fn finish<T>(self, value: T) -> Outcome<T> {
        if self.needs.is_empty() {
            Outcome::Ok {
                value,
                binds: self.binds,
            }
        } else {
            Outcome::NotLoaded(self.needs)
        }
    }
}

/// Turns a sequence of outcomes into an outcome of the sequence.
///
/// Stops consuming at the first error; pending elements do not stop the scan so
/// that every need of the sequence surfaces in one pass.
pub fn collect<T>(items: impl IntoIterator<Item = Outcome<T>>) -> Outcome<Vec<T>> {
    let mut acc = Accumulator::new();
    let mut values = Vec::new();
    for item in items {
        match item {
            Outcome::Ok { value, binds } => {
                acc.binds.extend(binds);
                if !acc.pending() {
                    values.push(value);
                }
            }
            Outcome::NotLoaded(needs) => acc.needs.union_with(needs),
            Outcome::Error(e) => return Outcome::Error(e),
        }
    }
    acc.finish(values)
}

/// Evaluates `f` on every item and collects the results.
pub fn map_all<I, T>(items: &[I], f: impl FnMut(&I) -> Outcome<T>) -> Outcome<Vec<T>> {
    collect(items.iter().map(f))
}

/// Keeps the items whose predicate resolves to true.
pub fn filter<I: Clone>(items: &[I], mut pred: impl FnMut(&I) -> Outcome<bool>) -> Outcome<Vec<I>> {
    collect(items.iter().map(|item| pred(item).map(|keep| keep.then(|| item.clone()))))
        .map(|kept| kept.into_iter().flatten().collect())
}

/// Keeps the `Some` results of `f`, in order.
pub fn filter_map<I, T>(items: &[I], f: impl FnMut(&I) -> Outcome<Option<T>>) -> Outcome<Vec<T>> {
    collect(items.iter().map(f)).map(|found| found.into_iter().flatten().collect())
}

/// Counts the items whose predicate resolves to true.
pub fn count<I>(items: &[I], mut pred: impl FnMut(&I) -> Outcome<bool>) -> Outcome<usize> {
    collect(items.iter().map(|item| pred(item))).map(|flags| flags.into_iter().filter(|f| *f).count())
}

/// True if any item satisfies the predicate.
///
/// A decided `true` ends the scan and discards pending needs of other items,
/// since resolving them cannot change the answer.
pub fn any<I>(items: &[I], mut pred: impl FnMut(&I) -> Outcome<bool>) -> Outcome<bool> {
    let mut acc = Accumulator::new();
    for item in items {
        match pred(item) {
            Outcome::Ok { value: true, binds } => return Outcome::ok_with(true, binds),
            Outcome::Ok { value: false, binds } => acc.binds.extend(binds),
            Outcome::NotLoaded(needs) => acc.needs.union_with(needs),
            Outcome::Error(e) => return Outcome::Error(e),
        }
    }
    acc.finish(false)
}

/// True if every item satisfies the predicate. Short-circuits on a decided `false`.
pub fn all<I>(items: &[I], mut pred: impl FnMut(&I) -> Outcome<bool>) -> Outcome<bool> {
    let mut acc = Accumulator::new();
    for item in items {
        match pred(item) {
            Outcome::Ok { value: false, binds } => return Outcome::ok_with(false, binds),
            Outcome::Ok { value: true, binds } => acc.binds.extend(binds),
            Outcome::NotLoaded(needs) => acc.needs.union_with(needs),
            Outcome::Error(e) => return Outcome::Error(e),
        }
    }
    acc.finish(true)
}

/// First item (in order) satisfying the predicate.
///
/// Stops at the first decided match. If an earlier item is still pending it
/// might be the real first match, so the result stays pending on its needs.
pub fn find<I: Clone>(items: &[I], mut pred: impl FnMut(&I) -> Outcome<bool>) -> Outcome<Option<I>> {
    let mut acc = Accumulator::new();
    for item in items {
        match pred(item) {
            Outcome::Ok { value: true, binds } => {
                acc.binds.extend(binds);
                return acc.finish(Some(item.clone()));
            }
            Outcome::Ok { value: false, .. } => {}
            Outcome::NotLoaded(needs) => acc.needs.union_with(needs),
            Outcome::Error(e) => return Outcome::Error(e),
        }
    }
    acc.finish(None)
}

/// First `Some` produced by `f`, in item order.
///
/// Same precedence as [`find`]: a hit after a pending item stays pending.
pub fn find_value<I, T>(items: &[I], mut f: impl FnMut(&I) -> Outcome<Option<T>>) -> Outcome<Option<T>> {
    let mut acc = Accumulator::new();
    for item in items {
        match f(item) {
            Outcome::Ok { value: Some(value), binds } => {
                acc.binds.extend(binds);
                return acc.finish(Some(value));
            }
            Outcome::Ok { value: None, .. } => {}
            Outcome::NotLoaded(needs) => acc.needs.union_with(needs),
            Outcome::Error(e) => return Outcome::Error(e),
        }
    }
    acc.finish(None)
}

/// Length of the leading run of items satisfying the predicate.
///
/// The scan ends at the first decided `false`; needs of items before it are kept.
pub fn count_while<I>(items: &[I], mut pred: impl FnMut(&I) -> Outcome<bool>) -> Outcome<usize> {
    let mut acc = Accumulator::new();
    let mut counted = 0;
    for item in items {
        match pred(item) {
            Outcome::Ok { value: true, binds } => {
                acc.binds.extend(binds);
                counted += 1;
            }
            Outcome::Ok { value: false, binds } => {
                acc.binds.extend(binds);
                break;
            }
            Outcome::NotLoaded(needs) => acc.needs.union_with(needs),
            Outcome::Error(e) => return Outcome::Error(e),
        }
    }
    acc.finish(counted)
}

/// Evaluates every item, then folds the values with the first one as the seed.
///
/// `None` for an empty slice.
pub fn map_then_reduce<I, X>(
    items: &[I],
    eval: impl FnMut(&I) -> Outcome<X>,
    fold: impl FnMut(X, X) -> X,
) -> Outcome<Option<X>> {
    map_all(items, eval).map(|values| values.into_iter().reduce(fold))
}

/// Evaluates every item, then folds the resolved values in order.
pub fn reduce<I, X, A>(
    items: &[I],
    init: A,
    eval: impl FnMut(&I) -> Outcome<X>,
    mut fold: impl FnMut(A, X) -> A,
) -> Outcome<A> {
    map_all(items, eval).map(|values| values.into_iter().fold(init, &mut fold))
}

/// Folds in order, stopping as soon as `fold` breaks.
///
/// Once any element is pending the accumulator is unknown, so folding stops
/// but the scan continues to gather needs from the remaining elements.
pub fn reduce_while<I, X, A>(
    items: &[I],
    init: A,
    mut eval: impl FnMut(&I) -> Outcome<X>,
    mut fold: impl FnMut(A, X) -> ControlFlow<A, A>,
) -> Outcome<A> {
    let mut acc = Accumulator::new();
    let mut state = Some(init);
    for item in items {
        match eval(item) {
            Outcome::Ok { value, binds } => {
                acc.binds.extend(binds);
                if acc.pending() {
                    continue;
                }
                if let Some(current) = state.take() {
                    match fold(current, value) {
                        ControlFlow::Continue(next) => state = Some(next),
                        ControlFlow::Break(done) => return acc.finish(done),
                    }
                }
            }
            Outcome::NotLoaded(needs) => acc.needs.union_with(needs),
            Outcome::Error(e) => return Outcome::Error(e),
        }
    }
    match state {
        Some(value) => acc.finish(value),
        None => Outcome::NotLoaded(acc.needs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SubjectRef;

    fn need(key: i64) -> DataNeed {
        DataNeed::subject(SubjectRef::new("Person", key))
    }

    fn pending<T>(key: i64) -> Outcome<T> {
        Outcome::not_loaded(need(key))
    }

    fn failed<T>(msg: &str) -> Outcome<T> {
        Outcome::error(EvalError::generic(msg))
    }

    #[test]
    fn test_map_and_then() {
        let out = Outcome::ok(2).map(|v| v * 10).then(|v| Outcome::ok(v + 1));
        assert_eq!(out.into_value(), Some(21));

        let out: Outcome<i32> = pending::<i32>(1).then(|v| Outcome::ok(v + 1));
        assert!(out.is_not_loaded());
    }

    #[test]
    fn test_then_merges_binds() {
        let out = Outcome::ok(1)
            .with_bind("a", Value::Int(1))
            .then_with(|v, binds| {
                assert!(binds.contains_key("a"));
                Outcome::ok(v + 1).with_bind("b", Value::Int(2))
            });
        let binds = out.binds().unwrap();
        assert_eq!(binds.len(), 2);
    }

    #[test]
    fn test_merge_error_beats_not_loaded() {
        let out = pending::<i32>(1).merge(failed::<i32>("boom"), |a, b| a + b);
        assert_eq!(out.err(), Some(&EvalError::generic("boom")));
    }

    #[test]
    fn test_merge_first_error_wins() {
        let out = failed::<i32>("first").merge(failed::<i32>("second"), |a, b| a + b);
        assert_eq!(out.err(), Some(&EvalError::generic("first")));
    }

    #[test]
    fn test_merge_unions_needs() {
        let out = pending::<i32>(1).merge(pending::<i32>(2), |a, b| a + b);
        assert_eq!(out.needs().map(NeedSet::len), Some(2));
    }

    #[test]
    fn test_filter_single() {
        assert_eq!(Outcome::ok(5).filter(|v| Outcome::ok(*v > 3)).into_value(), Some(Some(5)));
        assert_eq!(Outcome::ok(1).filter(|v| Outcome::ok(*v > 3)).into_value(), Some(None));
    }

    #[test]
    fn test_transform_fallback() {
        assert_eq!(pending::<i32>(1).transform(|v| v, || -1), -1);
        assert_eq!(failed::<i32>("x").unwrap_or(0), 0);
        assert_eq!(Outcome::ok(3).unwrap_or(0), 3);
    }

    #[test]
    fn test_collect_all_ok() {
        let out = collect(vec![Outcome::ok(1), Outcome::ok(2)]);
        assert_eq!(out.into_value(), Some(vec![1, 2]));
    }

    #[test]
    fn test_collect_gathers_every_need() {
        let out = collect(vec![pending(1), Outcome::ok(2), pending(3)]);
        assert_eq!(out.needs().map(NeedSet::len), Some(2));
    }

    #[test]
    fn test_collect_error_after_pending() {
        let out = collect(vec![pending::<i32>(1), failed("late"), pending(3)]);
        assert_eq!(out.err(), Some(&EvalError::generic("late")));
    }

    #[test]
    fn test_any_short_circuits_and_drops_needs() {
        let items = [pending::<bool>(1), Outcome::ok(true), failed("never")];
        let mut visited = 0;
        let out = any(&[0usize, 1, 2], |i| {
            visited += 1;
            items[*i].clone()
        });
        assert_eq!(out.into_value(), Some(true));
        assert_eq!(visited, 2);
    }

    #[test]
    fn test_all_pending_when_undecided() {
        let out = all(&[1i64, 2], |k| {
            if *k == 1 {
                Outcome::ok(true)
            } else {
                pending(*k)
            }
        });
        assert!(out.is_not_loaded());
    }

    #[test]
    fn test_find_keeps_needs_of_earlier_items() {
        let out = find(&[1i64, 2, 3], |k| match k {
            1 => pending(1),
            2 => Outcome::ok(true),
            _ => pending(3),
        });
        let needs = out.needs().unwrap();
        assert!(needs.contains(&need(1)));
        assert!(!needs.contains(&need(3)));
    }

    #[test]
    fn test_find_first_match() {
        let out = find(&[1i64, 2, 3], |k| Outcome::ok(*k >= 2));
        assert_eq!(out.into_value(), Some(Some(2)));
    }

    #[test]
    fn test_filter_and_count_lists() {
        let out = filter(&[1, 2, 3, 4], |v| Outcome::ok(v % 2 == 0));
        assert_eq!(out.into_value(), Some(vec![2, 4]));
        let out = count(&[1, 2, 3, 4], |v| Outcome::ok(*v > 1));
        assert_eq!(out.into_value(), Some(3));
    }

    #[test]
    fn test_filter_map_keeps_some() {
        let out = filter_map(&[1, 2, 3, 4], |v| Outcome::ok((v % 2 == 0).then_some(v * 10)));
        assert_eq!(out.into_value(), Some(vec![20, 40]));

        let out = filter_map(&[1i64, 2], |k| pending::<Option<i64>>(*k));
        assert_eq!(out.needs().map(NeedSet::len), Some(2));
    }

    #[test]
    fn test_find_value_returns_first_some() {
        let out = find_value(&[1, 2, 3], |v| Outcome::ok((*v > 1).then(|| format!("#{v}"))));
        assert_eq!(out.into_value(), Some(Some("#2".to_string())));

        let out = find_value(&[1, 2], |_| Outcome::ok(None::<i32>));
        assert_eq!(out.into_value(), Some(None));
    }

    #[test]
    fn test_find_value_waits_on_earlier_items() {
        let out = find_value(&[1i64, 2, 3], |k| match k {
            1 => pending(1),
            2 => Outcome::ok(Some(*k)),
            _ => failed("never"),
        });
        assert_eq!(out.needs().map(NeedSet::len), Some(1));
        assert!(out.needs().unwrap().contains(&need(1)));
    }

    #[test]
    fn test_count_while_stops_at_first_false() {
        let mut visited = 0;
        let out = count_while(&[1, 2, 5, 3], |v| {
            visited += 1;
            Outcome::ok(*v < 4)
        });
        assert_eq!(out.into_value(), Some(2));
        assert_eq!(visited, 3);
    }

    #[test]
    fn test_count_while_keeps_needs_before_the_stop() {
        let out = count_while(&[1i64, 2, 3], |k| match k {
            1 => pending(1),
            2 => Outcome::ok(false),
            _ => pending(3),
        });
        let needs = out.needs().unwrap();
        assert!(needs.contains(&need(1)));
        assert!(!needs.contains(&need(3)));

        let out = count_while(&[1, 2], |_| failed::<bool>("boom"));
        assert_eq!(out.err(), Some(&EvalError::generic("boom")));
    }

    #[test]
    fn test_map_then_reduce_seeds_with_first() {
        let out = map_then_reduce(&[3, 1, 2], |v| Outcome::ok(*v), i32::max);
        assert_eq!(out.into_value(), Some(Some(3)));
        let out = map_then_reduce(&[] as &[i32], |v| Outcome::ok(*v), i32::max);
        assert_eq!(out.into_value(), Some(None));
    }

    #[test]
    fn test_reduce_sums() {
        let out = reduce(&[1, 2, 3], 0, |v| Outcome::ok(*v), |acc, v| acc + v);
        assert_eq!(out.into_value(), Some(6));
    }

    #[test]
    fn test_reduce_while_breaks_early() {
        let mut evaluated = 0;
        let out = reduce_while(
            &[5, 5, 5, 5],
            0,
            |v| {
                evaluated += 1;
                Outcome::ok(*v)
            },
            |acc, v| {
                let next = acc + v;
                if next >= 10 {
                    ControlFlow::Break(next)
                } else {
                    ControlFlow::Continue(next)
                }
            },
        );
        assert_eq!(out.into_value(), Some(10));
        assert_eq!(evaluated, 2);
    }

    #[test]
    fn test_reduce_while_keeps_visited_needs() {
        let out = reduce_while(
            &[1i64, 2, 3],
            0i64,
            |k| if *k == 3 { Outcome::ok(*k) } else { pending(*k) },
            |acc, v| ControlFlow::Break(acc + v),
        );
        let needs = out.needs().unwrap();
        assert_eq!(needs.len(), 2);
    }
}
