//! The resolution loop.
//!
//! Runs a unit against the cache; when it reports missing data, merges the
//! needs into batched fetches, runs them, absorbs the records and tries again.
//! Stops on a value, on an error, or when the pass or time budget runs out.
//!
//! States:
//! - `Running`: the unit is evaluated against the current cache.
//! - `AwaitingFetch`: needs are batched and fetched; the budget is checked first.
//! - `Done` / `Failed`: terminal, returned to the caller.
//! - `Aborted`: the budget ran out while data was still missing.

mod dispatch;

use tracing::{debug, trace, warn};

use crate::batch::{Batch, BatchState};
use crate::context::{EvalContext, EvaluationContext};
use crate::error::{AbortReason, EvalError};
use crate::need::NeedSet;
use crate::outcome::{Binds, Outcome};
use crate::rules::RuleRegistry;
use crate::storage::Store;

/// Terminal result of a loop that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    /// The unit produced a value.
    Done(T),
    /// The budget ran out; `pending` is what the last pass was still missing.
    Aborted {
        /// Which budget ran out.
        reason: AbortReason,
        /// Needs the unit was still blocked on.
        pending: NeedSet,
    },
}

impl<T> Resolution<T> {
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Resolution<U> {
        match self {
            Self::Done(v) => Resolution::Done(f(v)),
            Self::Aborted { reason, pending } => Resolution::Aborted { reason, pending },
        }
    }

    /// The value, if the loop finished.
    #[must_use]
    pub fn done(self) -> Option<T> {
        match self {
            Self::Done(v) => Some(v),
            Self::Aborted { .. } => None,
        }
    }
}

enum State<T> {
    Running,
    AwaitingFetch(NeedSet),
    Done(T),
    Failed(EvalError),
    Aborted { reason: AbortReason, pending: NeedSet },
}

/// Drives units to completion against one store.
#[derive(Clone, Copy)]
pub struct Resolver<'a> {
    store: &'a dyn Store,
    rules: &'a RuleRegistry,
    workers: usize,
}

impl<'a> Resolver<'a> {
    #[must_use]
    pub fn new(store: &'a dyn Store, rules: &'a RuleRegistry, workers: usize) -> Self {
        Self {
            store,
            rules,
            workers: workers.max(1),
        }
    }

    /// Runs `unit` until it resolves.
    ///
    /// The pass counter and clock of `ctx` are reset first; its cache is kept
    /// and grows with everything fetched.
    pub fn resolve<T, F>(&self, ctx: &mut EvaluationContext, args: &Binds, unit: F) -> Result<Resolution<T>, EvalError>
    where
        F: Fn(&EvalContext<'_>) -> Outcome<T>,
    {
        ctx.reset_budget();
        let mut state = State::Running;
        loop {
            state = match state {
                State::Running => match unit(&ctx.view(self.rules, args)) {
                    Outcome::Ok { value, .. } => State::Done(value),
                    Outcome::NotLoaded(needs) => State::AwaitingFetch(needs),
                    Outcome::Error(e) => State::Failed(e),
                },
                State::AwaitingFetch(needs) => {
                    if let Some(reason) = ctx.budget_exhausted() {
                        warn!(
                            %reason,
                            passes = ctx.passes(),
                            pending = needs.len(),
                            "evaluation aborted"
                        );
                        State::Aborted {
                            reason,
                            pending: needs,
                        }
                    } else {
                        match self.fetch_pass(ctx, &needs) {
                            Ok(true) => State::Running,
                            Ok(false) => {
                                warn!(
                                    passes = ctx.passes(),
                                    pending = needs.len(),
                                    "evaluation aborted: needs persist after their fetches were served"
                                );
                                State::Aborted {
                                    reason: AbortReason::NoProgress,
                                    pending: needs,
                                }
                            }
                            Err(e) => State::Failed(e),
                        }
                    }
                }
                State::Done(value) => return Ok(Resolution::Done(value)),
                State::Failed(e) => return Err(e),
                State::Aborted { reason, pending } => return Ok(Resolution::Aborted { reason, pending }),
            };
        }
    }

    /// Runs one fetch round. Returns `false` when there was nothing new to fetch.
    fn fetch_pass(&self, ctx: &mut EvaluationContext, needs: &NeedSet) -> Result<bool, EvalError> {
        let batches: Vec<Batch> = BatchState::from_needs(needs)
            .batches()
            .into_iter()
            .filter(|b| !ctx.was_fetched(&b.spec.fingerprint()))
            .collect();
        if batches.is_empty() {
            return Ok(false);
        }

        let pass = ctx.begin_pass();
        debug!(pass, needs = needs.len(), specs = batches.len(), "fetch pass");
        let specs: Vec<_> = batches.iter().map(|b| b.spec.clone()).collect();
        for spec in &specs {
            trace!(pass, %spec, "fetch spec");
        }

        let results = dispatch::fetch_all(self.store, &specs, self.workers)?;
        for (batch, records) in batches.iter().zip(results) {
            ctx.absorb(batch, records)?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EvalOptions;
    use crate::need::DataNeed;
    use crate::record::{Record, SubjectRef};
    use crate::storage::InMemoryStore;
    use crate::value::Value;

    fn person(key: i64) -> SubjectRef {
        SubjectRef::new("Person", key)
    }

    fn store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.belongs_to("Person", "manager", "Person", "manager_id").unwrap();
        store.insert(Record::new(person(1)).with_field("name", "Ada")).unwrap();
        store
            .insert(Record::new(person(2)).with_field("name", "Bob").with_field("manager_id", 1))
            .unwrap();
        store
    }

    #[test]
    fn test_resolves_after_one_fetch() {
        let store = store();
        let rules = RuleRegistry::new();
        let resolver = Resolver::new(&store, &rules, 1);
        let mut ctx = EvaluationContext::new(EvalOptions::default()).unwrap();

        let out = resolver
            .resolve(&mut ctx, &Binds::new(), |view| view.field(&person(2), "manager.name"))
            .unwrap();
        assert_eq!(out, Resolution::Done(Value::from("Ada")));
        assert_eq!(ctx.stats().passes, 1);
        assert_eq!(store.fetch_count().unwrap(), 1);
    }

    #[test]
    fn test_error_is_not_retried() {
        let store = store();
        let rules = RuleRegistry::new();
        let resolver = Resolver::new(&store, &rules, 1);
        let mut ctx = EvaluationContext::new(EvalOptions::default()).unwrap();

        let out: Result<Resolution<Value>, _> =
            resolver.resolve(&mut ctx, &Binds::new(), |_| Outcome::error(EvalError::generic("nope")));
        assert_eq!(out, Err(EvalError::generic("nope")));
        assert_eq!(store.fetch_count().unwrap(), 0);
    }

    #[test]
    fn test_aborts_when_passes_run_out() {
        let store = store();
        let rules = RuleRegistry::new();
        let resolver = Resolver::new(&store, &rules, 1);
        let mut ctx = EvaluationContext::new(EvalOptions::default().with_max_passes(1)).unwrap();

        let out = resolver
            .resolve(&mut ctx, &Binds::new(), |view| {
                view.related_one(&person(2), "manager").then(|m| match m {
                    Some(m) => view.related_one(&m, "manager"),
                    None => Outcome::ok(None),
                })
            })
            .unwrap();
        let Resolution::Aborted { reason, pending } = out else {
            panic!("expected abort");
        };
        assert_eq!(reason, AbortReason::MaxPasses);
        assert!(pending.contains(&DataNeed::path(person(1), "manager".into())));
    }

    #[test]
    fn test_no_progress_aborts() {
        let store = store();
        let rules = RuleRegistry::new();
        let resolver = Resolver::new(&store, &rules, 1);
        let mut ctx = EvaluationContext::new(EvalOptions::default()).unwrap();

        // A unit that keeps asking for the same thing regardless of the cache.
        let out: Result<Resolution<Value>, _> = resolver.resolve(&mut ctx, &Binds::new(), |_| {
            Outcome::not_loaded(DataNeed::subject(person(1)))
        });
        let Ok(Resolution::Aborted { reason, pending }) = out else {
            panic!("expected abort, got {out:?}");
        };
        assert_eq!(reason, AbortReason::NoProgress);
        assert!(pending.contains(&DataNeed::subject(person(1))));
        assert_eq!(store.fetch_count().unwrap(), 1);
    }

    #[test]
    fn test_store_errors_fail_the_call() {
        let store = store();
        let rules = RuleRegistry::new();
        let resolver = Resolver::new(&store, &rules, 1);
        let mut ctx = EvaluationContext::new(EvalOptions::default()).unwrap();

        let out = resolver.resolve(&mut ctx, &Binds::new(), |view| {
            view.field(&SubjectRef::new("Ghost", 1), "name")
        });
        assert!(matches!(out, Err(EvalError::Store { .. })));
    }
}
