//! # kyrorules - speculative rule evaluation with batched loading
//!
//! kyrorules evaluates declarative rules over records held in a backing store
//! without asking the caller to pre-load the associations a rule touches.
//!
//! ## Core Concepts
//!
//! - **Outcome**: a rule result is resolved, blocked on missing data, or failed
//! - **DataNeed**: a structurally identified piece of data a rule could not read
//! - **Condition / Scope**: declarative predicates and lazy queries
//! - **BatchState**: merges the needs of one pass into as few fetches as possible
//! - **Resolver**: evaluate, fetch what was missing, retry, until done
//!
//! Rules are evaluated against whatever is cached. Reads of missing data do not
//! fail; they return the needs that would unblock them. After each pass the
//! needs of the whole evaluation are batched (the manager of N people is one
//! fetch, not N), fetched, and the rule is run again.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use kyrorules::{Binds, Engine, EngineConfig, InMemoryStore, Record, RuleRegistry, SubjectRef, Value};
//!
//! let store = Arc::new(InMemoryStore::new());
//! store.belongs_to("Person", "manager", "Person", "manager_id")?;
//! store.insert(Record::new(SubjectRef::new("Person", 1)).with_field("name", "Ada"))?;
//! store.insert(Record::new(SubjectRef::new("Person", 2)).with_field("manager_id", 1))?;
//!
//! let mut rules = RuleRegistry::new();
//! rules.register_fn("manager_name", |subject, _args, ctx| ctx.field(subject, "manager.name"))?;
//!
//! let engine = Engine::new(store, rules, EngineConfig::default())?;
//! let name = engine.evaluate("manager_name", &SubjectRef::new("Person", 2), &Binds::new())?;
//! assert_eq!(name, Value::from("Ada"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Data model
pub mod error;
pub mod need;
pub mod outcome;
pub mod record;
pub mod value;

// Evaluation
pub mod batch;
pub mod condition;
pub mod context;
pub mod facts;
pub mod rules;
pub mod scope;

// Resolution and storage
pub mod engine;
pub mod resolver;
pub mod storage;

// Re-export primary types at crate root for convenience
pub use batch::{Batch, BatchState, FetchSpec, Fingerprint};
pub use condition::{CompareOp, Condition, Operand};
pub use context::{Cache, EngineConfig, EvalContext, EvalOptions, EvaluationContext, PassStats};
pub use engine::{Engine, Tolerant};
pub use error::{AbortReason, ErrorKind, EvalError, RuleError, RuleResult, ValidationError};
pub use facts::{FactSource, Reached, Read};
pub use need::{DataNeed, FieldPath, NeedSet};
pub use outcome::{Binds, Outcome};
pub use record::{Queryable, Record, Related, SubjectRef};
pub use resolver::{Resolution, Resolver};
pub use rules::{Clause, ConditionRule, EvaluationUnit, Expr, PredicateRules, RuleRegistry};
pub use scope::Scope;
pub use storage::{Association, InMemoryStore, Store, StoreError};
pub use value::{Key, Value};
