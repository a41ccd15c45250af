use kyrorules::{
    Binds, Condition, Engine, EngineConfig, ErrorKind, EvalError, EvalOptions, InMemoryStore, Record, RuleError,
    RuleRegistry, Scope, SubjectRef, Value,
};
use std::sync::Arc;

fn person(key: i64) -> SubjectRef {
    SubjectRef::new("Person", key)
}

fn people(keys: &[i64]) -> Vec<SubjectRef> {
    keys.iter().copied().map(person).collect()
}

/// 1 manages 2..=6; 2 manages 7. Even keys and 1 are active; 7 has no flag.
fn store() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    store.belongs_to("Person", "manager", "Person", "manager_id").unwrap();
    store.has_many("Person", "reports", "Person", "manager_id").unwrap();
    store
        .insert(Record::new(person(1)).with_field("name", "Ada").with_field("active", true))
        .unwrap();
    for key in 2..=6 {
        store
            .insert(
                Record::new(person(key))
                    .with_field("name", format!("p{key}"))
                    .with_field("manager_id", 1)
                    .with_field("active", key % 2 == 0),
            )
            .unwrap();
    }
    store
        .insert(Record::new(person(7)).with_field("name", "p7").with_field("manager_id", 2))
        .unwrap();
    store
}

fn engine_with(options: EvalOptions) -> (Engine, Arc<InMemoryStore>) {
    let store = store();
    let mut rules = RuleRegistry::new();
    rules
        .register_fn("team_size", |_, _, ctx| {
            let team = Scope::new("Person").with_condition(Condition::eq_bound("manager_id", "boss"));
            ctx.query(&team)
                .map(|members| Value::Int(i64::try_from(members.len()).unwrap_or(i64::MAX)))
        })
        .unwrap();
    rules
        .register_fn("name", |s, _, ctx| ctx.field(s, "name"))
        .unwrap();
    let config = EngineConfig::default().with_default_options(options);
    let engine = Engine::new(store.clone(), rules, config).unwrap();
    (engine, store)
}

fn engine() -> (Engine, Arc<InMemoryStore>) {
    engine_with(EvalOptions::default())
}

#[test]
fn query_all_returns_store_order() {
    let (engine, store) = engine();
    let active = engine
        .query_all(&Scope::new("Person").with_condition(Condition::eq("active", true)))
        .unwrap();
    assert_eq!(active, people(&[1, 2, 4, 6]));
    assert_eq!(store.fetch_count().unwrap(), 1);
}

#[test]
fn scope_binds_fill_bound_operands() {
    let (engine, _) = engine();
    let scope = Scope::new("Person")
        .with_condition(Condition::eq_bound("manager_id", "boss"))
        .bind("boss", 1);
    assert_eq!(engine.query_all(&scope).unwrap(), people(&[2, 3, 4, 5, 6]));
}

#[test]
fn rule_arguments_reach_scopes() {
    let (engine, _) = engine();
    let mut args = Binds::new();
    args.insert("boss".to_string(), Value::Int(2));
    assert_eq!(engine.evaluate("team_size", &person(1), &args).unwrap(), Value::Int(1));

    args.insert("boss".to_string(), Value::Int(1));
    assert_eq!(engine.evaluate("team_size", &person(1), &args).unwrap(), Value::Int(5));
}

#[test]
fn any_and_all_over_to_many() {
    let (engine, _) = engine();
    let with_active_report = Scope::new("Person").with_condition(Condition::any("reports", Condition::eq("active", true)));
    assert_eq!(engine.query_all(&with_active_report).unwrap(), people(&[1]));

    // An empty association satisfies `all`.
    let all_active = Scope::new("Person").with_condition(Condition::all("reports", Condition::eq("active", true)));
    assert_eq!(engine.query_all(&all_active).unwrap(), people(&[3, 4, 5, 6, 7]));
}

#[test]
fn pattern_and_nil_filters() {
    let (engine, _) = engine();
    let odd = Scope::new("Person").with_condition(Condition::matches("name", "^p[35]$"));
    assert_eq!(engine.query_all(&odd).unwrap(), people(&[3, 5]));

    let unflagged = Scope::new("Person").with_condition(Condition::is_nil("active"));
    assert_eq!(engine.query_all(&unflagged).unwrap(), people(&[7]));

    let top = Scope::new("Person").with_condition(Condition::is_nil("manager_id"));
    assert_eq!(engine.query_all(&top).unwrap(), people(&[1]));
}

#[test]
fn query_one_cardinality() {
    let (engine, _) = engine();
    let ada = Scope::new("Person").with_condition(Condition::eq("name", "Ada"));
    assert_eq!(engine.query_one(&ada).unwrap(), Some(person(1)));

    let many = Scope::new("Person").with_condition(Condition::eq("manager_id", 1));
    let err = engine.query_one(&many).unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Generic));

    let nobody = Scope::new("Person").with_condition(Condition::eq("name", "Nobody"));
    let err = engine.query_one(&nobody).unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Generic));
    assert!(matches!(err, RuleError::Evaluation(EvalError::NotFound { .. })));

    let mut ctx = engine.context().unwrap();
    ctx.set_options(EvalOptions::default().with_strict(false)).unwrap();
    assert_eq!(engine.query_one_warm(&mut ctx, &nobody).unwrap(), None);
}

#[test]
fn extra_filters_narrow_queries() {
    let (engine, _) = engine_with(EvalOptions::default().with_extra_filter(Condition::eq("active", true)));
    let reports_of_ada = Scope::new("Person").with_condition(Condition::eq("manager_id", 1));
    assert_eq!(engine.query_all(&reports_of_ada).unwrap(), people(&[2, 4, 6]));
}

#[test]
fn extra_filters_guard_evaluation() {
    let options = EvalOptions::default()
        .with_strict(false)
        .with_extra_filter(Condition::eq("active", true));
    let (engine, _) = engine_with(options);

    assert_eq!(engine.evaluate("name", &person(2), &Binds::new()).unwrap(), Value::from("p2"));
    assert_eq!(engine.evaluate("name", &person(3), &Binds::new()).unwrap(), Value::Null);

    let names = engine
        .evaluate_all("name", &people(&[2, 3, 4]), &Binds::new())
        .unwrap();
    assert_eq!(names, vec![Value::from("p2"), Value::Null, Value::from("p4")]);
}

#[test]
fn strict_guard_failure_is_not_found() {
    let (engine, _) = engine_with(EvalOptions::default().with_extra_filter(Condition::eq("active", true)));
    let err = engine.evaluate("name", &person(3), &Binds::new()).unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Generic));
    assert!(matches!(err, RuleError::Evaluation(EvalError::NotFound { .. })));
}

#[test]
fn warm_context_reuses_query_results() {
    let (engine, store) = engine();
    let scope = Scope::new("Person").with_condition(Condition::eq("active", false));
    let mut ctx = engine.context().unwrap();

    let first = engine.query_all_warm(&mut ctx, &scope).unwrap();
    let second = engine.query_all_warm(&mut ctx, &scope).unwrap();
    assert_eq!(first, people(&[3, 5]));
    assert_eq!(first, second);
    assert_eq!(store.fetch_count().unwrap(), 1);
}

#[test]
fn unknown_queryable_is_a_store_error() {
    let (engine, _) = engine();
    let err = engine.query_all(&Scope::new("Ghost")).unwrap_err();
    assert!(!err.is_validation());
    assert!(!err.is_retryable());
}

#[test]
fn filter_and_reject_batch_across_subjects() {
    let (engine, store) = engine();
    let active = Condition::eq("active", true);
    let everyone = people(&[1, 2, 3, 4, 5, 6, 7]);

    assert_eq!(engine.filter(&active, &everyone, &Binds::new()).unwrap(), people(&[1, 2, 4, 6]));
    assert_eq!(store.fetch_count().unwrap(), 1);

    // 7 has no flag, so it is not active.
    assert_eq!(engine.reject(&active, &everyone, &Binds::new()).unwrap(), people(&[3, 5, 7]));

    store.reset_log().unwrap();
    let under_ada = Condition::eq("manager.name", "Ada");
    assert_eq!(engine.filter(&under_ada, &people(&[2, 7, 3]), &Binds::new()).unwrap(), people(&[2, 3]));
    // One fetch loads all three subjects with their managers preloaded.
    assert_eq!(store.fetch_count().unwrap(), 1);
}

#[test]
fn filter_respects_extra_filters_and_binds() {
    let (engine, _) = engine_with(EvalOptions::default().with_extra_filter(Condition::eq("active", true)));
    let under = Condition::eq_bound("manager_id", "boss");
    let mut args = Binds::new();
    args.insert("boss".to_string(), Value::Int(1));

    let candidates = people(&[1, 2, 3, 4, 7]);
    assert_eq!(engine.filter(&under, &candidates, &args).unwrap(), people(&[2, 4]));
    assert_eq!(engine.reject(&under, &candidates, &args).unwrap(), people(&[1]));

    assert!(engine.filter(&under, &candidates, &Binds::new()).is_err());
    let bad = Condition::matches("name", "(");
    assert!(engine.filter(&bad, &candidates, &args).unwrap_err().is_validation());
}

#[test]
fn load_pairs_subjects_with_values() {
    let (engine, _) = engine();
    let loaded = engine.load("name", &people(&[1, 2]), &Binds::new()).unwrap();
    assert_eq!(loaded, vec![(person(1), Value::from("Ada")), (person(2), Value::from("p2"))]);

    let (guarded, _) = engine_with(EvalOptions::default().with_extra_filter(Condition::eq("active", true)));
    let err = guarded.load("name", &people(&[2, 3]), &Binds::new()).unwrap_err();
    assert!(matches!(err, RuleError::Evaluation(EvalError::NotFound { .. })));

    let mut ctx = guarded.context().unwrap();
    ctx.set_options(
        EvalOptions::default()
            .with_strict(false)
            .with_extra_filter(Condition::eq("active", true)),
    )
    .unwrap();
    let loaded = guarded.load_warm(&mut ctx, "name", &people(&[2, 3]), &Binds::new()).unwrap();
    assert_eq!(loaded, vec![(person(2), Value::from("p2")), (person(3), Value::Null)]);
}
