//! Runs the fetches of one pass.
//!
//! Fetch specs of a pass are independent, so with more than one worker they
//! run on scoped threads fed through a bounded crossbeam channel. Results are
//! put back in spec order; the first failing spec in that order decides the
//! error.

use std::thread;

use crossbeam_channel::{bounded, unbounded};

use crate::batch::FetchSpec;
use crate::record::Record;
use crate::storage::{Store, StoreError};

type FetchResult = Result<Vec<Record>, StoreError>;

pub(crate) fn fetch_all(store: &dyn Store, specs: &[FetchSpec], workers: usize) -> Result<Vec<Vec<Record>>, StoreError> {
    if workers <= 1 || specs.len() <= 1 {
        return store.fetch_many(specs);
    }
    let workers = workers.min(specs.len());

    let (job_tx, job_rx) = bounded::<(usize, &FetchSpec)>(specs.len());
    let (result_tx, result_rx) = unbounded::<(usize, FetchResult)>();
    for job in specs.iter().enumerate() {
        job_tx
            .send(job)
            .map_err(|_| StoreError::Backend("fetch queue closed".to_string()))?;
    }
    drop(job_tx);

    let spawned: Result<(), StoreError> = thread::scope(|scope| {
        for idx in 0..workers {
            let rx = job_rx.clone();
            let tx = result_tx.clone();
            thread::Builder::new()
                .name(format!("kyrorules-fetch-{idx}"))
                .spawn_scoped(scope, move || {
                    for (i, spec) in rx.iter() {
                        if tx.send((i, store.fetch(spec))).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|e| StoreError::Backend(format!("failed to spawn fetch worker: {e}")))?;
        }
        Ok(())
    });
    drop(result_tx);

    let mut slots: Vec<Option<FetchResult>> = (0..specs.len()).map(|_| None).collect();
    for (i, result) in result_rx.try_iter() {
        if let Some(slot) = slots.get_mut(i) {
            *slot = Some(result);
        }
    }

    let mut out = Vec::with_capacity(specs.len());
    for slot in slots {
        match slot {
            Some(Ok(records)) => out.push(records),
            Some(Err(e)) => return Err(e),
            None => {
                spawned?;
                return Err(StoreError::Backend("fetch worker dropped a job".to_string()));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::condition::Condition;
    use crate::record::{Queryable, SubjectRef};
    use crate::value::Key;

    /// Returns one record per spec, keyed by the first key of the spec.
    #[derive(Default)]
    struct Echo {
        calls: AtomicUsize,
    }

    impl Store for Echo {
        fn fetch(&self, spec: &FetchSpec) -> Result<Vec<Record>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match spec.keys().and_then(|k| k.first()) {
                Some(Key::Int(-1)) => Err(StoreError::Backend("boom".to_string())),
                Some(key) => Ok(vec![Record::new(SubjectRef::new(spec.queryable.clone(), key.clone()))]),
                None => Ok(Vec::new()),
            }
        }
    }

    fn spec(key: i64) -> FetchSpec {
        FetchSpec::new(Queryable::from("Person"), Condition::key_in(vec![Key::Int(key)]), Vec::new())
    }

    #[test]
    fn test_parallel_results_keep_spec_order() {
        let store = Echo::default();
        let specs: Vec<FetchSpec> = (1..=8).map(spec).collect();
        let results = fetch_all(&store, &specs, 4).unwrap();
        let keys: Vec<Key> = results.iter().map(|r| r[0].subject.key.clone()).collect();
        assert_eq!(keys, (1..=8).map(Key::Int).collect::<Vec<_>>());
        assert_eq!(store.calls.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_sequential_when_single_worker() {
        let store = Echo::default();
        let results = fetch_all(&store, &[spec(1), spec(2)], 1).unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_first_error_in_spec_order() {
        let store = Echo::default();
        let specs = vec![spec(1), spec(-1), spec(3)];
        let err = fetch_all(&store, &specs, 3).unwrap_err();
        assert_eq!(err, StoreError::Backend("boom".to_string()));
    }
}
