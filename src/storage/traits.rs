//! Abstract storage trait for kyrorules.
//!
//! The evaluation engine never talks to a database directly; it hands merged
//! [`FetchSpec`]s to a [`Store`] and caches whatever records come back.

use thiserror::Error;

use crate::batch::FetchSpec;
use crate::record::Record;

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The queryable is not known to the store.
    #[error("Unknown queryable: {0}")]
    UnknownQueryable(String),

    /// A preload path names an association the store does not know.
    #[error("Unknown association '{association}' on {queryable}")]
    UnknownPath {
        queryable: String,
        association: String,
    },

    /// Backend error.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// A source of records.
///
/// Each call returns, for every subject matching the spec's filter, a record
/// with all scalar fields and the requested association paths preloaded.
/// Subjects that do not exist are simply absent from the result.
pub trait Store: Send + Sync {
    /// Executes one fetch.
    fn fetch(&self, spec: &FetchSpec) -> Result<Vec<Record>, StoreError>;

    /// Executes several fetches, returning results in the same order.
    ///
    /// The default runs them one after another; backends that can pipeline
    /// requests should override it.
    fn fetch_many(&self, specs: &[FetchSpec]) -> Result<Vec<Vec<Record>>, StoreError> {
        specs.iter().map(|spec| self.fetch(spec)).collect()
    }
}
