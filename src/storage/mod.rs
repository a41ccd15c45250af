//! Storage backends for kyrorules.
//!
//! [`Store`] is the contract the resolution loop fetches through;
//! [`InMemoryStore`] implements it over plain tables for tests and embedding.

mod memory;
mod traits;

pub use memory::{Association, InMemoryStore};
pub use traits::{Store, StoreError};
