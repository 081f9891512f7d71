//! Physical persistence contract.
//!
//! A [`Store`] performs the row-level work of a repository on a backend
//! [`Handle`]. It knows nothing about events, snapshots or transactions: the
//! unit of work decides which handle it runs on and what happens around it.

use async_trait::async_trait;

use crate::{backend::Handle, diff::AggregateDiff, error::BoxError};

pub mod inmemory;

/// Row operations for aggregates of type `A`.
#[async_trait]
pub trait Store<A>: Send + Sync {
    /// Persist `aggregate`. `diff` describes what changed since it was loaded;
    /// it is empty for new aggregates and for non-root aggregates.
    async fn save(
        &self,
        handle: &dyn Handle,
        aggregate: &A,
        diff: &AggregateDiff,
    ) -> Result<(), BoxError>;

    /// Load the aggregate with identity `id`, or `None` if there is none.
    async fn find(&self, handle: &dyn Handle, id: i64) -> Result<Option<A>, BoxError>;

    async fn remove(&self, handle: &dyn Handle, aggregate: &A) -> Result<(), BoxError>;
}
