//! JSON row store over the in-memory backend.
//!
//! Each aggregate is serialized with `serde_json` into one row of a named
//! table, keyed by its identity.
//!
//! # Example
//!
//! ```
//! use unitwork_core::store::inmemory;
//!
//! # #[derive(serde::Serialize, serde::Deserialize)]
//! # struct Order { id: i64 }
//! let store: inmemory::Store<Order> = inmemory::Store::new("orders");
//! assert_eq!(store.table(), "orders");
//! ```

use std::{fmt, marker::PhantomData};

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    aggregate::Aggregate,
    backend::{Handle, inmemory::DbHandle},
    diff::AggregateDiff,
    error::BoxError,
};

/// Stores aggregates of type `A` in one table of a
/// [`Database`](crate::backend::inmemory::Database).
pub struct Store<A> {
    table: String,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A> fmt::Debug for Store<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").field("table", &self.table).finish()
    }
}

impl<A> Store<A> {
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            _aggregate: PhantomData,
        }
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }
}

fn rows(handle: &dyn Handle) -> Result<&DbHandle, BoxError> {
    handle
        .downcast_ref::<DbHandle>()
        .ok_or_else(|| format!("expected an in-memory handle, got {handle:?}").into())
}

#[async_trait]
impl<A> super::Store<A> for Store<A>
where
    A: Aggregate + Serialize + DeserializeOwned,
{
    async fn save(
        &self,
        handle: &dyn Handle,
        aggregate: &A,
        diff: &AggregateDiff,
    ) -> Result<(), BoxError> {
        let row = serde_json::to_value(aggregate)?;
        rows(handle)?.put(&self.table, aggregate.aggregate_id(), row)?;
        tracing::trace!(
            table = %self.table,
            id = aggregate.aggregate_id(),
            groups = ?diff.groups().collect::<Vec<_>>(),
            "row saved"
        );
        Ok(())
    }

    async fn find(&self, handle: &dyn Handle, id: i64) -> Result<Option<A>, BoxError> {
        let Some(row) = rows(handle)?.get(&self.table, id) else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(row)?))
    }

    async fn remove(&self, handle: &dyn Handle, aggregate: &A) -> Result<(), BoxError> {
        rows(handle)?.delete(&self.table, aggregate.aggregate_id())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::{
        backend::{HandleFactory, inmemory::Database},
        context::Context,
        store::Store as _,
    };

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: i64,
        text: String,
    }

    impl Aggregate for Note {
        fn aggregate_id(&self) -> i64 {
            self.id
        }
    }

    #[tokio::test]
    async fn rows_round_trip_through_json() {
        let database = Database::new();
        let handle = database
            .lookup_write_handle(&Context::background())
            .await
            .unwrap();
        let store = Store::<Note>::new("notes");
        let note = Note {
            id: 3,
            text: "hi".into(),
        };

        store
            .save(handle.as_ref(), &note, &AggregateDiff::empty())
            .await
            .unwrap();
        assert_eq!(store.find(handle.as_ref(), 3).await.unwrap(), Some(note));
        assert_eq!(store.find(handle.as_ref(), 4).await.unwrap(), None);

        let stored = Note {
            id: 3,
            text: String::new(),
        };
        store.remove(handle.as_ref(), &stored).await.unwrap();
        assert!(database.rows("notes").is_empty());
    }

    #[derive(Debug)]
    struct Foreign;

    #[async_trait]
    impl Handle for Foreign {
        async fn begin(&self) -> Result<std::sync::Arc<dyn Handle>, BoxError> {
            Err("unsupported".into())
        }

        async fn commit(&self) -> Result<(), BoxError> {
            Ok(())
        }

        async fn rollback(&self) -> Result<(), BoxError> {
            Ok(())
        }

        async fn savepoint(&self, _name: &str) -> Result<(), BoxError> {
            Ok(())
        }

        async fn rollback_to_savepoint(&self, _name: &str) -> Result<(), BoxError> {
            Ok(())
        }

        fn in_transaction(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn foreign_handles_are_rejected() {
        let store = Store::<Note>::new("notes");
        let err = store.find(&Foreign, 1).await.unwrap_err();
        assert!(err.to_string().contains("in-memory handle"));
    }
}
