//! Backend contracts.
//!
//! The unit of work never talks to storage directly. It asks a
//! [`HandleFactory`] for a connection [`Handle`], begins transactions on it
//! and hands the resulting handle to whatever store performs the physical
//! reads and writes.
//!
//! [`inmemory::Database`] is a complete in-process backend suitable for tests
//! and prototypes; `unitwork-postgres` provides the production one.

use std::{any::Any, fmt, sync::Arc};

use async_trait::async_trait;

use crate::{context::Context, error::BoxError};

pub mod inmemory;

/// A connection or transaction on a backend.
#[async_trait]
pub trait Handle: Any + fmt::Debug + Send + Sync {
    /// Start a transaction, returning the transactional handle.
    async fn begin(&self) -> Result<Arc<dyn Handle>, BoxError>;

    async fn commit(&self) -> Result<(), BoxError>;

    async fn rollback(&self) -> Result<(), BoxError>;

    async fn savepoint(&self, name: &str) -> Result<(), BoxError>;

    async fn rollback_to_savepoint(&self, name: &str) -> Result<(), BoxError>;

    /// Backends without savepoint support return `true`; nested propagation
    /// then runs without a savepoint.
    fn nested_transactions_disabled(&self) -> bool {
        false
    }

    /// `true` for a transactional handle that has not ended yet.
    fn in_transaction(&self) -> bool;
}

impl dyn Handle {
    pub fn as_any(&self) -> &dyn Any {
        self
    }

    /// The concrete handle, for stores bound to a specific backend.
    pub fn downcast_ref<T: Handle>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }
}

/// Hands out connection handles.
#[async_trait]
pub trait HandleFactory: Send + Sync {
    /// A handle suitable for reads; may point at a replica.
    async fn lookup_read_handle(&self, ctx: &Context) -> Result<Arc<dyn Handle>, BoxError>;

    /// A handle on the primary.
    async fn lookup_write_handle(&self, ctx: &Context) -> Result<Arc<dyn Handle>, BoxError>;
}

#[async_trait]
impl<F: HandleFactory + ?Sized> HandleFactory for Arc<F> {
    async fn lookup_read_handle(&self, ctx: &Context) -> Result<Arc<dyn Handle>, BoxError> {
        (**self).lookup_read_handle(ctx).await
    }

    async fn lookup_write_handle(&self, ctx: &Context) -> Result<Arc<dyn Handle>, BoxError> {
        (**self).lookup_write_handle(ctx).await
    }
}
