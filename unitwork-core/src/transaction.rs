//! Transaction propagation.
//!
//! [`TransactionManager`] runs a body inside a transaction according to a
//! [`Propagation`] policy, threading the transaction through the body's
//! [`Context`]:
//!
//! | Policy | Already in a transaction | Not in a transaction |
//! |---|---|---|
//! | `Required` | join it as a child session | begin a new one |
//! | `RequiresNew` | begin an independent one | begin a new one |
//! | `Nested` | join it behind a savepoint | begin a new one |
//! | `Never` | fail with [`TransactionError::InTransaction`] | run without one |
//!
//! A body that returns an error or panics triggers the rollback that belongs
//! to its policy before the error is returned or the panic resumes. Only the
//! root of a transaction commits.

use std::{any::Any, borrow::Cow, future::Future, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    backend::{Handle, HandleFactory},
    context::{Context, TransactionContext},
    error::BoxError,
    registry::{Component, Registry},
};

/// Registry name of the transaction manager.
pub const TRANSACTION_MANAGER_NAME: &str = "unitwork:core:TransactionManager";

/// Errors raised by transaction management.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("not in transaction, can't commit")]
    NotInTransaction,
    #[error("never propagation should not in transaction")]
    InTransaction,
    #[error("unsupported propagation `{0}`")]
    UnsupportedPropagation(i8),
    #[error("transaction backend error: {0}")]
    Backend(#[source] BoxError),
}

/// How a transactional call relates to a transaction already in scope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Propagation {
    /// Join the current transaction, or begin one.
    #[default]
    Required,
    /// Always begin an independent transaction on a fresh connection.
    RequiresNew,
    /// Join the current transaction behind a savepoint, or begin one.
    Nested,
    /// Refuse to run inside a transaction.
    Never,
}

impl TryFrom<i8> for Propagation {
    type Error = TransactionError;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Required),
            1 => Ok(Self::RequiresNew),
            2 => Ok(Self::Nested),
            3 => Ok(Self::Never),
            other => Err(TransactionError::UnsupportedPropagation(other)),
        }
    }
}

impl From<Propagation> for i8 {
    fn from(propagation: Propagation) -> Self {
        match propagation {
            Propagation::Required => 0,
            Propagation::RequiresNew => 1,
            Propagation::Nested => 2,
            Propagation::Never => 3,
        }
    }
}

type Panic = Box<dyn Any + Send>;

/// Runs bodies inside transactions obtained from a [`HandleFactory`].
pub struct TransactionManager {
    factory: Arc<dyn HandleFactory>,
    default_propagation: Propagation,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("default_propagation", &self.default_propagation)
            .finish_non_exhaustive()
    }
}

impl Component for TransactionManager {
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed(TRANSACTION_MANAGER_NAME)
    }
}

impl TransactionManager {
    pub fn new(factory: impl HandleFactory + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
            default_propagation: Propagation::default(),
        }
    }

    /// The registry-wide manager. `factory` is only used on first access.
    pub fn shared(registry: &Registry, factory: impl HandleFactory + 'static) -> Arc<Self> {
        registry.load_or_store(TRANSACTION_MANAGER_NAME, || Self::new(factory))
    }

    /// Policy used by [`TransactionManager::transaction`].
    #[must_use]
    pub const fn with_default_propagation(mut self, propagation: Propagation) -> Self {
        self.default_propagation = propagation;
        self
    }

    #[must_use]
    pub const fn default_propagation(&self) -> Propagation {
        self.default_propagation
    }

    /// Run `body` under the default propagation policy.
    ///
    /// # Errors
    ///
    /// Returns the body's error, or a [`TransactionError`] converted into
    /// `E` when the transaction cannot be started or committed.
    pub async fn transaction<F, Fut, T, E>(&self, ctx: &Context, body: F) -> Result<T, E>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError>,
    {
        self.transaction_with(ctx, self.default_propagation, body)
            .await
    }

    /// Run `body` under `propagation`.
    ///
    /// `body` receives the context it must use for every call that should
    /// take part in the transaction.
    ///
    /// # Errors
    ///
    /// Same as [`TransactionManager::transaction`]; additionally
    /// [`TransactionError::InTransaction`] for [`Propagation::Never`] inside a
    /// transaction, in which case `body` does not run.
    pub async fn transaction_with<F, Fut, T, E>(
        &self,
        ctx: &Context,
        propagation: Propagation,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError>,
    {
        match propagation {
            Propagation::Never => self.never(ctx, body).await,
            Propagation::Nested => self.nested(ctx, body).await,
            Propagation::Required => self.required(ctx, body).await,
            Propagation::RequiresNew => self.requires_new(ctx, body).await,
        }
    }

    async fn never<F, Fut, T, E>(&self, ctx: &Context, body: F) -> Result<T, E>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError>,
    {
        if ctx.in_transaction() {
            return Err(TransactionError::InTransaction.into());
        }
        body(ctx.clone()).await
    }

    async fn required<F, Fut, T, E>(&self, ctx: &Context, body: F) -> Result<T, E>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError>,
    {
        let Some(current) = ctx.transaction().filter(|tx| tx.in_transaction()) else {
            return self.begin_and_run(ctx, ctx, body).await;
        };

        tracing::debug!(depth = current.depth() + 1, "joining transaction");
        let session = ctx.with_transaction(current.session());
        match guarded(body(session)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                rollback(current).await;
                Err(err)
            }
            Err(panic) => {
                rollback(current).await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    async fn requires_new<F, Fut, T, E>(&self, ctx: &Context, body: F) -> Result<T, E>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError>,
    {
        self.begin_and_run(&ctx.detached(), ctx, body).await
    }

    async fn nested<F, Fut, T, E>(&self, ctx: &Context, body: F) -> Result<T, E>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError>,
    {
        let Some(current) = ctx.transaction().filter(|tx| tx.in_transaction()) else {
            return self.required(ctx, body).await;
        };

        let handle = current.handle();
        let savepoint = if handle.nested_transactions_disabled() {
            None
        } else {
            let name = savepoint_name();
            handle
                .savepoint(&name)
                .await
                .map_err(TransactionError::Backend)?;
            tracing::debug!(savepoint = %name, "savepoint created");
            Some(name)
        };

        let session = ctx.with_transaction(current.session());
        let outcome = guarded(body(session)).await;
        let failed = !matches!(outcome, Ok(Ok(_)));
        if failed && let Some(name) = &savepoint {
            rollback_to_savepoint(&**handle, name).await;
        }
        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Begin a transaction on a write handle looked up with `lookup_ctx` and
    /// run `body` as its root.
    async fn begin_and_run<F, Fut, T, E>(
        &self,
        lookup_ctx: &Context,
        ctx: &Context,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError>,
    {
        let connection = self
            .factory
            .lookup_write_handle(lookup_ctx)
            .await
            .map_err(TransactionError::Backend)?;
        let handle = connection
            .begin()
            .await
            .map_err(TransactionError::Backend)?;
        tracing::debug!("transaction started");

        let root = TransactionContext::root(handle);
        match guarded(body(ctx.with_transaction(root.clone()))).await {
            Ok(Ok(value)) => match root.commit().await {
                Ok(()) => Ok(value),
                Err(err) => {
                    rollback(&root).await;
                    Err(err.into())
                }
            },
            Ok(Err(err)) => {
                rollback(&root).await;
                Err(err)
            }
            Err(panic) => {
                rollback(&root).await;
                std::panic::resume_unwind(panic)
            }
        }
    }
}

/// Await `body`, catching a panic instead of unwinding through the caller.
async fn guarded<Fut: Future>(body: Fut) -> Result<Fut::Output, Panic> {
    AssertUnwindSafe(body).catch_unwind().await
}

/// Roll back, logging rather than returning a failure: the caller is already
/// propagating an error or a panic.
async fn rollback(transaction: &TransactionContext) {
    if let Err(err) = transaction.rollback().await {
        tracing::error!(%err, "transaction rollback failed");
    }
}

async fn rollback_to_savepoint(handle: &dyn Handle, name: &str) {
    match handle.rollback_to_savepoint(name).await {
        Ok(()) => tracing::debug!(savepoint = name, "rolled back to savepoint"),
        Err(err) => tracing::error!(%err, savepoint = name, "rollback to savepoint failed"),
    }
}

fn savepoint_name() -> String {
    format!("sp_{}", Uuid::new_v4().simple())
}
