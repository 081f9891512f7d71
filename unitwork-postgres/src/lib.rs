//! `PostgreSQL` backend for unitwork.
//!
//! - [`Database`] - a [`HandleFactory`] over a `sqlx` connection pool; its
//!   handles begin real transactions and map nested propagation onto
//!   `SAVEPOINT` / `ROLLBACK TO SAVEPOINT`
//! - [`JsonStore`] - a [`Store`](unitwork_core::store::Store) keeping one
//!   `jsonb` row per aggregate
//!
//! Both share the pool the application hands to [`Database::new`].

mod error;
mod store;

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
pub use error::Error;
use sqlx::{
    PgPool, Postgres,
    postgres::{PgArguments, PgQueryResult, PgRow},
    query::Query,
};
pub use store::JsonStore;
use tokio::sync::Mutex;
use unitwork_core::{
    backend::{Handle, HandleFactory},
    context::Context,
    error::BoxError,
};

use crate::error::check_identifier;

/// A query with its arguments bound, ready to run on a [`PgHandle`].
pub type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// Hands out [`PgHandle`]s over one pool.
///
/// Reads and writes go to the same pool; point a second `Database` at a
/// replica pool if reads should be split.
#[derive(Clone, Debug)]
pub struct Database {
    pool: PgPool,
    nested_disabled: bool,
}

impl Database {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self {
            pool,
            nested_disabled: false,
        }
    }

    /// Nested propagation joins the outer transaction without a savepoint.
    #[must_use]
    pub const fn without_nested_transactions(mut self) -> Self {
        self.nested_disabled = true;
        self
    }

    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn connection(&self) -> Arc<dyn Handle> {
        Arc::new(PgHandle {
            pool: self.pool.clone(),
            tx: None,
            nested_disabled: self.nested_disabled,
        })
    }
}

#[async_trait]
impl HandleFactory for Database {
    async fn lookup_read_handle(&self, _ctx: &Context) -> Result<Arc<dyn Handle>, BoxError> {
        Ok(self.connection())
    }

    async fn lookup_write_handle(&self, _ctx: &Context) -> Result<Arc<dyn Handle>, BoxError> {
        Ok(self.connection())
    }
}

struct PgTransaction {
    inner: Mutex<Option<sqlx::Transaction<'static, Postgres>>>,
    active: AtomicBool,
}

/// A pooled connection, or a transaction begun on one.
///
/// Queries run through [`PgHandle::execute`] and [`PgHandle::fetch_optional`]
/// go to the transaction when there is one and to the pool otherwise.
pub struct PgHandle {
    pool: PgPool,
    tx: Option<PgTransaction>,
    nested_disabled: bool,
}

impl fmt::Debug for PgHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgHandle")
            .field("transactional", &self.tx.is_some())
            .field("active", &self.in_transaction())
            .finish_non_exhaustive()
    }
}

impl PgHandle {
    /// Run a statement.
    ///
    /// # Errors
    ///
    /// Query failures, or [`Error::TransactionEnded`] on a transaction handle
    /// that has been committed or rolled back.
    pub async fn execute(&self, query: PgQuery<'_>) -> Result<PgQueryResult, Error> {
        match &self.tx {
            None => Ok(query.execute(&self.pool).await?),
            Some(tx) => {
                let mut guard = tx.inner.lock().await;
                let conn = guard.as_mut().ok_or(Error::TransactionEnded)?;
                Ok(query.execute(&mut **conn).await?)
            }
        }
    }

    /// Run a query returning at most one row.
    ///
    /// # Errors
    ///
    /// Same as [`PgHandle::execute`].
    pub async fn fetch_optional(&self, query: PgQuery<'_>) -> Result<Option<PgRow>, Error> {
        match &self.tx {
            None => Ok(query.fetch_optional(&self.pool).await?),
            Some(tx) => {
                let mut guard = tx.inner.lock().await;
                let conn = guard.as_mut().ok_or(Error::TransactionEnded)?;
                Ok(query.fetch_optional(&mut **conn).await?)
            }
        }
    }

    async fn raw(&self, sql: &str) -> Result<(), Error> {
        let tx = self.tx.as_ref().ok_or(Error::NoTransaction)?;
        let mut guard = tx.inner.lock().await;
        let conn = guard.as_mut().ok_or(Error::TransactionEnded)?;
        let conn: &mut sqlx::PgConnection = &mut **conn;
        sqlx::Executor::execute(conn, sqlx::raw_sql(sql)).await?;
        Ok(())
    }

    async fn take(&self) -> Result<Option<sqlx::Transaction<'static, Postgres>>, Error> {
        let tx = self.tx.as_ref().ok_or(Error::NoTransaction)?;
        let taken = tx.inner.lock().await.take();
        tx.active.store(false, Ordering::Release);
        Ok(taken)
    }
}

#[async_trait]
impl Handle for PgHandle {
    #[tracing::instrument(skip(self))]
    async fn begin(&self) -> Result<Arc<dyn Handle>, BoxError> {
        if self.tx.is_some() {
            return Err(Error::AlreadyInTransaction.into());
        }
        let tx = self.pool.begin().await.map_err(Error::from)?;
        tracing::debug!("postgres transaction started");
        Ok(Arc::new(Self {
            pool: self.pool.clone(),
            tx: Some(PgTransaction {
                inner: Mutex::new(Some(tx)),
                active: AtomicBool::new(true),
            }),
            nested_disabled: self.nested_disabled,
        }))
    }

    #[tracing::instrument(skip(self))]
    async fn commit(&self) -> Result<(), BoxError> {
        let tx = self.take().await?.ok_or(Error::TransactionEnded)?;
        tx.commit().await.map_err(Error::from)?;
        Ok(())
    }

    /// Rolling back an ended transaction does nothing.
    #[tracing::instrument(skip(self))]
    async fn rollback(&self) -> Result<(), BoxError> {
        if let Some(tx) = self.take().await? {
            tx.rollback().await.map_err(Error::from)?;
        }
        Ok(())
    }

    async fn savepoint(&self, name: &str) -> Result<(), BoxError> {
        if self.nested_disabled {
            return Err(Error::NestedTransactionsDisabled.into());
        }
        check_identifier(name)?;
        self.raw(&format!("SAVEPOINT {name}")).await?;
        tracing::debug!(savepoint = name, "savepoint created");
        Ok(())
    }

    async fn rollback_to_savepoint(&self, name: &str) -> Result<(), BoxError> {
        check_identifier(name)?;
        self.raw(&format!("ROLLBACK TO SAVEPOINT {name}")).await?;
        tracing::debug!(savepoint = name, "rolled back to savepoint");
        Ok(())
    }

    fn nested_transactions_disabled(&self) -> bool {
        self.nested_disabled
    }

    fn in_transaction(&self) -> bool {
        self.tx
            .as_ref()
            .is_some_and(|tx| tx.active.load(Ordering::Acquire))
    }
}
