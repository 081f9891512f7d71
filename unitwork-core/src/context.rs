//! Call context.
//!
//! A [`Context`] travels with every call into the unit of work. It carries a
//! cancellation token, an optional deadline, a bag of string-keyed values and
//! the [`TransactionScope`] the call runs in. Contexts are cheap to clone and
//! immutable: the `with_*` methods return a derived context.
//!
//! Whether a call is transactional is a capability of its scope, not a
//! property discovered by inspecting the context: outside a transaction the
//! scope is [`NotTransactional`], inside one it is a [`TransactionContext`].

use std::{any::Any, collections::HashMap, fmt, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{backend::Handle, transaction::TransactionError};

/// Why a context stopped being usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context cancelled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Whether, and in which transaction, a call runs.
pub trait TransactionScope: fmt::Debug + Send + Sync {
    /// The transaction node, if the scope is transactional.
    fn as_transaction(&self) -> Option<&TransactionContext>;

    fn in_transaction(&self) -> bool {
        self.as_transaction()
            .is_some_and(TransactionContext::in_transaction)
    }
}

/// The scope of calls made outside any transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotTransactional;

impl TransactionScope for NotTransactional {
    fn as_transaction(&self) -> Option<&TransactionContext> {
        None
    }
}

/// A node in the tree of sessions sharing one backend transaction.
///
/// The root node owns the physical transaction: only it issues the commit.
/// Child nodes are sessions derived for nested calls; committing one is a
/// no-op that defers to the root.
#[derive(Clone)]
pub struct TransactionContext {
    handle: Arc<dyn Handle>,
    parent: Option<Arc<TransactionContext>>,
}

impl TransactionContext {
    /// A root node over a freshly begun transaction handle.
    #[must_use]
    pub fn root(handle: Arc<dyn Handle>) -> Self {
        Self {
            handle,
            parent: None,
        }
    }

    /// A child session bound to the same transaction.
    #[must_use]
    pub fn session(&self) -> Self {
        Self {
            handle: Arc::clone(&self.handle),
            parent: Some(Arc::new(self.clone())),
        }
    }

    #[must_use]
    pub fn handle(&self) -> &Arc<dyn Handle> {
        &self.handle
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Self> {
        self.parent.as_deref()
    }

    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Number of ancestors between this node and the root.
    #[must_use]
    pub fn depth(&self) -> usize {
        std::iter::successors(self.parent(), |node| node.parent()).count()
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.handle.in_transaction()
    }

    /// Commit the transaction if this node is the root.
    ///
    /// # Errors
    ///
    /// [`TransactionError::NotInTransaction`] if the transaction is no longer
    /// active, or the backend's commit failure.
    pub async fn commit(&self) -> Result<(), TransactionError> {
        if !self.in_transaction() {
            return Err(TransactionError::NotInTransaction);
        }
        if !self.is_root() {
            return Ok(());
        }
        self.handle
            .commit()
            .await
            .map_err(TransactionError::Backend)?;
        tracing::debug!("transaction committed");
        Ok(())
    }

    /// Roll back the whole transaction. Does nothing once it has ended.
    ///
    /// # Errors
    ///
    /// Returns the backend's rollback failure.
    pub async fn rollback(&self) -> Result<(), TransactionError> {
        if !self.in_transaction() {
            return Ok(());
        }
        self.handle
            .rollback()
            .await
            .map_err(TransactionError::Backend)?;
        tracing::debug!(depth = self.depth(), "transaction rolled back");
        Ok(())
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("handle", &self.handle)
            .field("root", &self.is_root())
            .field("depth", &self.depth())
            .finish()
    }
}

impl TransactionScope for TransactionContext {
    fn as_transaction(&self) -> Option<&TransactionContext> {
        Some(self)
    }
}

type Value = Arc<dyn Any + Send + Sync>;

/// Cancellation, deadline, values and transaction scope of a call.
#[derive(Clone)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    values: Arc<HashMap<String, Value>>,
    scope: Arc<dyn TransactionScope>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.values.keys().map(String::as_str).collect();
        keys.sort_unstable();
        f.debug_struct("Context")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("deadline", &self.deadline)
            .field("values", &keys)
            .field("scope", &self.scope)
            .finish()
    }
}

impl Context {
    /// An empty, never-cancelled, non-transactional context.
    #[must_use]
    pub fn background() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
            values: Arc::default(),
            scope: Arc::new(NotTransactional),
        }
    }

    /// Replace the cancellation token.
    #[must_use]
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            cancel: token,
            ..self.clone()
        }
    }

    /// A context cancelled together with this one, and independently through
    /// the returned token.
    #[must_use]
    pub fn child_cancellation(&self) -> (Self, CancellationToken) {
        let token = self.cancel.child_token();
        (self.with_cancellation(token.clone()), token)
    }

    /// Set a deadline. An earlier existing deadline is kept.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = self.deadline.map_or(deadline, |current| current.min(deadline));
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    #[must_use]
    pub fn with_value<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) -> Self {
        let mut values = HashMap::clone(&self.values);
        values.insert(key.into(), Arc::new(value));
        Self {
            values: Arc::new(values),
            ..self.clone()
        }
    }

    /// The value stored under `key`, if it is a `T`.
    #[must_use]
    pub fn value<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key)?.downcast_ref()
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.cancel.cancelled() => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }

    /// # Errors
    ///
    /// Returns why the context is no longer usable, if it is not.
    pub fn check(&self) -> Result<(), ContextError> {
        if self.cancel.is_cancelled() {
            return Err(ContextError::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(ContextError::DeadlineExceeded);
        }
        Ok(())
    }

    #[must_use]
    pub fn scope(&self) -> &Arc<dyn TransactionScope> {
        &self.scope
    }

    /// The transaction node the call runs in, if any.
    #[must_use]
    pub fn transaction(&self) -> Option<&TransactionContext> {
        self.scope.as_transaction()
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.scope.in_transaction()
    }

    /// This context bound to `transaction`.
    #[must_use]
    pub fn with_transaction(&self, transaction: TransactionContext) -> Self {
        self.with_scope(Arc::new(transaction))
    }

    #[must_use]
    pub fn with_scope(&self, scope: Arc<dyn TransactionScope>) -> Self {
        Self {
            scope,
            ..self.clone()
        }
    }

    /// This context with its transaction association dropped.
    ///
    /// Cancellation, deadline and values are kept.
    #[must_use]
    pub fn detached(&self) -> Self {
        self.with_scope(Arc::new(NotTransactional))
    }
}
