//! In-memory backend.
//!
//! [`Database`] keeps JSON rows in named tables. Transactions stage their
//! writes in a private log that is applied atomically on commit and discarded
//! on rollback; savepoints mark positions in that log. Reads inside a
//! transaction see the transaction's own staged writes.
//!
//! Every lookup, begin, commit, rollback and savepoint is counted, so tests
//! can assert on what the transaction manager actually did.
//!
//! # Example
//!
//! ```
//! use unitwork_core::backend::inmemory::Database;
//!
//! let database = Database::new();
//! assert_eq!(database.stats().commits, 0);
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use thiserror::Error;

use crate::{
    backend::{Handle, HandleFactory},
    context::Context,
    error::BoxError,
};

type Tables = HashMap<String, BTreeMap<i64, Value>>;

/// Error type for the in-memory backend.
#[derive(Debug, Error)]
pub enum InMemoryError {
    #[error("handle is not transactional")]
    NoTransaction,
    #[error("transaction already in progress on this handle")]
    AlreadyInTransaction,
    #[error("transaction has already ended")]
    TransactionEnded,
    #[error("savepoint `{0}` does not exist")]
    UnknownSavepoint(String),
    #[error("nested transactions are disabled")]
    NestedTransactionsDisabled,
}

/// Operation counters of a [`Database`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub read_lookups: usize,
    pub write_lookups: usize,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub savepoints: usize,
    pub savepoint_rollbacks: usize,
}

#[derive(Default)]
struct Counters {
    read_lookups: AtomicUsize,
    write_lookups: AtomicUsize,
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    savepoints: AtomicUsize,
    savepoint_rollbacks: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Stats {
        Stats {
            read_lookups: self.read_lookups.load(Ordering::Relaxed),
            write_lookups: self.write_lookups.load(Ordering::Relaxed),
            begins: self.begins.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            savepoints: self.savepoints.load(Ordering::Relaxed),
            savepoint_rollbacks: self.savepoint_rollbacks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct Shared {
    tables: RwLock<Tables>,
    counters: Counters,
    nested_disabled: bool,
}

/// In-memory backend and handle factory.
///
/// Cloning is cheap; clones share the same tables and counters.
#[derive(Clone, Default)]
pub struct Database {
    shared: Arc<Shared>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("tables", &self.shared.tables.read().len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Database {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A database whose handles refuse savepoints.
    #[must_use]
    pub fn without_nested_transactions() -> Self {
        Self {
            shared: Arc::new(Shared {
                nested_disabled: true,
                ..Shared::default()
            }),
        }
    }

    #[must_use]
    pub fn stats(&self) -> Stats {
        self.shared.counters.snapshot()
    }

    /// Committed rows of `table`, ordered by id.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<(i64, Value)> {
        self.shared
            .tables
            .read()
            .get(table)
            .map(|rows| rows.iter().map(|(id, row)| (*id, row.clone())).collect())
            .unwrap_or_default()
    }

    fn connection(&self) -> Arc<dyn Handle> {
        Arc::new(DbHandle {
            shared: Arc::clone(&self.shared),
            tx: None,
        })
    }
}

#[async_trait]
impl HandleFactory for Database {
    async fn lookup_read_handle(&self, _ctx: &Context) -> Result<Arc<dyn Handle>, BoxError> {
        Counters::bump(&self.shared.counters.read_lookups);
        Ok(self.connection())
    }

    async fn lookup_write_handle(&self, _ctx: &Context) -> Result<Arc<dyn Handle>, BoxError> {
        Counters::bump(&self.shared.counters.write_lookups);
        Ok(self.connection())
    }
}

enum Write {
    Put { table: String, id: i64, row: Value },
    Delete { table: String, id: i64 },
}

impl Write {
    fn key(&self) -> (&str, i64) {
        match self {
            Self::Put { table, id, .. } | Self::Delete { table, id } => (table.as_str(), *id),
        }
    }

    fn apply(self, tables: &mut Tables) {
        match self {
            Self::Put { table, id, row } => {
                tables.entry(table).or_default().insert(id, row);
            }
            Self::Delete { table, id } => {
                if let Some(rows) = tables.get_mut(&table) {
                    rows.remove(&id);
                }
            }
        }
    }
}

struct TxState {
    log: Vec<Write>,
    savepoints: Vec<(String, usize)>,
    active: bool,
}

/// Connection or transaction handle of a [`Database`].
///
/// Stores downcast a `&dyn Handle` to this type to reach the row API.
pub struct DbHandle {
    shared: Arc<Shared>,
    tx: Option<Mutex<TxState>>,
}

impl fmt::Debug for DbHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbHandle")
            .field("transactional", &self.tx.is_some())
            .field("active", &self.in_transaction())
            .finish()
    }
}

impl DbHandle {
    /// Insert or replace a row.
    ///
    /// # Errors
    ///
    /// Fails on a transaction handle whose transaction has ended.
    pub fn put(&self, table: &str, id: i64, row: Value) -> Result<(), InMemoryError> {
        self.write(Write::Put {
            table: table.to_string(),
            id,
            row,
        })
    }

    /// Delete a row. Deleting a missing row is not an error.
    ///
    /// # Errors
    ///
    /// Fails on a transaction handle whose transaction has ended.
    pub fn delete(&self, table: &str, id: i64) -> Result<(), InMemoryError> {
        self.write(Write::Delete {
            table: table.to_string(),
            id,
        })
    }

    /// Read a row, seeing this transaction's staged writes.
    #[must_use]
    pub fn get(&self, table: &str, id: i64) -> Option<Value> {
        if let Some(tx) = &self.tx {
            let state = tx.lock();
            let staged = state.log.iter().rev().find(|w| w.key() == (table, id));
            match staged {
                Some(Write::Put { row, .. }) => return Some(row.clone()),
                Some(Write::Delete { .. }) => return None,
                None => {}
            }
        }
        self.shared.tables.read().get(table)?.get(&id).cloned()
    }

    fn write(&self, write: Write) -> Result<(), InMemoryError> {
        match &self.tx {
            None => {
                write.apply(&mut self.shared.tables.write());
                Ok(())
            }
            Some(tx) => {
                let mut state = tx.lock();
                if !state.active {
                    return Err(InMemoryError::TransactionEnded);
                }
                state.log.push(write);
                Ok(())
            }
        }
    }

    fn active_tx(&self) -> Result<parking_lot::MutexGuard<'_, TxState>, InMemoryError> {
        let tx = self.tx.as_ref().ok_or(InMemoryError::NoTransaction)?;
        let state = tx.lock();
        if state.active {
            Ok(state)
        } else {
            Err(InMemoryError::TransactionEnded)
        }
    }
}

#[async_trait]
impl Handle for DbHandle {
    async fn begin(&self) -> Result<Arc<dyn Handle>, BoxError> {
        if self.tx.is_some() {
            return Err(InMemoryError::AlreadyInTransaction.into());
        }
        Counters::bump(&self.shared.counters.begins);
        tracing::trace!("in-memory transaction started");
        Ok(Arc::new(Self {
            shared: Arc::clone(&self.shared),
            tx: Some(Mutex::new(TxState {
                log: Vec::new(),
                savepoints: Vec::new(),
                active: true,
            })),
        }))
    }

    async fn commit(&self) -> Result<(), BoxError> {
        let mut state = self.active_tx()?;
        let log = std::mem::take(&mut state.log);
        {
            let mut tables = self.shared.tables.write();
            for write in log {
                write.apply(&mut tables);
            }
        }
        state.savepoints.clear();
        state.active = false;
        Counters::bump(&self.shared.counters.commits);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), BoxError> {
        let mut state = match self.active_tx() {
            Ok(state) => state,
            Err(InMemoryError::TransactionEnded) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        state.log.clear();
        state.savepoints.clear();
        state.active = false;
        Counters::bump(&self.shared.counters.rollbacks);
        Ok(())
    }

    async fn savepoint(&self, name: &str) -> Result<(), BoxError> {
        if self.shared.nested_disabled {
            return Err(InMemoryError::NestedTransactionsDisabled.into());
        }
        let mut state = self.active_tx()?;
        let position = state.log.len();
        state.savepoints.push((name.to_string(), position));
        Counters::bump(&self.shared.counters.savepoints);
        Ok(())
    }

    async fn rollback_to_savepoint(&self, name: &str) -> Result<(), BoxError> {
        let mut state = self.active_tx()?;
        let index = state
            .savepoints
            .iter()
            .rposition(|(existing, _)| existing == name)
            .ok_or_else(|| InMemoryError::UnknownSavepoint(name.to_string()))?;
        let position = state.savepoints[index].1;
        state.log.truncate(position);
        state.savepoints.truncate(index + 1);
        Counters::bump(&self.shared.counters.savepoint_rollbacks);
        Ok(())
    }

    fn nested_transactions_disabled(&self) -> bool {
        self.shared.nested_disabled
    }

    fn in_transaction(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.lock().active)
    }
}
