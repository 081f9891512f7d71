use std::{fmt, marker::PhantomData};

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use sqlx::{Row, types::Json};
use unitwork_core::{aggregate::Aggregate, backend::Handle, diff::AggregateDiff, error::BoxError};

use crate::{Database, Error, PgHandle, error::check_identifier};

/// Keeps aggregates of type `A` as `jsonb` rows of one table, keyed by
/// identity.
///
/// Every save upserts the full row. The diff is only logged: a snapshot
/// taken inside a transaction that later rolled back would otherwise hide a
/// row that was never committed.
pub struct JsonStore<A> {
    table: String,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A> fmt::Debug for JsonStore<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonStore")
            .field("table", &self.table)
            .finish()
    }
}

impl<A> JsonStore<A> {
    /// # Errors
    ///
    /// [`Error::InvalidIdentifier`] unless `table` is a plain SQL identifier.
    pub fn new(table: impl Into<String>) -> Result<Self, Error> {
        let table = table.into();
        check_identifier(&table)?;
        Ok(Self {
            table,
            _aggregate: PhantomData,
        })
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the table (idempotent).
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if the DDL fails.
    #[tracing::instrument(skip(self, database), fields(table = %self.table))]
    pub async fn migrate(&self, database: &Database) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(&format!(
            r"
            CREATE TABLE IF NOT EXISTS {} (
                id         BIGINT PRIMARY KEY,
                kind       TEXT NOT NULL,
                data       JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            ",
            self.table
        ))
        .execute(database.pool())
        .await?;
        Ok(())
    }
}

fn pg(handle: &dyn Handle) -> Result<&PgHandle, Error> {
    handle
        .downcast_ref::<PgHandle>()
        .ok_or_else(|| Error::ForeignHandle(format!("{handle:?}")))
}

#[async_trait]
impl<A> unitwork_core::store::Store<A> for JsonStore<A>
where
    A: Aggregate + Serialize + DeserializeOwned,
{
    #[tracing::instrument(
        skip(self, handle, aggregate, diff),
        fields(table = %self.table, id = aggregate.aggregate_id())
    )]
    async fn save(
        &self,
        handle: &dyn Handle,
        aggregate: &A,
        diff: &AggregateDiff,
    ) -> Result<(), BoxError> {
        let handle = pg(handle)?;
        let sql = format!(
            r"
            INSERT INTO {} (id, kind, data)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data, updated_at = now()
            ",
            self.table
        );
        handle
            .execute(
                sqlx::query(&sql)
                    .bind(aggregate.aggregate_id())
                    .bind(aggregate.type_name())
                    .bind(Json(aggregate)),
            )
            .await?;
        tracing::debug!(groups = ?diff.groups().collect::<Vec<_>>(), "row saved");
        Ok(())
    }

    #[tracing::instrument(skip(self, handle), fields(table = %self.table))]
    async fn find(&self, handle: &dyn Handle, id: i64) -> Result<Option<A>, BoxError> {
        let handle = pg(handle)?;
        let sql = format!("SELECT data FROM {} WHERE id = $1", self.table);
        let Some(row) = handle
            .fetch_optional(sqlx::query(&sql).bind(id))
            .await?
        else {
            return Ok(None);
        };
        let Json(aggregate) = row.try_get::<Json<A>, _>("data").map_err(Error::from)?;
        Ok(Some(aggregate))
    }

    #[tracing::instrument(
        skip(self, handle, aggregate),
        fields(table = %self.table, id = aggregate.aggregate_id())
    )]
    async fn remove(&self, handle: &dyn Handle, aggregate: &A) -> Result<(), BoxError> {
        let sql = format!("DELETE FROM {} WHERE id = $1", self.table);
        pg(handle)?
            .execute(sqlx::query(&sql).bind(aggregate.aggregate_id()))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde::Serialize, serde::Deserialize)]
    struct Note {
        id: i64,
    }

    #[test]
    fn table_names_must_be_identifiers() {
        let store = JsonStore::<Note>::new("notes").unwrap();
        assert_eq!(store.table(), "notes");
        assert!(matches!(
            JsonStore::<Note>::new("notes; --"),
            Err(Error::InvalidIdentifier(name)) if name == "notes; --"
        ));
    }
}
