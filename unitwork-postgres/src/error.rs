/// Error type for the `PostgreSQL` backend.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Query execution or transaction failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Table and savepoint names are interpolated into SQL and must be plain
    /// identifiers.
    #[error("invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),
    #[error("handle is not transactional")]
    NoTransaction,
    #[error("handle is already transactional")]
    AlreadyInTransaction,
    #[error("transaction has already ended")]
    TransactionEnded,
    #[error("nested transactions are disabled")]
    NestedTransactionsDisabled,
    /// A store was handed a handle from another backend.
    #[error("expected a Postgres handle, got {0}")]
    ForeignHandle(String),
}

/// Accept `[A-Za-z_][A-Za-z0-9_]*`.
pub(crate) fn check_identifier(name: &str) -> Result<(), Error> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_validated() {
        assert!(check_identifier("orders").is_ok());
        assert!(check_identifier("_sp_0af3").is_ok());
        assert!(check_identifier("").is_err());
        assert!(check_identifier("1orders").is_err());
        assert!(matches!(
            check_identifier("orders; DROP TABLE x"),
            Err(Error::InvalidIdentifier(_))
        ));
    }
}
