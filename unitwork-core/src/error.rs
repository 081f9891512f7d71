//! Error types.
//!
//! [`AppError`] is the tagged failure applications raise and inspect: a kind
//! (business rule vs. system), a numeric code, a message, an optional parent
//! cause and a key/value context. [`Error`] is what unit-of-work operations
//! return; it wraps transaction, bus, application and backend failures.

use std::{collections::BTreeMap, error::Error as StdError, fmt};

use serde_json::Value;
use thiserror::Error;

use crate::{bus::BusError, context::ContextError, transaction::TransactionError};

/// Boxed error used at backend and generator seams.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Category of an [`AppError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A business rule was violated; usually the caller's fault.
    Business,
    /// Infrastructure failed.
    System,
    Other,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Business => "BIZ_ERROR",
            Self::System => "SYS_ERROR",
            Self::Other => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tagged application failure.
///
/// ```
/// use unitwork_core::error::AppError;
///
/// let err = AppError::bad_param("quantity must be positive", 0);
/// assert_eq!(err.code(), 400);
/// assert_eq!(err.to_string(), "[BIZ_ERROR-400] quantity must be positive; ctx is {params: 0}");
/// ```
#[derive(Debug)]
pub struct AppError {
    kind: ErrorKind,
    code: i32,
    message: String,
    parent: Option<BoxError>,
    context: BTreeMap<String, Value>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, code: i32, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            parent: None,
            context: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn business(code: i32, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Business, code, message)
    }

    #[must_use]
    pub fn system(code: i32, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::System, code, message)
    }

    /// `400`, with the offending parameters recorded under `params`.
    #[must_use]
    pub fn bad_param(message: impl Into<String>, params: impl Into<Value>) -> Self {
        Self::business(400, message).with("params", params)
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::business(404, message)
    }

    #[must_use]
    pub fn db_fail(cause: impl Into<BoxError>, message: impl Into<String>) -> Self {
        Self::system(500, message).with_parent(cause)
    }

    /// `500`, with the failed request recorded under `RpcRequest`.
    #[must_use]
    pub fn rpc_fail(
        cause: impl Into<BoxError>,
        message: impl Into<String>,
        request: impl Into<Value>,
    ) -> Self {
        Self::system(500, message)
            .with_parent(cause)
            .with("RpcRequest", request)
    }

    #[must_use]
    pub fn with_parent(mut self, cause: impl Into<BoxError>) -> Self {
        self.parent = Some(cause.into());
        self
    }

    /// Record context about the failure.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub const fn code(&self) -> i32 {
        self.code
    }

    /// The message, falling back to the parent's when empty.
    #[must_use]
    pub fn message(&self) -> String {
        if !self.message.is_empty() {
            return self.message.clone();
        }
        match &self.parent {
            Some(parent) => match parent.downcast_ref::<Self>() {
                Some(app) => app.message(),
                None => parent.to_string(),
            },
            None => String::new(),
        }
    }

    #[must_use]
    pub fn parent(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.parent.as_deref()
    }

    #[must_use]
    pub const fn context(&self) -> &BTreeMap<String, Value> {
        &self.context
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::Business && self.code == 404
    }

    /// Run `callback` if `err` is, or wraps, an [`AppError`].
    ///
    /// The source chain is searched from the outside in. Returns whether the
    /// callback ran.
    pub fn handle(err: &(dyn StdError + 'static), callback: impl FnOnce(&Self)) -> bool {
        let found = std::iter::successors(Some(err), |&e| e.source())
            .find_map(<dyn StdError>::downcast_ref::<Self>);
        match found {
            Some(app) => {
                callback(app);
                true
            }
            None => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}-{}] {}", self.kind, self.code, self.message)?;
        if let Some(parent) = &self.parent {
            write!(f, ", parent error is {parent}")?;
        }
        if !self.context.is_empty() {
            f.write_str("; ctx is {")?;
            for (i, (key, value)) in self.context.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{key}: {value}")?;
            }
            f.write_str("}")?;
        }
        Ok(())
    }
}

impl StdError for AppError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.parent
            .as_deref()
            .map(|parent| parent as &(dyn StdError + 'static))
    }
}

/// Error returned by unit-of-work and repository operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    App(#[from] AppError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("backend error: {0}")]
    Backend(#[source] BoxError),
    #[error("identity generation failed: {0}")]
    IdGen(#[source] BoxError),
}

impl Error {
    /// The application error this error carries, if any.
    #[must_use]
    pub fn as_app(&self) -> Option<&AppError> {
        match self {
            Self::App(app) => Some(app),
            Self::Backend(err) | Self::IdGen(err) => err.downcast_ref(),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.as_app().is_some_and(AppError::is_not_found)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn display_includes_parent_and_context() {
        let err = AppError::db_fail(std::io::Error::other("disk full"), "insert failed")
            .with("table", "orders");
        assert_eq!(
            err.to_string(),
            r#"[SYS_ERROR-500] insert failed, parent error is disk full; ctx is {table: "orders"}"#
        );
        assert_eq!(err.kind(), ErrorKind::System);
        assert!(err.parent().is_some());
    }

    #[test]
    fn rpc_fail_records_request() {
        let err = AppError::rpc_fail(std::io::Error::other("timeout"), "call failed", json!({"id": 1}));
        assert_eq!(err.context().get("RpcRequest"), Some(&json!({"id": 1})));
    }

    #[test]
    fn message_falls_back_to_parent() {
        let inner = AppError::not_found("order not found");
        let outer = AppError::system(500, "").with_parent(inner);
        assert_eq!(outer.message(), "order not found");

        let plain = AppError::system(500, "").with_parent(std::io::Error::other("io"));
        assert_eq!(plain.message(), "io");
    }

    #[test]
    fn handle_finds_wrapped_app_errors() {
        let err = Error::Backend(Box::new(AppError::not_found("gone")));
        let mut code = None;
        assert!(AppError::handle(&err, |app| code = Some(app.code())));
        assert_eq!(code, Some(404));
        assert!(err.is_not_found());

        let other = std::io::Error::other("plain");
        assert!(!AppError::handle(&other, |_| unreachable!()));
    }

    #[test]
    fn transparent_variants_keep_messages() {
        let err = Error::from(TransactionError::InTransaction);
        assert_eq!(err.to_string(), TransactionError::InTransaction.to_string());
        assert!(err.as_app().is_none());
    }
}
