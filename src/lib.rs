#![doc = include_str!("../README.md")]

#[cfg(feature = "test-util")]
pub use unitwork_core::test;
pub use unitwork_core::{
    aggregate,
    aggregate::{Aggregate, AggregateRoot, Entity, RootState, RootTracking},
    bus,
    bus::{Bus, EventHandler},
    context,
    context::Context,
    diff,
    diff::{AggregateDiff, Diff, ListDiff},
    error,
    error::{AppError, Error},
    event,
    event::{DomainEvent, DomainEventPublisher, EventMeta, SharedEvent},
    identity,
    registry,
    registry::Registry,
    repository,
    repository::{Repository, StoreRepository, UnitOfWork},
    trace,
    transaction,
    transaction::{Propagation, TransactionManager},
};
// Re-export proc macro derives so consumers only depend on `unitwork`.
pub use unitwork_macros::{Aggregate, AggregateRoot};

pub mod backend {
    pub use unitwork_core::backend::{Handle, HandleFactory, inmemory};

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use unitwork_postgres::{Database, Error, PgHandle};
    }
}

pub mod store {
    pub use unitwork_core::store::{Store, inmemory};

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use unitwork_postgres::{Error, JsonStore};
    }
}
