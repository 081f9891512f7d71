//! Unit of work and repositories.
//!
//! [`UnitOfWork`] wraps the physical persistence calls of a repository with
//! the aggregate lifecycle:
//!
//! - **save**: publish the root's pending events, clear them, diff the root
//!   against its snapshot, persist, then re-snapshot.
//! - **find**: load, then snapshot the loaded root.
//! - **remove**: delete, then drop the snapshot.
//!
//! [`StoreRepository`] is the ready-made [`Repository`] that routes these
//! hooks to a [`Store`] on a backend handle chosen from the call context.

use std::{
    any::{Any, type_name},
    borrow::Cow,
    fmt,
    future::Future,
    marker::PhantomData,
    sync::Arc,
};

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::{
    aggregate::Aggregate,
    backend::{Handle, HandleFactory},
    context::Context,
    diff::AggregateDiff,
    error::{AppError, Error},
    event::DomainEventPublisher,
    identity::IdGenerator,
    registry::{Component, ComponentKey, Registry},
    store::Store,
};

/// Registry name of the unit of work.
pub const UNIT_OF_WORK_NAME: &str = "unitwork:core:UnitOfWork";

/// Orchestrates event publication, change tracking and snapshots around
/// persistence calls.
pub struct UnitOfWork {
    publisher: Arc<dyn DomainEventPublisher>,
    id_gen: Arc<dyn IdGenerator>,
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork").finish_non_exhaustive()
    }
}

impl Component for UnitOfWork {
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed(UNIT_OF_WORK_NAME)
    }
}

impl UnitOfWork {
    #[must_use]
    pub fn new(publisher: Arc<dyn DomainEventPublisher>, id_gen: Arc<dyn IdGenerator>) -> Self {
        Self { publisher, id_gen }
    }

    /// The registry-wide unit of work. The collaborators are only used on
    /// first access.
    pub fn shared(
        registry: &Registry,
        publisher: Arc<dyn DomainEventPublisher>,
        id_gen: Arc<dyn IdGenerator>,
    ) -> Arc<Self> {
        registry.load_or_store(UNIT_OF_WORK_NAME, || Self::new(publisher, id_gen))
    }

    /// A fresh identity for a new aggregate.
    ///
    /// # Errors
    ///
    /// [`Error::IdGen`] if the generator fails.
    pub async fn next_identity(&self, ctx: &Context) -> Result<i64, Error> {
        self.id_gen.generate(ctx).await.map_err(Error::IdGen)
    }

    /// Persist `aggregate` through `save`.
    ///
    /// For a root, pending events are published in the order they were
    /// raised. If any publication fails the call returns that error at once:
    /// the events stay pending and `save` is not called. Otherwise the events
    /// are cleared, `save` receives the diff against the snapshot and, once it
    /// succeeds, the snapshot is replaced with the saved state. A non-root
    /// aggregate is saved with an empty diff.
    ///
    /// # Errors
    ///
    /// The context's cancellation, the publisher's failure or `save`'s.
    #[tracing::instrument(skip_all, fields(aggregate_id = aggregate.aggregate_id()))]
    pub async fn around_save<A, F>(
        &self,
        ctx: &Context,
        aggregate: &mut A,
        save: F,
    ) -> Result<(), Error>
    where
        A: Aggregate,
        F: for<'a> FnOnce(&'a A, AggregateDiff) -> BoxFuture<'a, Result<(), Error>> + Send,
    {
        ctx.check()?;

        let pending = aggregate
            .as_root()
            .map(|root| root.events().to_vec())
            .unwrap_or_default();
        for event in pending {
            self.publisher.publish(ctx, event).await?;
        }

        let diff = match aggregate.as_root_mut() {
            Some(root) => {
                root.clear_events();
                root.diff()
            }
            None => AggregateDiff::empty(),
        };

        save(aggregate, diff).await?;

        if let Some(root) = aggregate.as_root_mut() {
            root.attach();
        }
        Ok(())
    }

    /// Load through `find` and snapshot the result if it is a root.
    ///
    /// # Errors
    ///
    /// The context's cancellation or `find`'s failure.
    pub async fn around_find<A, F, Fut>(&self, ctx: &Context, find: F) -> Result<Option<A>, Error>
    where
        A: Aggregate,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<A>, Error>>,
    {
        ctx.check()?;
        let mut found = find().await?;
        if let Some(root) = found.as_mut().and_then(|aggregate| aggregate.as_root_mut()) {
            root.attach();
        }
        Ok(found)
    }

    /// Delete through `remove` and drop the snapshot once it succeeds.
    ///
    /// # Errors
    ///
    /// The context's cancellation or `remove`'s failure.
    pub async fn around_remove<A, F>(
        &self,
        ctx: &Context,
        aggregate: &mut A,
        remove: F,
    ) -> Result<(), Error>
    where
        A: Aggregate,
        F: for<'a> FnOnce(&'a A) -> BoxFuture<'a, Result<(), Error>> + Send,
    {
        ctx.check()?;
        remove(aggregate).await?;
        if let Some(root) = aggregate.as_root_mut() {
            root.detach();
        }
        Ok(())
    }

    /// Turn a missing or unpersisted aggregate into a not-found failure.
    ///
    /// # Errors
    ///
    /// The incoming error, or [`AppError::not_found`] naming the aggregate
    /// type.
    pub fn non_nil<A: Aggregate>(found: Result<Option<A>, Error>) -> Result<A, Error> {
        match found? {
            Some(aggregate) if !aggregate.is_zero() => Ok(aggregate),
            _ => {
                let name = ComponentKey::of::<A>();
                Err(AppError::not_found(format!("{name} not found")).into())
            }
        }
    }

    /// # Panics
    ///
    /// Panics if `value` is not an `Expected`. Handing a repository an
    /// aggregate of another type is a programming error.
    pub fn assert_type<Expected: Aggregate>(value: &dyn Aggregate) {
        let any: &dyn Any = value;
        assert!(
            any.is::<Expected>(),
            "aggregate type mismatch: expected `{}`, got `{}`",
            type_name::<Expected>(),
            value.type_name()
        );
    }
}

/// Persistence entry points for aggregates of type `A`.
#[async_trait]
pub trait Repository<A: Aggregate>: Send + Sync {
    async fn next_identity(&self, ctx: &Context) -> Result<i64, Error>;

    async fn save(&self, ctx: &Context, aggregate: &mut A) -> Result<(), Error>;

    /// `Ok(None)` when there is no aggregate with identity `id`.
    async fn find(&self, ctx: &Context, id: i64) -> Result<Option<A>, Error>;

    /// Like [`Repository::find`], but a missing aggregate is a not-found
    /// error.
    async fn find_non_nil(&self, ctx: &Context, id: i64) -> Result<A, Error> {
        UnitOfWork::non_nil(self.find(ctx, id).await)
    }

    async fn remove(&self, ctx: &Context, aggregate: &mut A) -> Result<(), Error>;
}

#[derive(Clone, Copy, Debug)]
enum Access {
    Read,
    Write,
}

/// A [`Repository`] that persists through a [`Store`].
///
/// Inside a transaction every operation runs on the transaction's handle.
/// Outside one, reads use a read handle and mutations a write handle.
pub struct StoreRepository<A, S> {
    uow: Arc<UnitOfWork>,
    factory: Arc<dyn HandleFactory>,
    store: Arc<S>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A, S: fmt::Debug> fmt::Debug for StoreRepository<A, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreRepository")
            .field("aggregate", &type_name::<A>())
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl<A, S> StoreRepository<A, S>
where
    A: Aggregate,
    S: Store<A> + 'static,
{
    pub fn new(uow: Arc<UnitOfWork>, factory: impl HandleFactory + 'static, store: S) -> Self {
        Self {
            uow,
            factory: Arc::new(factory),
            store: Arc::new(store),
            _aggregate: PhantomData,
        }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// [`Repository::save`] for callers holding a type-erased aggregate.
    ///
    /// # Errors
    ///
    /// Same as [`Repository::save`].
    ///
    /// # Panics
    ///
    /// Panics if `aggregate` is not an `A`.
    pub async fn save_dyn(&self, ctx: &Context, aggregate: &mut dyn Aggregate) -> Result<(), Error> {
        self.save(ctx, downcast_mut(aggregate)).await
    }

    /// [`Repository::remove`] for callers holding a type-erased aggregate.
    ///
    /// # Errors
    ///
    /// Same as [`Repository::remove`].
    ///
    /// # Panics
    ///
    /// Panics if `aggregate` is not an `A`.
    pub async fn remove_dyn(
        &self,
        ctx: &Context,
        aggregate: &mut dyn Aggregate,
    ) -> Result<(), Error> {
        self.remove(ctx, downcast_mut(aggregate)).await
    }

    async fn handle(&self, ctx: &Context, access: Access) -> Result<Arc<dyn Handle>, Error> {
        if let Some(tx) = ctx.transaction().filter(|tx| tx.in_transaction()) {
            return Ok(Arc::clone(tx.handle()));
        }
        let handle = match access {
            Access::Read => self.factory.lookup_read_handle(ctx).await,
            Access::Write => self.factory.lookup_write_handle(ctx).await,
        };
        handle.map_err(Error::Backend)
    }
}

fn downcast_mut<A: Aggregate>(aggregate: &mut dyn Aggregate) -> &mut A {
    UnitOfWork::assert_type::<A>(aggregate);
    let any: &mut dyn Any = aggregate;
    match any.downcast_mut::<A>() {
        Some(aggregate) => aggregate,
        None => unreachable!("type checked above"),
    }
}

#[async_trait]
impl<A, S> Repository<A> for StoreRepository<A, S>
where
    A: Aggregate,
    S: Store<A> + 'static,
{
    async fn next_identity(&self, ctx: &Context) -> Result<i64, Error> {
        self.uow.next_identity(ctx).await
    }

    async fn save(&self, ctx: &Context, aggregate: &mut A) -> Result<(), Error> {
        let handle = self.handle(ctx, Access::Write).await?;
        let store = Arc::clone(&self.store);
        self.uow
            .around_save(ctx, aggregate, move |aggregate, diff| {
                Box::pin(async move {
                    store
                        .save(handle.as_ref(), aggregate, &diff)
                        .await
                        .map_err(Error::Backend)
                })
            })
            .await
    }

    async fn find(&self, ctx: &Context, id: i64) -> Result<Option<A>, Error> {
        let handle = self.handle(ctx, Access::Read).await?;
        self.uow
            .around_find(ctx, || async {
                self.store
                    .find(handle.as_ref(), id)
                    .await
                    .map_err(Error::Backend)
            })
            .await
    }

    async fn remove(&self, ctx: &Context, aggregate: &mut A) -> Result<(), Error> {
        let handle = self.handle(ctx, Access::Write).await?;
        let store = Arc::clone(&self.store);
        self.uow
            .around_remove(ctx, aggregate, move |aggregate| {
                Box::pin(async move {
                    store
                        .remove(handle.as_ref(), aggregate)
                        .await
                        .map_err(Error::Backend)
                })
            })
            .await
    }
}
