//! Domain events and their publication.
//!
//! Concrete events implement [`DomainEvent`] and embed an [`EventMeta`] that
//! carries the write-once identifier and occurrence time. Roots buffer raised
//! events until the unit of work hands them to a [`DomainEventPublisher`].
//! The default publisher, [`BusPublisher`], posts onto the
//! [`DOMAIN_EVENT_TOPIC`] of an in-process [`Bus`].

use std::{
    any::Any,
    borrow::Cow,
    fmt,
    future::Future,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicI64, Ordering},
    },
};

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::{
    bus::{Bus, BusError, EventHandler},
    context::Context,
    error::Error,
    registry::{Component, Registry},
};

/// Registry name of the domain event publisher.
pub const PUBLISHER_NAME: &str = "unitwork:core:DomainEventPublisher";

/// Bus topic domain events are posted on.
pub const DOMAIN_EVENT_TOPIC: &str = "unitwork:domain_event_topic";

/// Shared handle to a raised event.
pub type SharedEvent = Arc<dyn DomainEvent>;

/// Identifier and occurrence time of an event.
///
/// Both values are assigned at most once. Values preset with
/// [`EventMeta::with_id`] or [`EventMeta::with_occurred_on`] are never
/// replaced.
#[derive(Clone, Debug, Default)]
pub struct EventMeta {
    id: OnceLock<String>,
    occurred_on: OnceLock<i64>,
}

impl EventMeta {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_id(self, id: impl Into<String>) -> Self {
        let _ = self.id.set(id.into());
        self
    }

    /// Preset the occurrence time, in seconds since the Unix epoch.
    ///
    /// Values `<= 0` count as unset.
    #[must_use]
    pub fn with_occurred_on(self, seconds: i64) -> Self {
        if seconds > 0 {
            let _ = self.occurred_on.set(seconds);
        }
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.id.get().map(String::as_str)
    }

    pub fn occurred_on(&self) -> Option<i64> {
        self.occurred_on.get().copied()
    }

    fn id_or_init(&self, describe: impl FnOnce() -> String) -> &str {
        self.id.get_or_init(|| generate_event_id(&describe()))
    }

    fn occurred_on_or_now(&self) -> i64 {
        *self.occurred_on.get_or_init(|| Utc::now().timestamp())
    }
}

/// `DomainEvent:<sha256 of the description>-<nanos>`.
///
/// The nanosecond component never repeats within a process, even when the
/// wall clock stalls or steps backwards.
fn generate_event_id(description: &str) -> String {
    static LAST: AtomicI64 = AtomicI64::new(0);

    let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
    let previous = LAST.fetch_max(now, Ordering::SeqCst);
    let nanos = if previous >= now {
        LAST.fetch_add(1, Ordering::SeqCst) + 1
    } else {
        now
    };

    let digest = Sha256::digest(description.as_bytes());
    format!("DomainEvent:{digest:x}-{nanos}")
}

/// Something that happened in the domain.
///
/// The `Display` output describes the event; it feeds the generated
/// identifier.
pub trait DomainEvent: Any + fmt::Display + fmt::Debug + Send + Sync {
    fn meta(&self) -> &EventMeta;

    /// The event identifier, generated on first read if unset.
    fn event_id(&self) -> &str {
        self.meta().id_or_init(|| self.to_string())
    }

    /// Occurrence time in seconds, assigned on first read if unset.
    fn occurred_on(&self) -> i64 {
        self.meta().occurred_on_or_now()
    }
}

impl dyn DomainEvent {
    pub fn as_any(&self) -> &dyn Any {
        self
    }

    /// Typed access for subscribers.
    pub fn downcast_ref<T: DomainEvent>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }

    pub fn is<T: DomainEvent>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// Publishes domain events raised by aggregate roots.
#[async_trait]
pub trait DomainEventPublisher: Send + Sync {
    async fn publish(&self, ctx: &Context, event: SharedEvent) -> Result<(), Error>;
}

/// Publishes domain events onto [`DOMAIN_EVENT_TOPIC`] of a bus.
///
/// Synchronous subscribers have run by the time `publish` returns;
/// asynchronous subscribers have only been handed off.
#[derive(Debug)]
pub struct BusPublisher {
    bus: Arc<Bus<SharedEvent>>,
}

impl BusPublisher {
    #[must_use]
    pub const fn new(bus: Arc<Bus<SharedEvent>>) -> Self {
        Self { bus }
    }

    /// The registry-wide publisher. `bus` is only used on first access.
    pub fn shared(registry: &Registry, bus: Arc<Bus<SharedEvent>>) -> Arc<Self> {
        registry.load_or_store(PUBLISHER_NAME, || Self::new(bus))
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<Bus<SharedEvent>> {
        &self.bus
    }
}

impl Component for BusPublisher {
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed(PUBLISHER_NAME)
    }
}

#[async_trait]
impl DomainEventPublisher for BusPublisher {
    async fn publish(&self, ctx: &Context, event: SharedEvent) -> Result<(), Error> {
        tracing::debug!(event_id = event.event_id(), "publishing domain event");
        self.bus.post(ctx, DOMAIN_EVENT_TOPIC, event).await?;
        Ok(())
    }
}

/// Adapts an async closure into a domain event subscriber.
struct FnSubscriber<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler<SharedEvent> for FnSubscriber<F>
where
    F: Fn(Context, SharedEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_event(&self, ctx: Context, event: SharedEvent) {
        (self.f)(ctx, event).await;
    }
}

/// Subscribe `f` to domain events; it runs inline during publication.
///
/// # Errors
///
/// Returns [`BusError::AlreadyRegistered`] if `id` is already subscribed.
pub fn register_sync_subscriber<F, Fut>(
    bus: &Bus<SharedEvent>,
    id: impl Into<String>,
    f: F,
) -> Result<(), BusError>
where
    F: Fn(Context, SharedEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    bus.register(id, FnSubscriber { f }, &[DOMAIN_EVENT_TOPIC])
}

/// Subscribe `f` to domain events; it runs detached from the publisher and
/// outside any transaction.
///
/// # Errors
///
/// Returns [`BusError::AlreadyRegistered`] if `id` is already subscribed.
pub fn register_async_subscriber<F, Fut>(
    bus: &Bus<SharedEvent>,
    id: impl Into<String>,
    f: F,
) -> Result<(), BusError>
where
    F: Fn(Context, SharedEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    bus.register_async(id, FnSubscriber { f }, &[DOMAIN_EVENT_TOPIC])
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug)]
    struct Shipped {
        order: i64,
        meta: EventMeta,
    }

    impl Shipped {
        fn new(order: i64) -> Self {
            Self {
                order,
                meta: EventMeta::new(),
            }
        }
    }

    impl fmt::Display for Shipped {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "order {} shipped", self.order)
        }
    }

    impl DomainEvent for Shipped {
        fn meta(&self) -> &EventMeta {
            &self.meta
        }
    }

    #[test]
    fn event_id_is_generated_once() {
        let event = Shipped::new(7);
        assert!(event.meta().id().is_none());

        let first = event.event_id().to_string();
        let digest = format!("{:x}", Sha256::digest(b"order 7 shipped"));
        assert!(first.starts_with(&format!("DomainEvent:{digest}-")));
        assert_eq!(event.event_id(), first);
    }

    #[test]
    fn equal_descriptions_still_get_distinct_ids() {
        let a = Shipped::new(1);
        let b = Shipped::new(1);
        assert_ne!(a.event_id(), b.event_id());
    }

    #[test]
    fn preset_values_are_kept() {
        let event = Shipped {
            order: 1,
            meta: EventMeta::new().with_id("custom").with_occurred_on(100),
        };
        assert_eq!(event.event_id(), "custom");
        assert_eq!(event.occurred_on(), 100);
    }

    #[test]
    fn occurred_on_is_assigned_once() {
        let event = Shipped::new(1);
        let first = event.occurred_on();
        assert!(first > 0);
        assert_eq!(event.meta().occurred_on(), Some(first));
        assert_eq!(event.occurred_on(), first);
    }

    #[test]
    fn shared_events_downcast_to_their_type() {
        let event: SharedEvent = Arc::new(Shipped::new(3));
        assert!(event.is::<Shipped>());
        assert_eq!(event.downcast_ref::<Shipped>().map(|e| e.order), Some(3));
    }

    #[tokio::test]
    async fn bus_publisher_posts_to_domain_topic() {
        let bus: Arc<Bus<SharedEvent>> = Arc::new(Bus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        register_sync_subscriber(&bus, "audit", move |_, event: SharedEvent| {
            let sink = Arc::clone(&sink);
            async move { sink.lock().push(event.to_string()) }
        })
        .unwrap();

        let publisher = BusPublisher::new(Arc::clone(&bus));
        publisher
            .publish(&Context::background(), Arc::new(Shipped::new(9)))
            .await
            .unwrap();
        assert_eq!(*seen.lock(), vec!["order 9 shipped".to_string()]);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_fails() {
        let publisher = BusPublisher::new(Arc::new(Bus::new()));
        let err = publisher
            .publish(&Context::background(), Arc::new(Shipped::new(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Bus(BusError::TopicNotFound(_))));
    }

    #[test]
    fn shared_publisher_is_a_singleton() {
        let registry = Registry::new();
        let first = BusPublisher::shared(&registry, Arc::new(Bus::new()));
        let second = BusPublisher::shared(&registry, Arc::new(Bus::new()));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name(), PUBLISHER_NAME);
    }
}
