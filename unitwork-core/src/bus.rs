//! In-process topic bus.
//!
//! Handlers subscribe to one or more topics under an identifier that must be
//! unique per topic. Posting to a topic runs every subscriber that does not
//! filter the event out:
//!
//! - synchronous subscribers run inline, in registration order, before
//!   [`Bus::post`] returns;
//! - asynchronous subscribers are handed to a [`Dispatcher`] and run
//!   independently, with a context detached from any transaction.
//!
//! Posting never creates a topic. A topic exists once a subscriber has been
//! registered on it, and keeps existing after its subscribers leave.

use std::{collections::HashMap, fmt, panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use futures::{FutureExt, future::BoxFuture};
use parking_lot::RwLock;
use thiserror::Error;

use crate::context::Context;

/// Errors raised by [`Bus`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("topic `{0}` not found")]
    TopicNotFound(String),
    #[error("subscriber `{id}` already registered on topic `{topic}`")]
    AlreadyRegistered { id: String, topic: String },
    #[error("register topic not set")]
    NoTopics,
}

/// A bus subscriber.
#[async_trait]
pub trait EventHandler<E>: Send + Sync + 'static {
    async fn on_event(&self, ctx: Context, event: E);

    /// Return `true` to skip `event`.
    fn filter(&self, _event: &E) -> bool {
        false
    }
}

/// How a subscriber is run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Sync,
    Async,
}

/// Runs asynchronous deliveries.
pub trait Dispatcher: fmt::Debug + Send + Sync {
    /// Start `task` without waiting for it.
    fn spawn(&self, task: BoxFuture<'static, ()>);
}

/// Spawns each delivery as its own tokio task.
///
/// Outside a tokio runtime the delivery is dropped and an error is logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioDispatcher;

impl Dispatcher for TokioDispatcher {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(task);
            }
            Err(err) => tracing::error!(%err, "no runtime for async delivery, event dropped"),
        }
    }
}

type CompletionHook = Arc<dyn Fn(&str) + Send + Sync>;

struct Subscriber<E> {
    id: String,
    handler: Arc<dyn EventHandler<E>>,
    delivery: Delivery,
}

impl<E> Clone for Subscriber<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            handler: Arc::clone(&self.handler),
            delivery: self.delivery,
        }
    }
}

/// Builder for [`Bus`].
pub struct BusBuilder<E> {
    dispatcher: Arc<dyn Dispatcher>,
    on_async_complete: Option<CompletionHook>,
    _event: std::marker::PhantomData<fn(E)>,
}

impl<E> fmt::Debug for BusBuilder<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusBuilder")
            .field("dispatcher", &self.dispatcher)
            .field("on_async_complete", &self.on_async_complete.is_some())
            .finish()
    }
}

impl<E> BusBuilder<E> {
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: impl Dispatcher + 'static) -> Self {
        self.dispatcher = Arc::new(dispatcher);
        self
    }

    /// Called with the subscriber id after each asynchronous delivery ends,
    /// including when the handler panicked.
    #[must_use]
    pub fn on_async_complete(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_async_complete = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn build(self) -> Bus<E> {
        Bus {
            topics: RwLock::new(HashMap::new()),
            dispatcher: self.dispatcher,
            on_async_complete: self.on_async_complete,
        }
    }
}

/// Topic-based publish/subscribe bus.
pub struct Bus<E> {
    topics: RwLock<HashMap<String, Vec<Subscriber<E>>>>,
    dispatcher: Arc<dyn Dispatcher>,
    on_async_complete: Option<CompletionHook>,
}

impl<E> fmt::Debug for Bus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topics = self.topics.read();
        let mut counts: Vec<(&str, usize)> = topics
            .iter()
            .map(|(topic, subscribers)| (topic.as_str(), subscribers.len()))
            .collect();
        counts.sort_unstable();
        f.debug_struct("Bus")
            .field("topics", &counts)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl<E> Default for Bus<E>
where
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Bus<E>
where
    E: Clone + Send + Sync + 'static,
{
    /// A bus with the [`TokioDispatcher`].
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    #[must_use]
    pub fn builder() -> BusBuilder<E> {
        BusBuilder {
            dispatcher: Arc::new(TokioDispatcher),
            on_async_complete: None,
            _event: std::marker::PhantomData,
        }
    }

    /// Register a synchronous subscriber on every topic in `topics`.
    ///
    /// Registration is all-or-nothing.
    ///
    /// # Errors
    ///
    /// [`BusError::NoTopics`] if `topics` is empty,
    /// [`BusError::AlreadyRegistered`] if `id` is taken on any topic.
    pub fn register(
        &self,
        id: impl Into<String>,
        handler: impl EventHandler<E>,
        topics: &[&str],
    ) -> Result<(), BusError> {
        self.subscribe(id.into(), Arc::new(handler), Delivery::Sync, topics)
    }

    /// Register an asynchronous subscriber on every topic in `topics`.
    ///
    /// # Errors
    ///
    /// Same as [`Bus::register`].
    pub fn register_async(
        &self,
        id: impl Into<String>,
        handler: impl EventHandler<E>,
        topics: &[&str],
    ) -> Result<(), BusError> {
        self.subscribe(id.into(), Arc::new(handler), Delivery::Async, topics)
    }

    fn subscribe(
        &self,
        id: String,
        handler: Arc<dyn EventHandler<E>>,
        delivery: Delivery,
        topics: &[&str],
    ) -> Result<(), BusError> {
        if topics.is_empty() {
            return Err(BusError::NoTopics);
        }
        let mut registry = self.topics.write();
        for topic in topics {
            let taken = registry
                .get(*topic)
                .is_some_and(|subscribers| subscribers.iter().any(|s| s.id == id));
            if taken {
                return Err(BusError::AlreadyRegistered {
                    id,
                    topic: (*topic).to_string(),
                });
            }
        }
        for topic in topics {
            registry
                .entry((*topic).to_string())
                .or_default()
                .push(Subscriber {
                    id: id.clone(),
                    handler: Arc::clone(&handler),
                    delivery,
                });
        }
        tracing::debug!(subscriber = %id, ?topics, ?delivery, "subscriber registered");
        Ok(())
    }

    /// Remove the subscriber `id` from `topics`. Unknown ids and topics are
    /// ignored.
    pub fn unregister(&self, id: &str, topics: &[&str]) {
        let mut registry = self.topics.write();
        for topic in topics {
            if let Some(subscribers) = registry.get_mut(*topic) {
                subscribers.retain(|s| s.id != id);
            }
        }
        tracing::debug!(subscriber = id, ?topics, "subscriber unregistered");
    }

    /// Deliver `event` to the subscribers of `topic`.
    ///
    /// # Errors
    ///
    /// [`BusError::TopicNotFound`] if nothing was ever registered on `topic`.
    pub async fn post(&self, ctx: &Context, topic: &str, event: E) -> Result<(), BusError> {
        let subscribers = self
            .topics
            .read()
            .get(topic)
            .cloned()
            .ok_or_else(|| BusError::TopicNotFound(topic.to_string()))?;

        for subscriber in subscribers {
            if subscriber.handler.filter(&event) {
                tracing::trace!(subscriber = %subscriber.id, topic, "event filtered out");
                continue;
            }
            match subscriber.delivery {
                Delivery::Sync => {
                    subscriber.handler.on_event(ctx.clone(), event.clone()).await;
                }
                Delivery::Async => self.spawn(ctx.detached(), subscriber, event.clone()),
            }
        }
        Ok(())
    }

    fn spawn(&self, ctx: Context, subscriber: Subscriber<E>, event: E) {
        let hook = self.on_async_complete.clone();
        self.dispatcher.spawn(Box::pin(async move {
            let outcome = AssertUnwindSafe(subscriber.handler.on_event(ctx, event))
                .catch_unwind()
                .await;
            if outcome.is_err() {
                tracing::error!(subscriber = %subscriber.id, "async subscriber panicked");
            }
            if let Some(hook) = hook {
                hook(&subscriber.id);
            }
        }));
    }

    /// Every topic that has had a subscriber registered.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.read().keys().cloned().collect();
        topics.sort_unstable();
        topics
    }

    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map_or(0, Vec::len)
    }
}
