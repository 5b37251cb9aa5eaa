//! Typed publish/subscribe bus.
//!
//! The bus decouples signal producers (plugins) from the consumer side of the
//! pipeline. Each event name is a [`Topic`] type, so both the name and the
//! argument shape of an emission are checked at compile time.
//!
//! # Rules
//!
//! - **Ordered registration**: listeners of a topic are kept in registration
//!   order; registering the same closure twice keeps both.
//! - **Concurrent delivery**: [`EventBus::emit`] drives every listener of the
//!   topic at the same time and resolves when all of them have settled.
//! - **Isolation**: a listener returning an error or panicking is logged and
//!   never affects its siblings or the emitter.
//!
//! # Example
//!
//! ```
//! use sightline_sdk::bus::{EventBus, Topic};
//!
//! struct Greeting;
//!
//! impl Topic for Greeting {
//!     const NAME: &'static str = "greeting";
//!     type Args = String;
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = EventBus::new();
//!     bus.on::<Greeting, _, _>(|name| async move {
//!         println!("hello {name}");
//!         Ok(())
//!     });
//!     bus.emit::<Greeting>("world".to_string()).await;
//! }
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tracing::{debug, trace, warn};

use crate::isolate;
use crate::types::{Category, TransportEvent};

/// A named event with a fixed argument shape.
pub trait Topic: 'static {
    /// Name used in logs.
    const NAME: &'static str;

    /// Arguments handed to every listener. Cloned once per listener.
    type Args: Clone + Send + 'static;
}

/// The topic plugins publish captured events on.
///
/// The facade subscribes exactly one listener to it, which enriches the event
/// and hands it to the breadcrumb queue of the given category.
#[derive(Debug)]
pub struct TransportTopic;

impl Topic for TransportTopic {
    const NAME: &'static str = "transport";
    type Args = (Category, TransportEvent);
}

/// Type-erased listener for a topic's arguments.
pub type Listener<A> = Arc<dyn Fn(A) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Handle identifying one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    /// Always a `Listener<T::Args>` for the topic it is filed under.
    listener: Box<dyn Any + Send + Sync>,
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    topics: Mutex<HashMap<TypeId, Vec<Registration>>>,
}

/// Typed asynchronous event bus.
///
/// Cloning is cheap; all clones share the same listener map.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topics = self.lock();
        let listeners: usize = topics.values().map(Vec::len).sum();
        f.debug_struct("EventBus")
            .field("topics", &topics.len())
            .field("listeners", &listeners)
            .finish()
    }
}

impl EventBus {
    /// Creates a bus with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for topic `T`.
    ///
    /// The listener is appended after any listeners already registered for
    /// the topic. The returned id can be passed to [`EventBus::off`].
    pub fn on<T, F, Fut>(&self, listener: F) -> ListenerId
    where
        T: Topic,
        F: Fn(T::Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.next_id();
        let listener: Listener<T::Args> = Arc::new(move |args| listener(args).boxed());
        self.insert::<T>(id, listener);
        id
    }

    /// Registers a listener that runs for the first emission only.
    ///
    /// The listener unregisters itself before the wrapped closure runs. An
    /// emission that snapshotted the listener list concurrently still sees
    /// the registration, but the wrapped closure is invoked at most once.
    pub fn once<T, F, Fut>(&self, listener: F) -> ListenerId
    where
        T: Topic,
        F: Fn(T::Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.next_id();
        let fired = AtomicBool::new(false);
        let bus = Arc::downgrade(&self.inner);

        let wrapped: Listener<T::Args> = Arc::new(move |args| {
            if fired.swap(true, Ordering::SeqCst) {
                return async { Ok::<(), anyhow::Error>(()) }.boxed();
            }
            if let Some(inner) = bus.upgrade() {
                EventBus { inner }.off::<T>(id);
            }
            listener(args).boxed()
        });
        self.insert::<T>(id, wrapped);
        id
    }

    /// Removes a single listener of topic `T`.
    ///
    /// Does nothing if the listener is not registered.
    pub fn off<T: Topic>(&self, id: ListenerId) {
        let mut topics = self.lock();
        if let Some(registrations) = topics.get_mut(&TypeId::of::<T>()) {
            registrations.retain(|r| r.id != id);
            if registrations.is_empty() {
                topics.remove(&TypeId::of::<T>());
            }
        }
    }

    /// Removes every listener of topic `T`.
    pub fn off_all<T: Topic>(&self) {
        if let Some(removed) = self.lock().remove(&TypeId::of::<T>()) {
            debug!(topic = T::NAME, removed = removed.len(), "Listeners removed");
        }
    }

    /// Number of listeners currently registered for topic `T`.
    #[must_use]
    pub fn listener_count<T: Topic>(&self) -> usize {
        self.lock()
            .get(&TypeId::of::<T>())
            .map_or(0, Vec::len)
    }

    /// Delivers `args` to every listener of topic `T`.
    ///
    /// Listeners run concurrently and this call resolves once all of them
    /// have finished. Failures are logged per listener. Listeners registered
    /// or removed while the emission is in flight do not affect it.
    pub async fn emit<T: Topic>(&self, args: T::Args) {
        let listeners: Vec<Listener<T::Args>> = {
            let topics = self.lock();
            topics
                .get(&TypeId::of::<T>())
                .map(|registrations| {
                    registrations
                        .iter()
                        .filter_map(|r| r.listener.downcast_ref::<Listener<T::Args>>())
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        if listeners.is_empty() {
            trace!(topic = T::NAME, "No listeners for emitted event");
            return;
        }

        let calls = listeners.into_iter().map(|listener| {
            let args = args.clone();
            async move {
                let Ok(call) = isolate::call(|| listener(args)) else {
                    warn!(topic = T::NAME, "Listener panicked");
                    return;
                };
                match isolate::poll(call).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(topic = T::NAME, error = %e, "Listener failed"),
                    Err(_) => warn!(topic = T::NAME, "Listener panicked"),
                }
            }
        });

        join_all(calls).await;
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn insert<T: Topic>(&self, id: ListenerId, listener: Listener<T::Args>) {
        self.lock()
            .entry(TypeId::of::<T>())
            .or_default()
            .push(Registration {
                id,
                listener: Box::new(listener),
            });
        trace!(topic = T::NAME, "Listener registered");
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TypeId, Vec<Registration>>> {
        self.inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
