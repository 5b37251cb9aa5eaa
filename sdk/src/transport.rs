//! Breadcrumb queues and batch flushing.
//!
//! Every category gets its own queue. A queue is flushed by whichever of two
//! triggers fires first:
//!
//! - **Size**: the push that brings the queue to its capacity forces a flush.
//! - **Time**: an optional periodic timer flushes the queue, unless a flush
//!   already happened within the last upload interval.
//!
//! A flush drains the queue and resets `last_flush_at` in one critical
//! section, before anything is awaited. Events pushed while a batch is on the
//! wire land in the next batch. Each batch gets exactly one delivery attempt:
//! the beacon primitive first, an awaited POST if the beacon refuses. A
//! failed batch is logged and dropped.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sightline_sdk::hooks::Hooks;
//! use sightline_sdk::sender::{HttpSender, SenderConfig};
//! use sightline_sdk::transport::{BreadcrumbOptions, Transport};
//! use sightline_sdk::types::Category;
//!
//! #[tokio::main]
//! async fn main() {
//!     let sender = HttpSender::new(SenderConfig::new("https://collect.example/report")).unwrap();
//!     let transport = Transport::new(Arc::new(sender), Hooks::new());
//!
//!     let timers = transport.init_breadcrumb(vec![
//!         BreadcrumbOptions::new(Category::Vitals)
//!             .with_capacity(3)
//!             .with_upload_interval(Duration::from_secs(30)),
//!     ]);
//!
//!     // ... plugins feed events through the bus ...
//!
//!     timers.dispose().await;
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::error::MonitorError;
use crate::hooks::{HookScope, Hooks};
use crate::sender::BatchSender;
use crate::types::{Category, ReportEvent};

/// Upload interval used when a plugin declares none.
pub const DEFAULT_UPLOAD_INTERVAL: Duration = Duration::from_secs(30);

/// Default queue capacity for a category.
#[must_use]
pub fn default_capacity(category: Category) -> usize {
    match category {
        Category::User => 20,
        Category::Vitals | Category::Abnormal | Category::Custom => 10,
    }
}

/// Settings for one category's breadcrumb queue.
#[derive(Debug, Clone)]
pub struct BreadcrumbOptions {
    /// Category the queue collects.
    pub category: Category,

    /// Number of events that forces a flush. Values below 1 are raised to 1.
    pub capacity: usize,

    /// Period of the timer-driven flush. `None` disables the timer.
    pub upload_interval: Option<Duration>,

    /// Hooks that only apply to this queue.
    pub hooks: Hooks,
}

impl BreadcrumbOptions {
    /// Default capacity for the category, no timer, no hooks.
    #[must_use]
    pub fn new(category: Category) -> Self {
        Self {
            category,
            capacity: default_capacity(category),
            upload_interval: None,
            hooks: Hooks::default(),
        }
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_upload_interval(mut self, interval: Duration) -> Self {
        self.upload_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }
}

struct BreadcrumbQueue {
    capacity: usize,
    upload_interval: Option<Duration>,
    last_flush_at: Instant,
    items: Vec<ReportEvent>,
    hooks: Hooks,
}

impl BreadcrumbQueue {
    fn new(options: BreadcrumbOptions) -> Self {
        Self {
            capacity: options.capacity.max(1),
            upload_interval: options.upload_interval,
            last_flush_at: Instant::now(),
            items: Vec::with_capacity(options.capacity.max(1)),
            hooks: options.hooks,
        }
    }

    /// Drains the queue and marks the flush time.
    fn take_batch(&mut self) -> Vec<ReportEvent> {
        self.last_flush_at = Instant::now();
        mem::replace(&mut self.items, Vec::with_capacity(self.capacity))
    }
}

struct TransportInner {
    queues: Mutex<HashMap<Category, BreadcrumbQueue>>,
    timers: Mutex<HashMap<Category, AbortHandle>>,
    hooks: Hooks,
    sender: Arc<dyn BatchSender>,
}

/// Owner of the per-category breadcrumb queues.
///
/// Cloning is cheap; all clones share the same queues. No method returns an
/// error: failures are logged and the affected event or batch is dropped.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("categories", &self.categories())
            .field("hooks", &self.inner.hooks)
            .finish()
    }
}

impl Transport {
    /// Creates a transport with no queues.
    ///
    /// # Arguments
    ///
    /// * `sender` - Delivery primitive for flushed batches
    /// * `hooks` - Global hooks, applied after each queue's own hooks
    #[must_use]
    pub fn new(sender: Arc<dyn BatchSender>, hooks: Hooks) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                queues: Mutex::new(HashMap::new()),
                timers: Mutex::new(HashMap::new()),
                hooks,
                sender,
            }),
        }
    }

    /// Creates one queue per entry and starts their flush timers.
    ///
    /// Re-initializing a category replaces its queue; events still waiting in
    /// the old queue are dropped and its timer is cancelled. Timers need a
    /// Tokio runtime; without one the queue is created without a timer.
    ///
    /// The returned [`FlushTimers`] owns the timers started by this call.
    pub fn init_breadcrumb(&self, options: Vec<BreadcrumbOptions>) -> FlushTimers {
        let mut categories = Vec::with_capacity(options.len());
        let mut handles = Vec::new();

        for options in options {
            let category = options.category;
            if options.capacity == 0 {
                warn!(category = %category, "Breadcrumb capacity 0 raised to 1");
            }
            let interval = options.upload_interval;

            let previous = self
                .lock_queues()
                .insert(category, BreadcrumbQueue::new(options));
            if let Some(previous) = previous {
                warn!(
                    category = %category,
                    dropped = previous.items.len(),
                    "Breadcrumb queue re-initialized, pending events dropped"
                );
            }
            if let Some(old_timer) = self.lock_timers().remove(&category) {
                old_timer.abort();
            }

            if let Some(period) = interval {
                match self.spawn_timer(category, period) {
                    Some(handle) => {
                        self.lock_timers().insert(category, handle.abort_handle());
                        handles.push(handle);
                    }
                    None => warn!(
                        category = %category,
                        "No async runtime, periodic flush disabled"
                    ),
                }
            }

            debug!(category = %category, interval_secs = ?interval.map(|d| d.as_secs_f64()), "Breadcrumb queue ready");
            categories.push(category);
        }

        FlushTimers {
            transport: self.clone(),
            categories,
            handles,
        }
    }

    /// Queues an event, flushing immediately if the queue is full.
    ///
    /// The queue's `before_push` hook runs first, then the global one; each
    /// may replace the event. Events for categories without a queue are
    /// logged and dropped.
    pub async fn send(&self, category: Category, event: ReportEvent) {
        let queue_hooks = match self.lock_queues().get(&category) {
            Some(queue) => queue.hooks.clone(),
            None => {
                warn!(error = %MonitorError::QueueLookup(category), "Dropping event");
                return;
            }
        };

        let event = queue_hooks.apply_before_push(HookScope::Queue, category, event);
        let mut event = self
            .inner
            .hooks
            .apply_before_push(HookScope::Global, category, event);
        event.event.escape_reserved_fields();

        let full_batch = {
            let mut queues = self.lock_queues();
            let Some(queue) = queues.get_mut(&category) else {
                warn!(error = %MonitorError::QueueLookup(category), "Dropping event");
                return;
            };
            queue.items.push(event);
            trace!(category = %category, queued = queue.items.len(), "Event queued");

            (queue.items.len() >= queue.capacity).then(|| (queue.take_batch(), queue.hooks.clone()))
        };

        if let Some((batch, hooks)) = full_batch {
            debug!(category = %category, events = batch.len(), "Queue full, forcing flush");
            self.dispatch(category, batch, &hooks).await;
        }
    }

    /// Flushes one category's queue.
    ///
    /// Does nothing if the queue is empty. Unless `forced`, also does nothing
    /// while less than the queue's upload interval has passed since its last
    /// flush.
    pub async fn flush(&self, category: Category, forced: bool) {
        let taken = {
            let mut queues = self.lock_queues();
            let Some(queue) = queues.get_mut(&category) else {
                debug!(error = %MonitorError::QueueLookup(category), "Nothing to flush");
                return;
            };
            if queue.items.is_empty() {
                trace!(category = %category, "Queue empty, skipping flush");
                return;
            }
            if !forced {
                if let Some(interval) = queue.upload_interval {
                    if queue.last_flush_at.elapsed() < interval {
                        trace!(category = %category, "Flushed recently, skipping periodic flush");
                        return;
                    }
                }
            }
            (queue.take_batch(), queue.hooks.clone())
        };

        let (batch, hooks) = taken;
        self.dispatch(category, batch, &hooks).await;
    }

    /// Force-flushes every queue.
    pub async fn flush_all(&self) {
        for category in self.categories() {
            self.flush(category, true).await;
        }
    }

    /// Waits until batches handed to the beacon have left the process.
    pub async fn drain(&self) {
        self.inner.sender.drain().await;
    }

    /// Number of events waiting in a category's queue.
    #[must_use]
    pub fn queue_len(&self, category: Category) -> Option<usize> {
        self.lock_queues().get(&category).map(|q| q.items.len())
    }

    /// When a category's queue was last flushed (or created).
    #[must_use]
    pub fn last_flush_at(&self, category: Category) -> Option<Instant> {
        self.lock_queues().get(&category).map(|q| q.last_flush_at)
    }

    /// Categories that currently have a queue, sorted.
    #[must_use]
    pub fn categories(&self) -> Vec<Category> {
        let mut categories: Vec<_> = self.lock_queues().keys().copied().collect();
        categories.sort();
        categories
    }

    /// Sends a drained batch, then runs the `before_transport` hooks.
    async fn dispatch(&self, category: Category, batch: Vec<ReportEvent>, queue_hooks: &Hooks) {
        let events = batch.len();
        match serde_json::to_vec(&batch) {
            Ok(body) => {
                if self.inner.sender.beacon(&body) {
                    debug!(category = %category, events, "Batch handed to beacon");
                } else {
                    match self.inner.sender.post(body).await {
                        Ok(()) => debug!(category = %category, events, "Batch posted"),
                        Err(e) => error!(
                            category = %category,
                            events,
                            error = %MonitorError::Transport(e),
                            "Batch dropped"
                        ),
                    }
                }
            }
            Err(e) => {
                error!(category = %category, events, error = %MonitorError::Json(e), "Batch dropped");
            }
        }

        queue_hooks.notify_before_transport(HookScope::Queue, category, &batch);
        self.inner
            .hooks
            .notify_before_transport(HookScope::Global, category, &batch);
    }

    fn spawn_timer(&self, category: Category, period: Duration) -> Option<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let weak: Weak<TransportInner> = Arc::downgrade(&self.inner);

        Some(runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Transport { inner }.flush(category, false).await;
            }
        }))
    }

    fn lock_queues(&self) -> MutexGuard<'_, HashMap<Category, BreadcrumbQueue>> {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_timers(&self) -> MutexGuard<'_, HashMap<Category, AbortHandle>> {
        self.inner
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Periodic flush timers started by one [`Transport::init_breadcrumb`] call.
///
/// Dropping the value cancels the timers. [`FlushTimers::dispose`] also
/// performs a final forced flush of the covered categories.
#[must_use = "dropping FlushTimers cancels the periodic flushes"]
pub struct FlushTimers {
    transport: Transport,
    categories: Vec<Category>,
    handles: Vec<JoinHandle<()>>,
}

impl fmt::Debug for FlushTimers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushTimers")
            .field("categories", &self.categories)
            .field("timers", &self.handles.len())
            .finish()
    }
}

impl FlushTimers {
    /// Categories initialized by the call that produced these timers.
    #[must_use]
    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    /// Number of timers still running.
    #[must_use]
    pub fn active(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Cancels every timer, force-flushes each covered category and waits
    /// for the resulting deliveries.
    pub async fn dispose(mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        for category in mem::take(&mut self.categories) {
            self.transport.flush(category, true).await;
        }
        self.transport.drain().await;
        info!("Breadcrumb timers disposed");
    }
}

impl Drop for FlushTimers {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
