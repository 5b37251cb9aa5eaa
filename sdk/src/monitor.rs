//! The monitor facade.
//!
//! A [`Monitor`] is the single entry point of the SDK. It owns the event bus
//! and the breadcrumb transport, carries the session identity used to enrich
//! every event, and drives plugin initialization.
//!
//! Monitors are ordinary values: build one, pass it (or an `Arc` of it) to
//! the code that needs it. The [`global`](crate::global) module offers a
//! process-wide instance for applications that prefer one.
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use sightline_sdk::config::MonitorOptions;
//! use sightline_sdk::monitor::Monitor;
//! use sightline_sdk::plugin::PluginOptions;
//! use sightline_sdk::types::Category;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), sightline_sdk::MonitorError> {
//!     let monitor = Monitor::new();
//!     monitor
//!         .init(
//!             MonitorOptions::new()
//!                 .dsn_url("https://collect.example/report")
//!                 .user_id("user-42")
//!                 .plugin(PluginOptions::new(Category::Abnormal)),
//!         )
//!         .await?;
//!
//!     monitor.track("checkout", json!({"items": 3})).await;
//!     monitor.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{EventBus, TransportTopic};
use crate::capture::{register_builtins, Capabilities, NativeCapabilities};
use crate::config::{Config, MonitorOptions};
use crate::enrich::Enricher;
use crate::error::Result;
use crate::host::{Host, HostError, NativeHost};
use crate::plugin::{Plugin, PluginContext, PluginOptions, PluginRegistry};
use crate::sender::{BatchSender, HttpSender, RetryPolicy, SenderConfig};
use crate::transport::{FlushTimers, Transport};
use crate::types::{Category, DeviceInfo, TransportEvent};

/// Script registered as the background worker during init.
pub const WORKER_PATH: &str = "/sightline-sw.js";

/// Event type of the synthetic event emitted once init completes.
pub const SESSION_START: &str = "session_start";

/// Builder for [`Monitor`] with injectable environment and delivery.
pub struct MonitorBuilder {
    host: Arc<dyn Host>,
    capabilities: Arc<dyn Capabilities>,
    sender: Option<Arc<dyn BatchSender>>,
    retry_policy: RetryPolicy,
    beacon: bool,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl Default for MonitorBuilder {
    fn default() -> Self {
        Self {
            host: Arc::new(NativeHost::new()),
            capabilities: Arc::new(NativeCapabilities),
            sender: None,
            retry_policy: RetryPolicy::default(),
            beacon: true,
            plugins: Vec::new(),
        }
    }
}

impl MonitorBuilder {
    /// Environment that supplies device and page information.
    #[must_use]
    pub fn host(mut self, host: Arc<dyn Host>) -> Self {
        self.host = host;
        self
    }

    /// Signal sources for the built-in capture plugins.
    #[must_use]
    pub fn capabilities(mut self, capabilities: Arc<dyn Capabilities>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Replaces the HTTP sender built from the DSN.
    #[must_use]
    pub fn sender(mut self, sender: Arc<dyn BatchSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Retry policy of the HTTP sender.
    #[must_use]
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Whether the HTTP sender may use the beacon primitive.
    #[must_use]
    pub fn beacon(mut self, beacon: bool) -> Self {
        self.beacon = beacon;
        self
    }

    /// Registers an additional plugin. It replaces a built-in of the same
    /// category.
    #[must_use]
    pub fn plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Builds the monitor, generating the session id and taking the device
    /// snapshot.
    #[must_use]
    pub fn build(self) -> Monitor {
        let device = self.host.device_info();
        let session_id = Uuid::new_v4();
        debug!(session_id = %session_id, os = %device.os, "Monitor created");

        Monitor {
            session_id,
            device,
            host: self.host,
            capabilities: self.capabilities,
            sender: self.sender,
            retry_policy: self.retry_policy,
            beacon: self.beacon,
            plugins: Mutex::new(self.plugins),
            initializing: AtomicBool::new(false),
            running: OnceLock::new(),
        }
    }
}

/// State created by [`Monitor::init`].
struct Running {
    config: Config,
    bus: EventBus,
    transport: Transport,
    timers: Mutex<Option<FlushTimers>>,
    sampled: bool,
    active: Mutex<Vec<Category>>,
}

/// The SDK facade.
pub struct Monitor {
    session_id: Uuid,
    device: DeviceInfo,
    host: Arc<dyn Host>,
    capabilities: Arc<dyn Capabilities>,
    sender: Option<Arc<dyn BatchSender>>,
    retry_policy: RetryPolicy,
    beacon: bool,
    plugins: Mutex<Vec<Arc<dyn Plugin>>>,
    initializing: AtomicBool,
    running: OnceLock<Running>,
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("session_id", &self.session_id)
            .field("initialized", &self.is_initialized())
            .field("sampled", &self.is_sampled())
            .finish_non_exhaustive()
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor {
    /// Creates a monitor for the native host.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    #[must_use]
    pub fn builder() -> MonitorBuilder {
        MonitorBuilder::default()
    }

    /// Validates the options and starts the pipeline.
    ///
    /// Steps, in order: normalize the options, decide sampling, create the
    /// bus and the breadcrumb queues, route [`TransportTopic`] through
    /// enrichment into the queues, register the background worker, initialize
    /// the requested plugins, and emit a `session_start` custom event.
    ///
    /// Calling `init` again on an initialized monitor logs a warning and
    /// returns `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Config`](crate::MonitorError::Config) if the
    /// options are invalid, before any asynchronous work starts, and
    /// [`MonitorError::Transport`](crate::MonitorError::Transport) if the HTTP
    /// client cannot be created. Plugin failures are logged, not returned.
    pub async fn init(&self, options: MonitorOptions) -> Result<()> {
        if self.is_initialized() || self.initializing.load(Ordering::SeqCst) {
            warn!("Monitor already initialized, ignoring init");
            return Ok(());
        }

        // (1) normalize
        let config = options.normalize()?;
        let sender: Arc<dyn BatchSender> = match &self.sender {
            Some(sender) => Arc::clone(sender),
            None => Arc::new(HttpSender::new(
                SenderConfig::new(config.dsn_url.clone())
                    .with_retry_policy(self.retry_policy.clone())
                    .with_beacon(self.beacon),
            )?),
        };

        if self.initializing.swap(true, Ordering::SeqCst) {
            warn!("Monitor already initialized, ignoring init");
            return Ok(());
        }

        let sampled = config.sampling.is_sampled(&self.device, &mut rand::rng());
        info!(
            dsn_url = %config.dsn_url,
            project_id = %config.project_id,
            framework = %config.framework,
            sampled,
            "Initializing monitor"
        );

        // (2) bus, (3) transport and queues
        let bus = EventBus::new();
        let transport = Transport::new(sender, config.hooks.clone());
        let timers = transport.init_breadcrumb(config.breadcrumb_options());

        // (4) bus -> enrichment -> queue
        let enricher = Enricher::new(
            config.project_id.clone(),
            config.user_id.clone(),
            self.session_id,
            self.device.clone(),
            Arc::clone(&self.host),
        );
        {
            let transport = transport.clone();
            bus.on::<TransportTopic, _, _>(move |(category, event)| {
                let transport = transport.clone();
                let report = enricher.enrich(event);
                async move {
                    transport.send(category, report).await;
                    Ok(())
                }
            });
        }

        // (5) background worker
        match self.host.register_worker(WORKER_PATH) {
            Ok(()) => debug!(path = WORKER_PATH, "Background worker registered"),
            Err(HostError::WorkerUnsupported) => {
                debug!("Background worker not supported on this host");
            }
            Err(e) => warn!(error = %e, "Background worker registration failed"),
        }

        let requested: Vec<PluginOptions> = config
            .plugins
            .iter()
            .filter(|p| sampled || p.name.is_sampling_exempt())
            .cloned()
            .collect();
        let base_ctx = PluginContext {
            event_bus: bus.clone(),
            config: Value::Null,
            device_info: self.device.clone(),
            session_id: self.session_id,
            user_id: config.user_id.clone(),
        };
        let framework = config.framework;

        let running = Running {
            config,
            bus: bus.clone(),
            transport,
            timers: Mutex::new(Some(timers)),
            sampled,
            active: Mutex::new(Vec::new()),
        };
        let running = match self.running.set(running) {
            Ok(()) => self.running.get(),
            Err(_) => None,
        };
        let Some(running) = running else {
            warn!("Monitor already initialized, ignoring init");
            return Ok(());
        };

        // (6) plugins
        let mut registry = PluginRegistry::new();
        register_builtins(&mut registry, &self.capabilities, sampled);
        for plugin in self.lock_plugins().iter() {
            registry.register(Arc::clone(plugin));
        }
        let active = registry.init_requested(&requested, &base_ctx).await;
        *lock(&running.active) = active.clone();

        // (7) session start
        let session_start = TransportEvent::new(Category::Custom, SESSION_START)
            .with_field("framework", framework.to_string())
            .with_field("sampled", sampled)
            .with_field(
                "plugins",
                active.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
            );
        bus.emit::<TransportTopic>((Category::Custom, session_start))
            .await;

        info!(
            session_id = %self.session_id,
            plugins = ?active,
            "Monitor initialized"
        );
        Ok(())
    }

    /// Records a custom event.
    ///
    /// Before [`Monitor::init`] has run the call is logged and dropped.
    pub async fn track(&self, name: impl Into<String>, data: Value) {
        let name = name.into();
        let Some(running) = self.running.get() else {
            warn!(event = %name, "Monitor not initialized, dropping tracked event");
            return;
        };

        let event = TransportEvent::new(Category::Custom, name).with_data(data);
        running
            .bus
            .emit::<TransportTopic>((Category::Custom, event))
            .await;
    }

    /// Registers a plugin for the next [`Monitor::init`].
    ///
    /// A later registration for the same category wins. Plugins registered
    /// after init are not started.
    pub fn register_plugin(&self, plugin: Arc<dyn Plugin>) {
        if self.is_initialized() {
            warn!(plugin = %plugin.name(), "Monitor already initialized, plugin will not start");
        }
        self.lock_plugins().push(plugin);
    }

    /// Cancels the flush timers, flushes every queue and waits until the
    /// flushed batches have been delivered or dropped.
    pub async fn shutdown(&self) {
        let Some(running) = self.running.get() else {
            debug!("Monitor not initialized, nothing to shut down");
            return;
        };

        let timers = lock(&running.timers).take();
        match timers {
            Some(timers) => timers.dispose().await,
            // Already shut down once; flush whatever was tracked since.
            None => {
                running.transport.flush_all().await;
                running.transport.drain().await;
            }
        }
        info!(session_id = %self.session_id, "Monitor shut down");
    }

    /// Normalized configuration, once initialized.
    #[must_use]
    pub fn config(&self) -> Option<&Config> {
        self.running.get().map(|r| &r.config)
    }

    /// Event bus, once initialized.
    #[must_use]
    pub fn event_bus(&self) -> Option<&EventBus> {
        self.running.get().map(|r| &r.bus)
    }

    /// Breadcrumb transport, once initialized.
    #[must_use]
    pub fn transport(&self) -> Option<&Transport> {
        self.running.get().map(|r| &r.transport)
    }

    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    #[must_use]
    pub fn device_info(&self) -> &DeviceInfo {
        &self.device
    }

    /// Session sampling decision, once initialized.
    #[must_use]
    pub fn is_sampled(&self) -> Option<bool> {
        self.running.get().map(|r| r.sampled)
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.running.get().is_some()
    }

    /// Plugins whose init succeeded.
    #[must_use]
    pub fn active_plugins(&self) -> Vec<Category> {
        self.running
            .get()
            .map(|r| lock(&r.active).clone())
            .unwrap_or_default()
    }

    fn lock_plugins(&self) -> MutexGuard<'_, Vec<Arc<dyn Plugin>>> {
        lock(&self.plugins)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
