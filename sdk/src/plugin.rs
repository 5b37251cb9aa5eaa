//! Plugin registration and initialization.
//!
//! A plugin is a signal producer. It receives a [`PluginContext`] once, at
//! startup, and from then on reports signals by emitting [`TransportTopic`]
//! on the context's event bus. Plugins never touch the queues directly.
//!
//! [`TransportTopic`]: crate::bus::TransportTopic

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::error::MonitorError;
use crate::hooks::Hooks;
use crate::isolate;
use crate::transport::{default_capacity, BreadcrumbOptions};
use crate::types::{Category, DeviceInfo};

/// What a plugin receives when it is initialized.
#[derive(Debug, Clone)]
pub struct PluginContext {
    /// Bus to emit [`TransportTopic`](crate::bus::TransportTopic) on.
    pub event_bus: EventBus,
    /// Plugin-specific options from [`PluginOptions::options`].
    pub config: Value,
    /// Device snapshot taken when the monitor was built.
    pub device_info: DeviceInfo,
    /// Session of the monitor.
    pub session_id: Uuid,
    /// User the session belongs to.
    pub user_id: String,
}

/// A signal producer for one category.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Category this plugin produces. Also its registry key.
    fn name(&self) -> Category;

    /// Starts the plugin. An error is logged and only disables this plugin.
    async fn init(&self, ctx: PluginContext) -> anyhow::Result<()>;
}

/// Queue settings a plugin declares for its category.
#[derive(Debug, Clone, Default)]
pub struct BreadcrumbSettings {
    /// Events per batch. Category default when `None`.
    pub capacity: Option<usize>,
    /// Flush period. The monitor-wide interval when `None`.
    pub upload_interval: Option<Duration>,
    /// Hooks for this queue only.
    pub hooks: Hooks,
}

/// A plugin requested in the monitor options.
#[derive(Debug, Clone)]
pub struct PluginOptions {
    /// Category of the requested plugin.
    pub name: Category,
    /// Queue settings; defaults apply when `None`.
    pub breadcrumbs: Option<BreadcrumbSettings>,
    /// Passed to the plugin as [`PluginContext::config`].
    pub options: Value,
}

impl PluginOptions {
    #[must_use]
    pub fn new(name: Category) -> Self {
        Self {
            name,
            breadcrumbs: None,
            options: Value::Null,
        }
    }

    #[must_use]
    pub fn with_breadcrumbs(mut self, breadcrumbs: BreadcrumbSettings) -> Self {
        self.breadcrumbs = Some(breadcrumbs);
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    /// Queue settings for this plugin's category, filling in defaults.
    #[must_use]
    pub fn breadcrumb_options(&self, default_interval: Duration) -> BreadcrumbOptions {
        let settings = self.breadcrumbs.clone().unwrap_or_default();
        BreadcrumbOptions {
            category: self.name,
            capacity: settings
                .capacity
                .unwrap_or_else(|| default_capacity(self.name)),
            upload_interval: Some(settings.upload_interval.unwrap_or(default_interval)),
            hooks: settings.hooks,
        }
    }
}

type InitFn = dyn Fn(PluginContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// A plugin built from a closure.
///
/// # Example
///
/// ```
/// use sightline_sdk::bus::TransportTopic;
/// use sightline_sdk::plugin::FnPlugin;
/// use sightline_sdk::types::{Category, TransportEvent};
///
/// let plugin = FnPlugin::new(Category::Vitals, |ctx| async move {
///     let event = TransportEvent::new(Category::Vitals, "boot").with_field("ms", 12);
///     ctx.event_bus
///         .emit::<TransportTopic>((Category::Vitals, event))
///         .await;
///     Ok(())
/// });
/// ```
pub struct FnPlugin {
    name: Category,
    init: Box<InitFn>,
}

impl FnPlugin {
    pub fn new<F, Fut>(name: Category, init: F) -> Self
    where
        F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name,
            init: Box::new(move |ctx| init(ctx).boxed()),
        }
    }
}

impl fmt::Debug for FnPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPlugin").field("name", &self.name).finish()
    }
}

#[async_trait]
impl Plugin for FnPlugin {
    fn name(&self) -> Category {
        self.name
    }

    async fn init(&self, ctx: PluginContext) -> anyhow::Result<()> {
        (self.init)(ctx).await
    }
}

/// Plugins keyed by category.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: HashMap<Category, Arc<dyn Plugin>>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}

impl PluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin under its category. A later registration for the
    /// same category replaces the earlier one.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        let name = plugin.name();
        if self.plugins.insert(name, plugin).is_some() {
            debug!(plugin = %name, "Plugin registration replaced");
        }
    }

    #[must_use]
    pub fn get(&self, name: Category) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(&name).cloned()
    }

    /// Registered categories, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<Category> {
        let mut names: Vec<_> = self.plugins.keys().copied().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Initializes every requested plugin that is registered.
    ///
    /// All inits run concurrently. Requested plugins that are not registered
    /// are skipped. A plugin whose init fails or panics is logged; the others
    /// are unaffected. Returns the categories whose init succeeded, in request
    /// order.
    ///
    /// `base` supplies the shared context fields; each plugin gets its own
    /// `options` as [`PluginContext::config`].
    pub async fn init_requested(
        &self,
        requested: &[PluginOptions],
        base: &PluginContext,
    ) -> Vec<Category> {
        let inits = requested.iter().filter_map(|options| {
            let Some(plugin) = self.get(options.name) else {
                debug!(plugin = %options.name, "Requested plugin not registered, skipping");
                return None;
            };
            let ctx = PluginContext {
                config: options.options.clone(),
                ..base.clone()
            };
            let name = options.name;
            Some(async move {
                let outcome = isolate::poll(plugin.init(ctx)).await;
                let failure = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(format!("{e:#}")),
                    Err(_) => Some("init panicked".to_string()),
                };
                match failure {
                    None => {
                        info!(plugin = %name, "Plugin initialized");
                        Some(name)
                    }
                    Some(message) => {
                        let err = MonitorError::PluginInit {
                            plugin: name,
                            message,
                        };
                        warn!(error = %err, "Plugin disabled");
                        None
                    }
                }
            })
        });

        join_all(inits).await.into_iter().flatten().collect()
    }
}
