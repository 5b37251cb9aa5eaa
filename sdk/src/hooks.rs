//! Lifecycle hooks for observing and transforming events.
//!
//! Hooks can be attached to a single breadcrumb queue or globally through the
//! monitor configuration. Two points in an event's life are exposed:
//!
//! - `before_push` sees each event before it is appended to its queue and may
//!   return a replacement.
//! - `before_transport` sees each batch after its send attempt. It is meant
//!   for side effects (metrics, audit logging); nothing it does changes the
//!   batch that was sent.
//!
//! A hook that fails or panics is logged and skipped; the event or batch
//! continues through the pipeline unchanged.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::error::MonitorError;
use crate::isolate;
use crate::types::{Category, ReportEvent};

/// Hook invoked before an event is queued. `Ok(Some(_))` replaces the event.
pub type BeforePushHook =
    Arc<dyn Fn(&ReportEvent) -> anyhow::Result<Option<ReportEvent>> + Send + Sync>;

/// Hook invoked with a batch after its send attempt.
pub type BeforeTransportHook = Arc<dyn Fn(&[ReportEvent]) -> anyhow::Result<()> + Send + Sync>;

/// Which lifecycle point a hook is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    BeforePush,
    BeforeTransport,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BeforePush => f.write_str("beforePush"),
            Self::BeforeTransport => f.write_str("beforeTransport"),
        }
    }
}

/// Where a set of hooks was declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookScope {
    /// Declared on one category's breadcrumb settings.
    Queue,
    /// Declared on the monitor options, applies to every category.
    Global,
}

impl fmt::Display for HookScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue => f.write_str("queue"),
            Self::Global => f.write_str("global"),
        }
    }
}

/// A pair of optional lifecycle hooks.
///
/// # Example
///
/// ```
/// use sightline_sdk::hooks::Hooks;
///
/// let hooks = Hooks::new()
///     .before_push(|event| {
///         let mut event = event.clone();
///         event.event.data.remove("password");
///         Ok(Some(event))
///     })
///     .before_transport(|batch| {
///         tracing::debug!(events = batch.len(), "Batch left the queue");
///         Ok(())
///     });
///
/// assert!(!hooks.is_empty());
/// ```
#[derive(Clone, Default)]
pub struct Hooks {
    before_push: Option<BeforePushHook>,
    before_transport: Option<BeforeTransportHook>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("before_push", &self.before_push.is_some())
            .field("before_transport", &self.before_transport.is_some())
            .finish()
    }
}

impl Hooks {
    /// Creates an empty hook set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the `before_push` hook.
    #[must_use]
    pub fn before_push<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ReportEvent) -> anyhow::Result<Option<ReportEvent>> + Send + Sync + 'static,
    {
        self.before_push = Some(Arc::new(hook));
        self
    }

    /// Sets the `before_transport` hook.
    #[must_use]
    pub fn before_transport<F>(mut self, hook: F) -> Self
    where
        F: Fn(&[ReportEvent]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.before_transport = Some(Arc::new(hook));
        self
    }

    /// Returns true if neither hook is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.before_push.is_none() && self.before_transport.is_none()
    }

    /// Runs the `before_push` hook, returning the event to queue.
    pub(crate) fn apply_before_push(
        &self,
        scope: HookScope,
        category: Category,
        event: ReportEvent,
    ) -> ReportEvent {
        let Some(hook) = &self.before_push else {
            return event;
        };

        match isolate::call(|| hook(&event)) {
            Ok(Ok(Some(replacement))) => replacement,
            Ok(Ok(None)) => event,
            Ok(Err(e)) => {
                log_hook_failure(scope, HookStage::BeforePush, category, e.to_string());
                event
            }
            Err(_) => {
                log_hook_failure(scope, HookStage::BeforePush, category, "hook panicked".into());
                event
            }
        }
    }

    /// Runs the `before_transport` hook on a batch that was just sent.
    pub(crate) fn notify_before_transport(
        &self,
        scope: HookScope,
        category: Category,
        batch: &[ReportEvent],
    ) {
        let Some(hook) = &self.before_transport else {
            return;
        };

        match isolate::call(|| hook(batch)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log_hook_failure(scope, HookStage::BeforeTransport, category, e.to_string());
            }
            Err(_) => {
                log_hook_failure(
                    scope,
                    HookStage::BeforeTransport,
                    category,
                    "hook panicked".into(),
                );
            }
        }
    }
}

fn log_hook_failure(scope: HookScope, stage: HookStage, category: Category, message: String) {
    let err = MonitorError::Hook {
        scope,
        stage,
        message,
    };
    warn!(category = %category, error = %err, "Hook failed, continuing without it");
}
