//! Process-wide monitor.
//!
//! Convenience for applications that want one monitor reachable from
//! anywhere. Nothing else in the crate reads it; libraries should take a
//! [`Monitor`] explicitly instead.

use std::sync::OnceLock;

use serde_json::Value;
use tracing::warn;

use crate::config::MonitorOptions;
use crate::error::Result;
use crate::monitor::Monitor;

static MONITOR: OnceLock<Monitor> = OnceLock::new();

/// Installs a monitor as the process-wide instance.
///
/// Returns the monitor back if one is already installed.
pub fn install(monitor: Monitor) -> std::result::Result<&'static Monitor, Monitor> {
    MONITOR.set(monitor)?;
    Ok(monitor_ref())
}

/// Initializes the process-wide monitor, creating a native one if none was
/// installed.
///
/// # Errors
///
/// Same as [`Monitor::init`].
pub async fn init(options: MonitorOptions) -> Result<()> {
    monitor_ref().init(options).await
}

/// Tracks a custom event on the process-wide monitor.
///
/// Dropped with a warning if no monitor was installed or initialized.
pub async fn track(name: impl Into<String>, data: Value) {
    match MONITOR.get() {
        Some(monitor) => monitor.track(name, data).await,
        None => warn!(event = %name.into(), "No global monitor, dropping tracked event"),
    }
}

/// Shuts down the process-wide monitor, if any.
pub async fn shutdown() {
    if let Some(monitor) = MONITOR.get() {
        monitor.shutdown().await;
    }
}

/// The process-wide monitor, if one was installed.
#[must_use]
pub fn monitor() -> Option<&'static Monitor> {
    MONITOR.get()
}

fn monitor_ref() -> &'static Monitor {
    MONITOR.get_or_init(Monitor::new)
}
