//! Host environment: device snapshot, page state, background worker.

use std::env;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use std::thread;

use thiserror::Error;

use crate::types::{DeviceInfo, PageInfo};

/// Errors reported by a [`Host`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    /// The environment has no background worker support.
    #[error("background workers are not supported on this host")]
    WorkerUnsupported,

    /// Registering the worker script failed.
    #[error("failed to register worker '{path}': {message}")]
    WorkerRegistration { path: String, message: String },
}

/// The environment the monitor runs in.
pub trait Host: Send + Sync + fmt::Debug {
    /// Snapshot of the device. Called once, when the monitor is built.
    fn device_info(&self) -> DeviceInfo;

    /// Current page state. Called for every event at enrichment time.
    fn page_info(&self) -> PageInfo;

    /// Registers the background worker script at `path`.
    ///
    /// Called once during init. Failure is logged and never fatal.
    fn register_worker(&self, path: &str) -> Result<(), HostError>;
}

/// Host for a native process.
///
/// The page is whatever the application last reported through
/// [`NativeHost::set_page`]; by default it is empty and visible.
#[derive(Debug, Default)]
pub struct NativeHost {
    page: RwLock<PageInfo>,
}

impl NativeHost {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the page that subsequent events are attributed to.
    pub fn set_page(&self, page: PageInfo) {
        *self.page.write().unwrap_or_else(PoisonError::into_inner) = page;
    }
}

impl Host for NativeHost {
    fn device_info(&self) -> DeviceInfo {
        let os = env::consts::OS.to_string();
        let arch = env::consts::ARCH.to_string();
        let user_agent = format!(
            "sightline/{} ({os}; {arch})",
            env!("CARGO_PKG_VERSION")
        );

        DeviceInfo {
            os,
            arch,
            hostname: get_hostname(),
            language: env::var("LANG").ok().and_then(|lang| language_tag(&lang)),
            cpu_count: thread::available_parallelism().map_or(1, |n| n.get()),
            user_agent,
        }
    }

    fn page_info(&self) -> PageInfo {
        self.page
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn register_worker(&self, _path: &str) -> Result<(), HostError> {
        Err(HostError::WorkerUnsupported)
    }
}

/// Gets the system hostname, falling back to "unknown" if it cannot be determined.
fn get_hostname() -> String {
    gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Turns a POSIX locale (`en_US.UTF-8`) into a language tag (`en-US`).
fn language_tag(locale: &str) -> Option<String> {
    let tag = locale.split(['.', '@']).next()?.replace('_', "-");
    match tag.as_str() {
        "" | "C" | "POSIX" => None,
        _ => Some(tag),
    }
}
