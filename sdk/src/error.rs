//! Error types for the Sightline SDK.
//!
//! Only [`Monitor::init`](crate::monitor::Monitor::init) and
//! [`MonitorOptions::from_env`](crate::config::MonitorOptions::from_env) hand
//! errors back to the caller. Everywhere else in the pipeline these values are
//! built for structured logging and the offending event, batch or plugin is
//! dropped, so a failing SDK never breaks the host application.

use thiserror::Error;

use crate::config::ConfigError;
use crate::hooks::{HookScope, HookStage};
use crate::sender::TransportError;
use crate::types::Category;

/// Errors that can occur during monitor operations.
///
/// # Examples
///
/// ```
/// use sightline_sdk::error::MonitorError;
/// use sightline_sdk::types::Category;
///
/// let err = MonitorError::QueueLookup(Category::Vitals);
/// assert_eq!(err.to_string(), "no breadcrumb queue registered for category 'vitals'");
/// ```
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Required options are missing or invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A plugin's `init` failed or panicked.
    #[error("plugin '{plugin}' failed to initialize: {message}")]
    PluginInit { plugin: Category, message: String },

    /// An event was sent for a category without a breadcrumb queue.
    #[error("no breadcrumb queue registered for category '{0}'")]
    QueueLookup(Category),

    /// Delivering a batch failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A lifecycle hook failed.
    #[error("{scope} {stage} hook failed: {message}")]
    Hook {
        scope: HookScope,
        stage: HookStage,
        message: String,
    },

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized `Result` type for monitor operations.
pub type Result<T> = std::result::Result<T, MonitorError>;
