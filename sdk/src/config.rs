//! Configuration module for the Sightline SDK.
//!
//! Options are collected in a [`MonitorOptions`] builder, either in code or
//! from environment variables, and normalized into a [`Config`] when the
//! monitor is initialized.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `SIGHTLINE_DSN_URL` | Yes | - | Collection endpoint (e.g., `https://collect.example/report`) |
//! | `SIGHTLINE_USER_ID` | Yes | - | User identifier |
//! | `SIGHTLINE_PROJECT_ID` | No | `default` | Project identifier |
//! | `SIGHTLINE_FRAMEWORK` | No | `normal` | `normal`, `react` or `vue` |
//! | `SIGHTLINE_SAMPLE_RATE` | No | 1 | Session sampling probability (0-1) |
//! | `SIGHTLINE_PLUGINS` | No | (none) | Comma-separated plugin categories |
//! | `SIGHTLINE_UPLOAD_INTERVAL_SECS` | No | 30 | Default seconds between periodic flushes |
//!
//! # Example
//!
//! ```no_run
//! use sightline_sdk::config::MonitorOptions;
//!
//! let options = MonitorOptions::from_env().expect("Failed to load configuration");
//! let config = options.normalize().expect("Invalid configuration");
//! println!("Reporting to: {}", config.dsn_url);
//! ```

use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hooks::Hooks;
use crate::plugin::PluginOptions;
use crate::sampling::{SamplePredicate, SamplingPolicy};
use crate::transport::{BreadcrumbOptions, DEFAULT_UPLOAD_INTERVAL};
use crate::types::{Category, DeviceInfo};

/// Default project identifier.
const DEFAULT_PROJECT_ID: &str = "default";

/// Default session sampling rate.
const DEFAULT_SAMPLE_RATE: f64 = 1.0;

/// Errors that can occur while building the configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A required option was not provided.
    #[error("missing required option: {0}")]
    MissingField(&'static str),

    /// An option has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// UI framework of the host application, reported with the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    #[default]
    Normal,
    React,
    Vue,
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("normal"),
            Self::React => f.write_str("react"),
            Self::Vue => f.write_str("vue"),
        }
    }
}

impl FromStr for Framework {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "react" => Ok(Self::React),
            "vue" => Ok(Self::Vue),
            other => Err(ConfigError::InvalidValue {
                key: "framework".to_string(),
                message: format!("expected normal, react or vue, got '{other}'"),
            }),
        }
    }
}

/// Options accepted by [`Monitor::init`](crate::monitor::Monitor::init).
///
/// Only `dsn_url` and `user_id` are required.
///
/// # Example
///
/// ```
/// use sightline_sdk::config::{Framework, MonitorOptions};
/// use sightline_sdk::plugin::PluginOptions;
/// use sightline_sdk::types::Category;
///
/// let config = MonitorOptions::new()
///     .dsn_url("https://collect.example/report")
///     .user_id("user-42")
///     .framework(Framework::React)
///     .plugin(PluginOptions::new(Category::Abnormal))
///     .sample_rate(0.25)
///     .normalize()
///     .unwrap();
///
/// assert_eq!(config.project_id, "default");
/// ```
#[derive(Clone, Default)]
pub struct MonitorOptions {
    pub dsn_url: Option<String>,
    pub user_id: Option<String>,
    pub project_id: Option<String>,
    pub framework: Option<Framework>,
    pub plugins: Vec<PluginOptions>,
    pub hooks: Hooks,
    pub sample_rate: Option<f64>,
    pub sampler: Option<SamplePredicate>,
    pub upload_interval: Option<Duration>,
}

impl fmt::Debug for MonitorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorOptions")
            .field("dsn_url", &self.dsn_url)
            .field("user_id", &self.user_id)
            .field("project_id", &self.project_id)
            .field("framework", &self.framework)
            .field("plugins", &self.plugins)
            .field("hooks", &self.hooks)
            .field("sample_rate", &self.sample_rate)
            .field("sampler", &self.sampler.is_some())
            .field("upload_interval", &self.upload_interval)
            .finish()
    }
}

impl MonitorOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn dsn_url(mut self, dsn_url: impl Into<String>) -> Self {
        self.dsn_url = Some(dsn_url.into());
        self
    }

    #[must_use]
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    #[must_use]
    pub fn framework(mut self, framework: Framework) -> Self {
        self.framework = Some(framework);
        self
    }

    /// Requests a plugin. Requesting a category twice keeps the later entry.
    #[must_use]
    pub fn plugin(mut self, plugin: PluginOptions) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Sets the global hooks, applied after each queue's own hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub fn sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }

    /// Sets a sampling predicate. It takes precedence over the sample rate.
    #[must_use]
    pub fn sampler<F>(mut self, sampler: F) -> Self
    where
        F: Fn(&DeviceInfo) -> bool + Send + Sync + 'static,
    {
        self.sampler = Some(Arc::new(sampler));
        self
    }

    /// Default flush period for queues that declare none.
    #[must_use]
    pub fn upload_interval(mut self, interval: Duration) -> Self {
        self.upload_interval = Some(interval);
        self
    }

    /// Creates options by parsing environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - `SIGHTLINE_DSN_URL` or `SIGHTLINE_USER_ID` is not set
    /// - `SIGHTLINE_FRAMEWORK` is not a known framework
    /// - `SIGHTLINE_SAMPLE_RATE` is not a number
    /// - `SIGHTLINE_PLUGINS` names an unknown category
    /// - `SIGHTLINE_UPLOAD_INTERVAL_SECS` is not a positive integer
    pub fn from_env() -> Result<Self, ConfigError> {
        // Required: SIGHTLINE_DSN_URL
        let dsn_url =
            env::var("SIGHTLINE_DSN_URL").map_err(|_| ConfigError::MissingField("SIGHTLINE_DSN_URL"))?;

        // Required: SIGHTLINE_USER_ID
        let user_id =
            env::var("SIGHTLINE_USER_ID").map_err(|_| ConfigError::MissingField("SIGHTLINE_USER_ID"))?;

        let mut options = Self::new().dsn_url(dsn_url).user_id(user_id);

        // Optional: SIGHTLINE_PROJECT_ID (default: "default")
        options.project_id = env::var("SIGHTLINE_PROJECT_ID").ok();

        // Optional: SIGHTLINE_FRAMEWORK (default: normal)
        if let Ok(val) = env::var("SIGHTLINE_FRAMEWORK") {
            let framework = val.parse::<Framework>().map_err(|_| ConfigError::InvalidValue {
                key: "SIGHTLINE_FRAMEWORK".to_string(),
                message: format!("expected normal, react or vue, got '{val}'"),
            })?;
            options.framework = Some(framework);
        }

        // Optional: SIGHTLINE_SAMPLE_RATE (default: 1, range checked on normalize)
        if let Ok(val) = env::var("SIGHTLINE_SAMPLE_RATE") {
            let rate = val.trim().parse::<f64>().map_err(|_| ConfigError::InvalidValue {
                key: "SIGHTLINE_SAMPLE_RATE".to_string(),
                message: format!("expected number between 0 and 1, got '{val}'"),
            })?;
            options.sample_rate = Some(rate);
        }

        // Optional: SIGHTLINE_PLUGINS (default: none)
        if let Ok(val) = env::var("SIGHTLINE_PLUGINS") {
            for name in val.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let category = name.parse::<Category>().map_err(|e| ConfigError::InvalidValue {
                    key: "SIGHTLINE_PLUGINS".to_string(),
                    message: e.to_string(),
                })?;
                options.plugins.push(PluginOptions::new(category));
            }
        }

        // Optional: SIGHTLINE_UPLOAD_INTERVAL_SECS (default: 30, must be >= 1)
        if let Ok(val) = env::var("SIGHTLINE_UPLOAD_INTERVAL_SECS") {
            let secs = val.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                key: "SIGHTLINE_UPLOAD_INTERVAL_SECS".to_string(),
                message: format!("expected positive integer, got '{val}'"),
            })?;
            if secs == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "SIGHTLINE_UPLOAD_INTERVAL_SECS".to_string(),
                    message: "upload interval must be at least 1 second".to_string(),
                });
            }
            options.upload_interval = Some(Duration::from_secs(secs));
        }

        Ok(options)
    }

    /// Validates the options and fills in defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when `dsn_url` or `user_id` is
    /// absent or blank, and [`ConfigError::InvalidValue`] for a malformed URL,
    /// a sample rate outside `[0, 1]`, or a zero capacity or interval.
    pub fn normalize(self) -> Result<Config, ConfigError> {
        let dsn_url = required(self.dsn_url, "dsn_url")?;
        let url = Url::parse(&dsn_url).map_err(|e| ConfigError::InvalidValue {
            key: "dsn_url".to_string(),
            message: format!("{e}: '{dsn_url}'"),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidValue {
                key: "dsn_url".to_string(),
                message: format!("expected http or https URL, got scheme '{}'", url.scheme()),
            });
        }

        let user_id = required(self.user_id, "user_id")?;

        let sample_rate = self.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE);
        if !(0.0..=1.0).contains(&sample_rate) {
            return Err(ConfigError::InvalidValue {
                key: "sample_rate".to_string(),
                message: format!("must be between 0 and 1, got {sample_rate}"),
            });
        }

        let upload_interval = self.upload_interval.unwrap_or(DEFAULT_UPLOAD_INTERVAL);
        if upload_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "upload_interval".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        let mut plugins: Vec<PluginOptions> = Vec::with_capacity(self.plugins.len());
        for plugin in self.plugins {
            if let Some(breadcrumbs) = &plugin.breadcrumbs {
                if breadcrumbs.capacity == Some(0) {
                    return Err(ConfigError::InvalidValue {
                        key: format!("plugins.{}.capacity", plugin.name),
                        message: "must be greater than 0".to_string(),
                    });
                }
                if breadcrumbs.upload_interval.is_some_and(|d| d.is_zero()) {
                    return Err(ConfigError::InvalidValue {
                        key: format!("plugins.{}.upload_interval", plugin.name),
                        message: "must be greater than 0".to_string(),
                    });
                }
            }
            match plugins.iter_mut().find(|p| p.name == plugin.name) {
                Some(existing) => *existing = plugin,
                None => plugins.push(plugin),
            }
        }

        Ok(Config {
            dsn_url,
            user_id,
            project_id: self
                .project_id
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_PROJECT_ID.to_string()),
            framework: self.framework.unwrap_or_default(),
            plugins,
            hooks: self.hooks,
            sampling: SamplingPolicy::from_parts(sample_rate, self.sampler),
            sample_rate,
            upload_interval,
        })
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ConfigError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::MissingField(field))
}

/// Normalized monitor configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Collection endpoint.
    pub dsn_url: String,

    /// User the session belongs to.
    pub user_id: String,

    /// Project the events belong to.
    pub project_id: String,

    /// Framework of the host application.
    pub framework: Framework,

    /// Requested plugins, one entry per category.
    pub plugins: Vec<PluginOptions>,

    /// Global hooks.
    pub hooks: Hooks,

    /// Session sampling policy.
    pub sampling: SamplingPolicy,

    /// Configured sample rate, kept for reporting.
    pub sample_rate: f64,

    /// Flush period for queues that declare none.
    pub upload_interval: Duration,
}

impl Config {
    /// Queue settings for every requested plugin, plus the `custom` queue
    /// that [`Monitor::track`](crate::monitor::Monitor::track) feeds.
    #[must_use]
    pub fn breadcrumb_options(&self) -> Vec<BreadcrumbOptions> {
        let mut options: Vec<BreadcrumbOptions> = self
            .plugins
            .iter()
            .map(|p| p.breadcrumb_options(self.upload_interval))
            .collect();
        if !options.iter().any(|o| o.category == Category::Custom) {
            options.push(PluginOptions::new(Category::Custom).breadcrumb_options(self.upload_interval));
        }
        options
    }
}
