//! Sightline SDK - client-side telemetry pipeline.
//!
//! This crate captures error, performance and user-interaction signals inside
//! a running application and delivers them, batched, to a collection
//! endpoint.
//!
//! # Overview
//!
//! Signal sources (plugins) emit events on a typed [`bus`]. A single
//! subscriber enriches each event with session and environment data and
//! pushes it into its category's breadcrumb queue ([`transport`]). A queue is
//! flushed when it reaches its capacity or when its upload interval elapses;
//! the batch is serialized as a JSON array and handed to the [`sender`].
//!
//! Observability must not break the observed application: apart from
//! [`Monitor::init`] rejecting invalid options, every failure is logged
//! through `tracing` and the affected event or batch is dropped.
//!
//! # Modules
//!
//! - [`types`]: Event, device and page types
//! - [`bus`]: Typed asynchronous publish/subscribe
//! - [`hooks`]: Before-push and before-transport hooks
//! - [`transport`]: Per-category breadcrumb queues and flushing
//! - [`sender`]: Beacon and HTTP POST delivery with retry
//! - [`sampling`]: Session-level sampling
//! - [`plugin`]: Plugin trait, context and registry
//! - [`capture`]: Capture capabilities and built-in plugins
//! - [`host`]: Host environment (device, page, background worker)
//! - [`enrich`]: Event enrichment
//! - [`config`]: Options, environment loading and normalization
//! - [`error`]: Error types
//! - [`monitor`]: The monitor facade
//! - [`global`]: Optional process-wide monitor

pub mod bus;
pub mod capture;
pub mod config;
pub mod enrich;
pub mod error;
pub mod global;
pub mod hooks;
pub mod host;
mod isolate;
pub mod monitor;
pub mod plugin;
pub mod sampling;
pub mod sender;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_support;

pub use bus::{EventBus, ListenerId, Topic, TransportTopic};
pub use capture::{Capabilities, ChannelCapabilities, NativeCapabilities, Signal, Stream};
pub use config::{Config, ConfigError, Framework, MonitorOptions};
pub use error::{MonitorError, Result};
pub use hooks::Hooks;
pub use host::{Host, HostError, NativeHost};
pub use monitor::{Monitor, MonitorBuilder};
pub use plugin::{BreadcrumbSettings, FnPlugin, Plugin, PluginContext, PluginOptions};
pub use sampling::SamplingPolicy;
pub use sender::{BatchSender, HttpSender, RetryPolicy, SenderConfig, TransportError};
pub use transport::{BreadcrumbOptions, FlushTimers, Transport};
pub use types::{Category, DeviceInfo, PageInfo, ReportEvent, TransportEvent, Visibility};
