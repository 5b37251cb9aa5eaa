//! Signal capture capabilities and the built-in capture plugins.
//!
//! How a signal is observed depends on the environment. A [`Capabilities`]
//! implementation hides that mechanism and hands out plain streams of
//! [`Signal`]s; the built-in [`CapturePlugin`] turns each stream into
//! [`TransportTopic`] emissions on the event bus. The pipeline never sees
//! the interception itself.
//!
//! [`NativeCapabilities`] covers what a native process can observe on its own:
//! panics, reported through a chained panic hook. Hosts that can observe
//! network calls, navigation or performance metrics supply their own
//! implementation, or use [`ChannelCapabilities`] and push signals by hand.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, PanicHookInfo};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::bus::{EventBus, TransportTopic};
use crate::isolate;
use crate::plugin::{Plugin, PluginContext, PluginRegistry};
use crate::types::{Category, TransportEvent};

/// Buffer size of each capture stream. Signals beyond it are dropped.
pub const SIGNAL_BUFFER: usize = 256;

/// A raw observation from a capability.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    /// Becomes the event type (e.g. `fetch`, `route`, `lcp`, `panic`).
    pub kind: String,
    /// Merged into the event's fields.
    pub data: Value,
}

impl Signal {
    #[must_use]
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

/// The observation streams an environment can provide.
///
/// Every method defaults to `None`, meaning "not observable here". Each
/// method may be called once per monitor.
pub trait Capabilities: Send + Sync {
    /// Outgoing network requests.
    fn capture_network(&self) -> Option<mpsc::Receiver<Signal>> {
        None
    }

    /// Route and history changes.
    fn capture_navigation(&self) -> Option<mpsc::Receiver<Signal>> {
        None
    }

    /// Performance metrics.
    fn capture_vitals(&self) -> Option<mpsc::Receiver<Signal>> {
        None
    }

    /// Uncaught errors.
    fn capture_errors(&self) -> Option<mpsc::Receiver<Signal>> {
        None
    }
}

/// Capabilities of a plain native process.
///
/// Only errors are observable: [`capture_errors`](Capabilities::capture_errors)
/// installs a panic hook that reports each panic and then calls the hook that
/// was installed before it. Panics raised inside SDK-isolated callbacks
/// (listeners, hooks, plugin inits, sampling predicates) are not reported.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeCapabilities;

impl Capabilities for NativeCapabilities {
    fn capture_errors(&self) -> Option<mpsc::Receiver<Signal>> {
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            // Panics contained by the SDK's own callback isolation are not
            // application errors. Full or closed streams drop the report.
            if !isolate::is_isolating() {
                let _ = tx.try_send(panic_signal(info));
            }
            previous(info);
        }));
        debug!("Panic hook installed");
        Some(rx)
    }
}

fn panic_signal(info: &PanicHookInfo<'_>) -> Signal {
    let payload = info.payload();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "Box<dyn Any>".to_string());

    Signal::new(
        "panic",
        json!({
            "message": message,
            "location": info.location().map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column())),
            "thread": thread::current().name().unwrap_or("<unnamed>"),
        }),
    )
}

/// Which stream of a [`ChannelCapabilities`] to feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Network,
    Navigation,
    Vitals,
    Errors,
}

/// Capabilities backed by channels the host feeds directly.
///
/// # Example
///
/// ```
/// use serde_json::json;
/// use sightline_sdk::capture::{Capabilities, ChannelCapabilities, Signal, Stream};
///
/// let capabilities = ChannelCapabilities::new();
/// let vitals = capabilities.sender(Stream::Vitals);
/// vitals.try_send(Signal::new("lcp", json!({"value": 1180}))).unwrap();
///
/// let mut rx = capabilities.capture_vitals().unwrap();
/// assert_eq!(rx.try_recv().unwrap().kind, "lcp");
/// ```
pub struct ChannelCapabilities {
    senders: HashMap<Stream, mpsc::Sender<Signal>>,
    receivers: Mutex<HashMap<Stream, mpsc::Receiver<Signal>>>,
}

impl fmt::Debug for ChannelCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCapabilities").finish_non_exhaustive()
    }
}

impl Default for ChannelCapabilities {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelCapabilities {
    #[must_use]
    pub fn new() -> Self {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for stream in [Stream::Network, Stream::Navigation, Stream::Vitals, Stream::Errors] {
            let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
            senders.insert(stream, tx);
            receivers.insert(stream, rx);
        }
        Self {
            senders,
            receivers: Mutex::new(receivers),
        }
    }

    /// Returns a handle for pushing signals into one stream.
    #[must_use]
    pub fn sender(&self, stream: Stream) -> mpsc::Sender<Signal> {
        self.senders[&stream].clone()
    }

    fn take(&self, stream: Stream) -> Option<mpsc::Receiver<Signal>> {
        self.receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&stream)
    }
}

impl Capabilities for ChannelCapabilities {
    fn capture_network(&self) -> Option<mpsc::Receiver<Signal>> {
        self.take(Stream::Network)
    }

    fn capture_navigation(&self) -> Option<mpsc::Receiver<Signal>> {
        self.take(Stream::Navigation)
    }

    fn capture_vitals(&self) -> Option<mpsc::Receiver<Signal>> {
        self.take(Stream::Vitals)
    }

    fn capture_errors(&self) -> Option<mpsc::Receiver<Signal>> {
        self.take(Stream::Errors)
    }
}

/// Built-in plugin forwarding capability streams for one category.
///
/// `user` forwards network and navigation signals, `vitals` forwards vitals,
/// `abnormal` forwards errors. `custom` has no stream; its events come from
/// [`Monitor::track`](crate::monitor::Monitor::track).
pub struct CapturePlugin {
    category: Category,
    capabilities: Arc<dyn Capabilities>,
}

impl fmt::Debug for CapturePlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturePlugin")
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

impl CapturePlugin {
    #[must_use]
    pub fn new(category: Category, capabilities: Arc<dyn Capabilities>) -> Self {
        Self {
            category,
            capabilities,
        }
    }

    fn streams(&self) -> Vec<mpsc::Receiver<Signal>> {
        let caps = &self.capabilities;
        match self.category {
            Category::User => [caps.capture_network(), caps.capture_navigation()]
                .into_iter()
                .flatten()
                .collect(),
            Category::Vitals => caps.capture_vitals().into_iter().collect(),
            Category::Abnormal => caps.capture_errors().into_iter().collect(),
            Category::Custom => Vec::new(),
        }
    }
}

#[async_trait]
impl Plugin for CapturePlugin {
    fn name(&self) -> Category {
        self.category
    }

    async fn init(&self, ctx: PluginContext) -> anyhow::Result<()> {
        let streams = self.streams();
        if streams.is_empty() {
            debug!(category = %self.category, "No capture streams available");
            return Ok(());
        }

        debug!(category = %self.category, streams = streams.len(), "Forwarding capture streams");
        for rx in streams {
            tokio::spawn(forward(self.category, rx, ctx.event_bus.clone()));
        }
        Ok(())
    }
}

/// Emits every signal of a stream on the bus until the stream closes.
async fn forward(category: Category, mut rx: mpsc::Receiver<Signal>, bus: EventBus) {
    while let Some(signal) = rx.recv().await {
        trace!(category = %category, kind = %signal.kind, "Signal captured");
        let event = TransportEvent::new(category, signal.kind).with_data(signal.data);
        bus.emit::<TransportTopic>((category, event)).await;
    }
    debug!(category = %category, "Capture stream closed");
}

/// Registers the built-in capture plugins for a session.
///
/// `abnormal` is always registered. `user` and `vitals` are registered only
/// when the session is sampled in.
pub fn register_builtins(
    registry: &mut PluginRegistry,
    capabilities: &Arc<dyn Capabilities>,
    sampled: bool,
) {
    for category in [Category::User, Category::Vitals, Category::Abnormal] {
        if category.is_sampling_exempt() || sampled {
            registry.register(Arc::new(CapturePlugin::new(category, Arc::clone(capabilities))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_device;
    use std::time::Duration;
    use uuid::Uuid;

    fn ctx(bus: &EventBus) -> PluginContext {
        PluginContext {
            event_bus: bus.clone(),
            config: Value::Null,
            device_info: sample_device(),
            session_id: Uuid::nil(),
            user_id: "user-1".to_string(),
        }
    }

    fn collect(bus: &EventBus) -> mpsc::UnboundedReceiver<(Category, TransportEvent)> {
        let (tx, rx) = mpsc::unbounded_channel();
        bus.on::<TransportTopic, _, _>(move |args| {
            let tx = tx.clone();
            async move {
                tx.send(args)?;
                Ok(())
            }
        });
        rx
    }

    #[test]
    fn builtins_respect_sampling() {
        let caps: Arc<dyn Capabilities> = Arc::new(NativeCapabilities);

        let mut sampled_in = PluginRegistry::new();
        register_builtins(&mut sampled_in, &caps, true);
        assert_eq!(
            sampled_in.names(),
            vec![Category::User, Category::Vitals, Category::Abnormal]
        );

        let mut sampled_out = PluginRegistry::new();
        register_builtins(&mut sampled_out, &caps, false);
        assert_eq!(sampled_out.names(), vec![Category::Abnormal]);
    }

    #[tokio::test]
    async fn user_plugin_forwards_network_and_navigation() {
        let bus = EventBus::new();
        let mut events = collect(&bus);
        let caps = Arc::new(ChannelCapabilities::new());
        let network = caps.sender(Stream::Network);
        let navigation = caps.sender(Stream::Navigation);

        let plugin = CapturePlugin::new(Category::User, caps.clone());
        plugin.init(ctx(&bus)).await.unwrap();

        network
            .send(Signal::new("fetch", json!({"url": "/api", "status": 200})))
            .await
            .unwrap();
        navigation
            .send(Signal::new("route", json!({"to": "/cart"})))
            .await
            .unwrap();

        let mut kinds = Vec::new();
        for _ in 0..2 {
            let (category, event) = tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(category, Category::User);
            assert_eq!(event.category, Category::User);
            kinds.push(event.event_type);
        }
        kinds.sort();
        assert_eq!(kinds, vec!["fetch", "route"]);
    }

    #[tokio::test]
    async fn signal_data_becomes_event_fields() {
        let bus = EventBus::new();
        let mut events = collect(&bus);
        let caps = Arc::new(ChannelCapabilities::new());
        let vitals = caps.sender(Stream::Vitals);

        CapturePlugin::new(Category::Vitals, caps.clone())
            .init(ctx(&bus))
            .await
            .unwrap();
        vitals
            .send(Signal::new("lcp", json!({"value": 1180, "rating": "good"})))
            .await
            .unwrap();

        let (_, event) = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, "lcp");
        assert_eq!(event.data["value"], 1180);
        assert_eq!(event.data["rating"], "good");
    }

    #[tokio::test]
    async fn missing_streams_are_not_an_error() {
        let bus = EventBus::new();
        let plugin = CapturePlugin::new(Category::Vitals, Arc::new(NativeCapabilities));
        assert!(plugin.init(ctx(&bus)).await.is_ok());
    }

    #[test]
    fn channel_streams_are_handed_out_once() {
        let caps = ChannelCapabilities::new();
        assert!(caps.capture_errors().is_some());
        assert!(caps.capture_errors().is_none());
        assert!(caps.capture_network().is_some());
    }

    #[test]
    fn native_capabilities_only_capture_errors() {
        let caps = NativeCapabilities;
        assert!(caps.capture_network().is_none());
        assert!(caps.capture_navigation().is_none());
        assert!(caps.capture_vitals().is_none());
    }

    #[test]
    fn panic_hook_reports_and_chains() {
        let mut rx = NativeCapabilities.capture_errors().unwrap();

        let result = std::thread::Builder::new()
            .name("worker".to_string())
            .spawn(|| panic!("disk full"))
            .unwrap()
            .join();
        assert!(result.is_err());

        // Other tests panic on purpose too; pick out ours.
        let signal = std::iter::from_fn(|| rx.try_recv().ok())
            .find(|s| s.data["message"] == "disk full")
            .expect("panic was reported");
        assert_eq!(signal.kind, "panic");
        assert_eq!(signal.data["thread"], "worker");
        assert!(signal.data["location"].as_str().unwrap().contains("capture.rs"));
    }

    #[test]
    fn panic_hook_skips_isolated_panics() {
        let mut rx = NativeCapabilities.capture_errors().unwrap();

        std::thread::spawn(|| {
            assert!(isolate::call(|| panic!("contained by a hook")).is_err());
        })
        .join()
        .unwrap();
        let _ = std::thread::spawn(|| panic!("escaped to the app")).join();

        let messages: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|s| s.data["message"].as_str().unwrap_or_default().to_string())
            .collect();
        assert!(messages.iter().any(|m| m == "escaped to the app"));
        assert!(!messages.iter().any(|m| m == "contained by a hook"));
    }
}
