//! Event types for the Sightline pipeline.
//!
//! This module defines the records that flow from capture plugins through the
//! event bus into the breadcrumb queues, and the enriched shape that is
//! finally posted to the collection endpoint. All types serialize to
//! camelCase JSON.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Signal class of an event.
///
/// The category decides which breadcrumb queue an event lands in and which
/// sampling rule applies to the plugin producing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// User interaction: clicks, navigation, network calls.
    User,
    /// Performance metrics.
    Vitals,
    /// Errors and crashes.
    Abnormal,
    /// Manually tracked events.
    Custom,
}

impl Category {
    /// Every category, in declaration order.
    pub const ALL: [Category; 4] = [
        Category::User,
        Category::Vitals,
        Category::Abnormal,
        Category::Custom,
    ];

    /// Returns the wire name of the category.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Vitals => "vitals",
            Self::Abnormal => "abnormal",
            Self::Custom => "custom",
        }
    }

    /// Returns true if plugins of this category ignore session sampling.
    ///
    /// Errors are always collected, even for sessions that were sampled out.
    #[must_use]
    pub fn is_sampling_exempt(self) -> bool {
        matches!(self, Self::Abnormal)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown category name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown category '{0}' (expected user, vitals, abnormal or custom)")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "vitals" => Ok(Self::Vitals),
            "abnormal" => Ok(Self::Abnormal),
            "custom" => Ok(Self::Custom),
            other => Err(UnknownCategory(other.to_string())),
        }
    }
}

/// Top-level keys of a serialized [`ReportEvent`].
///
/// Plugin fields with one of these names are stored with a leading `_`
/// (`type` becomes `_type`) so they cannot shadow the real value on the wire.
pub const RESERVED_FIELDS: [&str; 11] = [
    "category",
    "type",
    "emitTime",
    "projectId",
    "userId",
    "sessionId",
    "pageUrl",
    "timestamp",
    "sdkVersion",
    "device",
    "page",
];

fn insert_field(data: &mut Map<String, Value>, key: String, value: Value) {
    if RESERVED_FIELDS.contains(&key.as_str()) {
        data.insert(format!("_{key}"), value);
    } else {
        data.insert(key, value);
    }
}

/// An event as produced by a plugin.
///
/// Category-specific fields live in `data` and are flattened into the JSON
/// object next to the fixed fields. Keys listed in [`RESERVED_FIELDS`] are
/// renamed on the way in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportEvent {
    /// Signal class of the event.
    pub category: Category,

    /// Event type within the category (e.g. `click`, `lcp`, `panic`).
    #[serde(rename = "type")]
    pub event_type: String,

    /// When the plugin emitted the event.
    pub emit_time: DateTime<Utc>,

    /// Category-specific fields.
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl TransportEvent {
    /// Creates an event with no extra fields, stamped with the current time.
    ///
    /// # Examples
    ///
    /// ```
    /// use sightline_sdk::types::{Category, TransportEvent};
    ///
    /// let event = TransportEvent::new(Category::User, "click")
    ///     .with_field("selector", "#buy");
    ///
    /// assert_eq!(event.event_type, "click");
    /// assert_eq!(event.data["selector"], "#buy");
    /// ```
    #[must_use]
    pub fn new(category: Category, event_type: impl Into<String>) -> Self {
        Self {
            category,
            event_type: event_type.into(),
            emit_time: Utc::now(),
            data: Map::new(),
        }
    }

    /// Adds a category-specific field, replacing any previous value.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        insert_field(&mut self.data, key.into(), value.into());
        self
    }

    /// Merges a JSON value into the event's fields.
    ///
    /// Objects are merged key by key. Any other value is stored under `data`.
    #[must_use]
    pub fn with_data(mut self, value: Value) -> Self {
        match value {
            Value::Object(map) => {
                for (key, value) in map {
                    insert_field(&mut self.data, key, value);
                }
            }
            Value::Null => {}
            other => {
                self.data.insert("data".to_string(), other);
            }
        }
        self
    }

    /// Renames reserved keys written to `data` directly, e.g. by a hook.
    pub(crate) fn escape_reserved_fields(&mut self) {
        for key in RESERVED_FIELDS {
            if let Some(value) = self.data.remove(key) {
                insert_field(&mut self.data, key.to_string(), value);
            }
        }
    }
}

/// Page visibility at the time an event was enriched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
}

/// Snapshot of the page an event was captured on.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    /// Full URL of the page.
    pub url: String,
    /// Document title.
    pub title: String,
    /// Referrer, empty when there is none.
    pub referrer: String,
    /// Visibility state.
    pub visibility: Visibility,
}

/// Device snapshot, captured once per monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Operating system family (e.g. `linux`).
    pub os: String,
    /// CPU architecture (e.g. `x86_64`).
    pub arch: String,
    /// Host name of the machine.
    pub hostname: String,
    /// Preferred language tag, if known.
    pub language: Option<String>,
    /// Number of logical CPUs available.
    pub cpu_count: usize,
    /// User agent string identifying the SDK and platform.
    pub user_agent: String,
}

/// An event after enrichment, as delivered to the collection endpoint.
///
/// Enrichment never modifies the original [`TransportEvent`]; it wraps it and
/// the plugin's fields are flattened back to the top level on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportEvent {
    /// The event as emitted by the plugin.
    #[serde(flatten)]
    pub event: TransportEvent,

    /// Project the event belongs to.
    pub project_id: String,

    /// User the event belongs to.
    pub user_id: String,

    /// Session of the monitor that captured the event.
    pub session_id: Uuid,

    /// URL of the page at enrichment time.
    pub page_url: String,

    /// When the event was enriched.
    pub timestamp: DateTime<Utc>,

    /// Version of this SDK.
    pub sdk_version: String,

    /// Device snapshot.
    pub device: DeviceInfo,

    /// Page snapshot.
    pub page: PageInfo,
}

impl ReportEvent {
    /// Category of the wrapped event.
    #[must_use]
    pub fn category(&self) -> Category {
        self.event.category
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_device;
    use serde_json::json;

    #[test]
    fn category_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Category::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::to_string(&Category::Vitals).unwrap(),
            "\"vitals\""
        );
        assert_eq!(
            serde_json::to_string(&Category::Abnormal).unwrap(),
            "\"abnormal\""
        );
        assert_eq!(
            serde_json::to_string(&Category::Custom).unwrap(),
            "\"custom\""
        );
    }

    #[test]
    fn category_parses_case_insensitively() {
        assert_eq!("Vitals".parse::<Category>().unwrap(), Category::Vitals);
        assert_eq!(" user ".parse::<Category>().unwrap(), Category::User);
        assert!("network".parse::<Category>().is_err());
    }

    #[test]
    fn only_abnormal_is_sampling_exempt() {
        let exempt: Vec<_> = Category::ALL
            .into_iter()
            .filter(|c| c.is_sampling_exempt())
            .collect();
        assert_eq!(exempt, vec![Category::Abnormal]);
    }

    #[test]
    fn transport_event_flattens_data() {
        let event = TransportEvent::new(Category::User, "click")
            .with_field("selector", "#buy")
            .with_field("x", 10);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["category"], "user");
        assert_eq!(json["type"], "click");
        assert!(json.get("emitTime").is_some());
        assert_eq!(json["selector"], "#buy");
        assert_eq!(json["x"], 10);
        assert!(json.get("data").is_none());
    }

    #[test]
    fn with_data_merges_objects_and_wraps_scalars() {
        let merged = TransportEvent::new(Category::Custom, "checkout")
            .with_data(json!({"amount": 3, "currency": "EUR"}));
        assert_eq!(merged.data["amount"], 3);
        assert_eq!(merged.data["currency"], "EUR");

        let wrapped = TransportEvent::new(Category::Custom, "note").with_data(json!("hello"));
        assert_eq!(wrapped.data["data"], "hello");

        let empty = TransportEvent::new(Category::Custom, "noop").with_data(Value::Null);
        assert!(empty.data.is_empty());
    }

    #[test]
    fn reserved_keys_cannot_shadow_event_fields() {
        let event = TransportEvent::new(Category::Custom, "checkout")
            .with_data(json!({"type": "hijack", "category": "user", "emitTime": 5, "total": 9}))
            .with_field("userId", "someone-else");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "checkout");
        assert_eq!(json["category"], "custom");
        assert!(json["emitTime"].is_string());
        assert_eq!(json["_type"], "hijack");
        assert_eq!(json["_category"], "user");
        assert_eq!(json["_emitTime"], 5);
        assert_eq!(json["_userId"], "someone-else");
        assert_eq!(json["total"], 9);
    }

    #[test]
    fn escape_reserved_fields_renames_direct_writes() {
        let mut event = TransportEvent::new(Category::Vitals, "lcp");
        event.data.insert("sessionId".to_string(), json!("forged"));
        event.data.insert("value".to_string(), json!(1200));

        event.escape_reserved_fields();
        assert_eq!(event.data.get("sessionId"), None);
        assert_eq!(event.data["_sessionId"], "forged");
        assert_eq!(event.data["value"], 1200);
    }

    #[test]
    fn report_event_keeps_plugin_fields_at_top_level() {
        let event = TransportEvent::new(Category::Vitals, "lcp").with_field("value", 1200);
        let report = ReportEvent {
            event,
            project_id: "proj".to_string(),
            user_id: "user-1".to_string(),
            session_id: Uuid::nil(),
            page_url: "https://shop.example/cart".to_string(),
            timestamp: Utc::now(),
            sdk_version: "0.1.0".to_string(),
            device: sample_device(),
            page: PageInfo::default(),
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["type"], "lcp");
        assert_eq!(json["value"], 1200);
        assert_eq!(json["projectId"], "proj");
        assert_eq!(json["userId"], "user-1");
        assert_eq!(json["sessionId"], "00000000-0000-0000-0000-000000000000");
        assert_eq!(json["pageUrl"], "https://shop.example/cart");
        assert_eq!(json["device"]["cpuCount"], 4);
        assert_eq!(json["page"]["visibility"], "visible");
    }
}
