//! Enrichment at the bus-to-queue boundary.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::host::Host;
use crate::types::{DeviceInfo, ReportEvent, TransportEvent};

/// Version reported in every event.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wraps plugin events with session identity and environment snapshots.
///
/// Identity and device are fixed when the enricher is built; page state is
/// read from the host for every event.
#[derive(Debug, Clone)]
pub struct Enricher {
    project_id: String,
    user_id: String,
    session_id: Uuid,
    device: DeviceInfo,
    host: Arc<dyn Host>,
}

impl Enricher {
    #[must_use]
    pub fn new(
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        session_id: Uuid,
        device: DeviceInfo,
        host: Arc<dyn Host>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            user_id: user_id.into(),
            session_id,
            device,
            host,
        }
    }

    /// Produces the report for an event. The event itself is kept as is.
    #[must_use]
    pub fn enrich(&self, event: TransportEvent) -> ReportEvent {
        let page = self.host.page_info();
        ReportEvent {
            event,
            project_id: self.project_id.clone(),
            user_id: self.user_id.clone(),
            session_id: self.session_id,
            page_url: page.url.clone(),
            timestamp: Utc::now(),
            sdk_version: SDK_VERSION.to_string(),
            device: self.device.clone(),
            page,
        }
    }
}
