//! Shared fixtures for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::sender::{BatchSender, TransportError};
use crate::types::{Category, DeviceInfo, PageInfo, ReportEvent, TransportEvent};

pub(crate) fn sample_device() -> DeviceInfo {
    DeviceInfo {
        os: "linux".to_string(),
        arch: "x86_64".to_string(),
        hostname: "test-host".to_string(),
        language: Some("en-US".to_string()),
        cpu_count: 4,
        user_agent: "sightline/test".to_string(),
    }
}

pub(crate) fn report(category: Category, event_type: &str) -> ReportEvent {
    ReportEvent {
        event: TransportEvent::new(category, event_type),
        project_id: "test-project".to_string(),
        user_id: "user-1".to_string(),
        session_id: Uuid::nil(),
        page_url: "https://app.example/".to_string(),
        timestamp: Utc::now(),
        sdk_version: env!("CARGO_PKG_VERSION").to_string(),
        device: sample_device(),
        page: PageInfo::default(),
    }
}

/// Which primitive delivered a recorded batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Channel {
    Beacon,
    Post,
}

/// In-memory [`BatchSender`] that records every delivered batch.
#[derive(Debug, Default)]
pub(crate) struct RecordingSender {
    refuse_beacon: AtomicBool,
    fail_post: AtomicBool,
    drains: AtomicUsize,
    batches: Mutex<Vec<(Channel, Vec<Value>)>>,
}

impl RecordingSender {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the beacon primitive report itself unavailable.
    pub(crate) fn refuse_beacon(&self) {
        self.refuse_beacon.store(true, Ordering::SeqCst);
    }

    /// Makes every POST fail.
    pub(crate) fn fail_post(&self) {
        self.fail_post.store(true, Ordering::SeqCst);
    }

    /// How many times the transport waited for in-flight deliveries.
    pub(crate) fn drains(&self) -> usize {
        self.drains.load(Ordering::SeqCst)
    }

    pub(crate) fn batches(&self) -> Vec<(Channel, Vec<Value>)> {
        self.batches.lock().unwrap().clone()
    }

    /// Event types of each recorded batch, in delivery order.
    pub(crate) fn types(&self) -> Vec<Vec<String>> {
        self.batches()
            .into_iter()
            .map(|(_, batch)| {
                batch
                    .iter()
                    .map(|e| e["type"].as_str().unwrap_or_default().to_string())
                    .collect()
            })
            .collect()
    }

    fn record(&self, channel: Channel, body: &[u8]) {
        let batch: Vec<Value> = serde_json::from_slice(body).expect("batch is a JSON array");
        self.batches.lock().unwrap().push((channel, batch));
    }
}

#[async_trait]
impl BatchSender for RecordingSender {
    fn beacon(&self, body: &[u8]) -> bool {
        if self.refuse_beacon.load(Ordering::SeqCst) {
            return false;
        }
        self.record(Channel::Beacon, body);
        true
    }

    async fn post(&self, body: Vec<u8>) -> Result<(), TransportError> {
        if self.fail_post.load(Ordering::SeqCst) {
            return Err(TransportError::ServerError {
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        self.record(Channel::Post, &body);
        Ok(())
    }

    async fn drain(&self) {
        self.drains.fetch_add(1, Ordering::SeqCst);
    }
}
