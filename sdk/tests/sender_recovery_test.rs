//! Integration tests for delivery recovery behavior.
//!
//! These tests drive a `Transport` over a real `HttpSender` and verify that
//! rejected or oversized batches are dropped without blocking the batches
//! that follow.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use sightline_sdk::hooks::Hooks;
use sightline_sdk::sender::{BatchSender, HttpSender, RetryPolicy, SenderConfig, BEACON_MAX_BYTES};
use sightline_sdk::transport::{BreadcrumbOptions, Transport};
use sightline_sdk::types::{Category, DeviceInfo, PageInfo, ReportEvent, TransportEvent};
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// =============================================================================
// Test Helpers
// =============================================================================

/// Creates an enriched event with a small payload.
fn create_small_event(event_type: &str) -> ReportEvent {
    create_event(event_type, "ok")
}

/// Creates an event whose serialized batch exceeds the beacon limit.
fn create_oversized_event(event_type: &str) -> ReportEvent {
    create_event(event_type, &"x".repeat(BEACON_MAX_BYTES + 1024))
}

fn create_event(event_type: &str, note: &str) -> ReportEvent {
    ReportEvent {
        event: TransportEvent::new(Category::Custom, event_type).with_field("note", note),
        project_id: "test-project".to_string(),
        user_id: "user-1".to_string(),
        session_id: Uuid::new_v4(),
        page_url: String::new(),
        timestamp: Utc::now(),
        sdk_version: "test".to_string(),
        device: DeviceInfo {
            os: "linux".to_string(),
            arch: "x86_64".to_string(),
            hostname: "test-host".to_string(),
            language: None,
            cpu_count: 2,
            user_agent: "sightline/test".to_string(),
        },
        page: PageInfo::default(),
    }
}

/// Creates a transport posting to the mock server with a fast retry policy.
fn create_test_transport(server_url: &str, beacon: bool, capacity: usize) -> Transport {
    let config = SenderConfig::new(format!("{server_url}/report"))
        .with_retry_policy(RetryPolicy::fast_for_tests())
        .with_beacon(beacon);
    let sender = HttpSender::new(config).expect("HTTP client");
    let transport = Transport::new(Arc::new(sender) as Arc<dyn BatchSender>, Hooks::new());
    // No upload interval, so there are no timers to keep.
    let _ = transport
        .init_breadcrumb(vec![BreadcrumbOptions::new(Category::Custom).with_capacity(capacity)]);
    transport
}

async fn received_types(server: &MockServer) -> Vec<Vec<String>> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|r| {
            let batch: Vec<Value> = serde_json::from_slice(&r.body).unwrap();
            batch
                .iter()
                .map(|e| e["type"].as_str().unwrap_or_default().to_string())
                .collect()
        })
        .collect()
}

// =============================================================================
// Recovery Tests
// =============================================================================

/// A 413 for one batch is not retried and does not affect the next batch.
#[tokio::test]
async fn test_rejected_batch_does_not_block_next_batch() {
    let mock_server = MockServer::start().await;

    // First request: 413, second request: 200
    Mock::given(method("POST"))
        .and(path("/report"))
        .respond_with(ResponseTemplate::new(413).set_body_string("Payload too large"))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/report"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let transport = create_test_transport(&mock_server.uri(), false, 1);

    transport.send(Category::Custom, create_small_event("rejected")).await;
    transport.send(Category::Custom, create_small_event("accepted")).await;

    assert_eq!(
        received_types(&mock_server).await,
        vec![vec!["rejected"], vec!["accepted"]]
    );
    assert_eq!(transport.queue_len(Category::Custom), Some(0));
}

/// A batch too large for the beacon falls back to an awaited POST.
#[tokio::test]
async fn test_oversized_batch_falls_back_to_post() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/report"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let transport = create_test_transport(&mock_server.uri(), true, 1);

    // The POST fallback is awaited, so the request is visible immediately.
    transport.send(Category::Custom, create_oversized_event("big")).await;
    assert_eq!(received_types(&mock_server).await, vec![vec!["big"]]);
}

/// A batch that exhausts its retries is dropped; later batches are delivered.
#[tokio::test]
async fn test_exhausted_retries_drop_only_that_batch() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/report"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/report"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let transport = create_test_transport(&mock_server.uri(), false, 2);

    transport.send(Category::Custom, create_small_event("a")).await;
    transport.send(Category::Custom, create_small_event("b")).await;
    assert_eq!(transport.queue_len(Category::Custom), Some(0));

    transport.send(Category::Custom, create_small_event("c")).await;
    transport.flush(Category::Custom, true).await;

    let types = received_types(&mock_server).await;
    assert_eq!(types.len(), 4, "three failed attempts plus one delivery");
    assert!(types[..3].iter().all(|t| t == &vec!["a", "b"]));
    assert_eq!(types[3], vec!["c"]);
}

/// Without a reachable server every batch is dropped and the queue stays usable.
#[tokio::test]
async fn test_unreachable_endpoint_is_fail_silent() {
    let config = SenderConfig::new("http://127.0.0.1:9/report")
        .with_retry_policy(RetryPolicy::none())
        .with_beacon(false);
    let sender = HttpSender::new(SenderConfig {
        timeout: Duration::from_millis(500),
        ..config
    })
    .expect("HTTP client");
    let transport = Transport::new(Arc::new(sender) as Arc<dyn BatchSender>, Hooks::new());
    let _timers =
        transport.init_breadcrumb(vec![BreadcrumbOptions::new(Category::Custom).with_capacity(1)]);

    transport.send(Category::Custom, create_small_event("lost")).await;
    transport.send(Category::Custom, create_small_event("also_lost")).await;

    assert_eq!(transport.queue_len(Category::Custom), Some(0));
}
