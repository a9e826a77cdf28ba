mod common;

use common::*;
use route_tracker::adapters::inbound::InMemoryTrackingStore;
use route_tracker::adapters::outbound::{init_buffered_logger, init_noop_logger, MultiLogger};
use route_tracker::application::{DriverContext, RouteTrackingService};
use route_tracker::domains::logger::{DomainLogger, DynLogger};
use route_tracker::domains::route_tracking::LiveObserver;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct BridgeCapture {
    messages: Mutex<Vec<String>>,
}

impl BridgeCapture {
    fn lines(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl DomainLogger for BridgeCapture {
    fn info(&self, msg: &str) { self.messages.lock().unwrap().push(format!("INFO:{}", msg)); }
    fn warn(&self, msg: &str) { self.messages.lock().unwrap().push(format!("WARN:{}", msg)); }
    fn error(&self, msg: &str) { self.messages.lock().unwrap().push(format!("ERR:{}", msg)); }
}

#[tokio::test]
async fn test_buffered_and_noop_logger() {
    let capture = Arc::new(BridgeCapture::default());
    let buffered = init_buffered_logger(capture.clone() as DynLogger, 8);

    buffered.info("one");
    buffered.warn("two");
    buffered.error("three");

    tokio::time::sleep(Duration::from_millis(50)).await;

    let msgs = capture.lines();
    assert_eq!(msgs, vec!["INFO:one", "WARN:two", "ERR:three"]);

    let noop = init_noop_logger();
    noop.info("ignored");
    noop.error("ignored-err");
}

#[tokio::test]
async fn test_service_reports_through_injected_logger() {
    let capture = Arc::new(BridgeCapture::default());
    let logger: DynLogger = Arc::new(MultiLogger::new(vec![capture.clone() as DynLogger, init_noop_logger()]));
    let store = Arc::new(InMemoryTrackingStore::new());
    let service = RouteTrackingService::new(
        Arc::new(engine_with(store.clone(), Duration::from_secs(5))),
        Arc::new(LiveObserver::new(store.clone())),
        DriverContext::new(DRIVER).unwrap(),
        logger,
    );
    let (start, end) = endpoints();

    let handle = service.start_route(start, end).await.unwrap();
    service.stop_route(&handle).await.unwrap();

    store.fail_creates(1);
    assert!(service.start_route(start, end).await.is_err());

    let lines = capture.lines();
    assert!(lines.iter().any(|l| l.starts_with("INFO:Route") && l.contains("5 waypoints")));
    assert!(lines.iter().any(|l| l.starts_with("INFO:") && l.contains("stopped")));
    assert!(lines.iter().any(|l| l.starts_with("ERR:Failed to start route")));
}
