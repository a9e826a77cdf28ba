#![allow(dead_code)]

use async_trait::async_trait;
use route_tracker::adapters::inbound::InMemoryTrackingStore;
use route_tracker::common::RoutingError;
use route_tracker::domains::route_tracking::{Coordinate, ObserverSettings, Path, PathProvider, RouteSessionEngine};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DRIVER: &str = "driver-1";
pub const FAST_TICK: Duration = Duration::from_millis(20);
pub const WAIT: Duration = Duration::from_secs(3);

/// Five waypoints through central Delhi.
pub fn delhi_waypoints() -> Vec<Coordinate> {
    vec![
        Coordinate { lat: 28.6139, lng: 77.2090 },
        Coordinate { lat: 28.6200, lng: 77.2150 },
        Coordinate { lat: 28.6260, lng: 77.2210 },
        Coordinate { lat: 28.6320, lng: 77.2270 },
        Coordinate { lat: 28.6380, lng: 77.2330 },
    ]
}

pub fn endpoints() -> (Coordinate, Coordinate) {
    let waypoints = delhi_waypoints();
    (waypoints[0], waypoints[waypoints.len() - 1])
}

/// Serves the same path for every request and counts lookups.
pub struct FixedPathProvider {
    waypoints: Vec<Coordinate>,
    calls: AtomicUsize,
}

impl FixedPathProvider {
    pub fn new(waypoints: Vec<Coordinate>) -> Self {
        Self { waypoints, calls: AtomicUsize::new(0) }
    }

    pub fn delhi() -> Self {
        Self::new(delhi_waypoints())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PathProvider for FixedPathProvider {
    async fn route(&self, _start: Coordinate, _end: Coordinate) -> Result<Path, RoutingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Path::new(self.waypoints.clone()).map_err(|e| RoutingError::new(e.to_string()))
    }
}

pub struct FailingPathProvider;

#[async_trait]
impl PathProvider for FailingPathProvider {
    async fn route(&self, _start: Coordinate, _end: Coordinate) -> Result<Path, RoutingError> {
        Err(RoutingError::new("directions service unreachable"))
    }
}

pub fn engine_with(store: Arc<InMemoryTrackingStore>, tick: Duration) -> RouteSessionEngine {
    RouteSessionEngine::new(store, Arc::new(FixedPathProvider::delhi())).with_tick_interval(tick)
}

pub fn fast_observer_settings() -> ObserverSettings {
    ObserverSettings {
        reconnect_attempts: 2,
        reconnect_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(20),
    }
}

/// Polls `check` until it holds or `WAIT` elapses.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
