#![cfg(feature = "pg_integration")]

// Needs a running PostgreSQL; `PG_TEST_PORT` selects the port (default 5433).

mod common;

use common::*;
use route_tracker::adapters::outbound::PostgresTrackingStore;
use route_tracker::common::StoreError;
use route_tracker::config::PostgresConfig;
use route_tracker::domains::route_tracking::{
    LiveObserver, ObservedPosition, RouteSessionEngine, TrackingStatus, TrackingStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

async fn connect() -> Result<PostgresTrackingStore, Box<dyn std::error::Error>> {
    let port = std::env::var("PG_TEST_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(5433u16);
    let config = PostgresConfig {
        host: "127.0.0.1".to_string(),
        port,
        database: "postgres".to_string(),
        username: "postgres".to_string(),
        password: "postgres".to_string(),
        max_connections: 4,
    };

    // Wait for Postgres to accept connections.
    let mut last_err = String::new();
    for _ in 0..20 {
        match PostgresTrackingStore::new(config.clone(), Duration::from_millis(25)).await {
            Ok(store) => return Ok(store),
            Err(e) => last_err = e,
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    Err(last_err.into())
}

fn unique_driver() -> String {
    format!("pg-driver-{}", Uuid::new_v4())
}

#[tokio::test]
async fn test_postgres_store_enforces_single_in_progress_session() -> Result<(), Box<dyn std::error::Error>> {
    let store = connect().await?;
    let driver_id = unique_driver();
    let (start, end) = endpoints();
    let new_session = route_tracker::domains::route_tracking::NewTrackingSession {
        driver_id: driver_id.clone(),
        start,
        end,
        started_at: chrono::Utc::now(),
    };

    let id = store.create(new_session.clone()).await?;
    let conflict = store.create(new_session.clone()).await;
    assert_eq!(conflict, Err(StoreError::Conflict { driver_id: driver_id.clone() }));

    store.update_position(id, delhi_waypoints()[1]).await?;
    let row = store.find_latest_in_progress(&driver_id).await?.expect("in-progress row");
    assert_eq!(row.current_lat, Some(delhi_waypoints()[1].lat));

    store.complete(id, chrono::Utc::now()).await?;
    store.complete(id, chrono::Utc::now()).await?;
    assert_eq!(
        store.update_position(id, delhi_waypoints()[2]).await,
        Err(StoreError::NotActive { id })
    );
    assert!(store.find_latest_in_progress(&driver_id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_postgres_route_is_observed_to_completion() -> Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn TrackingStore> = Arc::new(connect().await?);
    let driver_id = unique_driver();
    let (start, end) = endpoints();

    let observer = LiveObserver::new(store.clone()).with_settings(fast_observer_settings());
    let mut observation = observer.observe(&driver_id).await?;
    assert_eq!(observation.current(), ObservedPosition::NoActiveSession);

    let engine = RouteSessionEngine::new(store.clone(), Arc::new(FixedPathProvider::delhi()))
        .with_tick_interval(Duration::from_millis(100));
    let handle = engine.start_route(&driver_id, start, end).await?;

    let finished = timeout(WAIT, handle.wait_until_completed()).await?;
    assert_eq!(finished.status(), TrackingStatus::Completed);

    let observed = timeout(WAIT, observation.wait_for(|p| matches!(p, ObservedPosition::Finished(_))))
        .await?
        .expect("observation ended early");
    assert_eq!(observed.coordinate(), Some(end));
    Ok(())
}
