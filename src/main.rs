use anyhow::{anyhow, Result};
use route_tracker::adapters::inbound::InMemoryTrackingStore;
use route_tracker::adapters::outbound::{
    init_buffered_logger, init_combined_logger, GeoJsonRouteProvider, InterpolatedPathProvider,
    PostgresTrackingStore,
};
use route_tracker::application::{DriverContext, RouteTrackingService};
use route_tracker::config::{RoutingProvider, StoreBackend};
use route_tracker::domains::route_tracking::{
    LiveObserver, ObservedPosition, PathProvider, RouteSessionEngine, RouteTrackingEvent,
    TrackingProjectionStore, TrackingStore,
};
use route_tracker::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load(CONFIG_PATH)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    // Not `init()`: that would claim the `log` facade before fast_log can.
    tracing::subscriber::set_global_default(tracing_subscriber::fmt().with_env_filter(filter).finish())?;

    info!("Starting route tracker");
    let logger = init_buffered_logger(init_combined_logger(&config.logging.file, config.log_level()), 256);

    let store: Arc<dyn TrackingStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(InMemoryTrackingStore::new()),
        StoreBackend::Postgres => {
            info!(host = %config.postgres.host, database = %config.postgres.database, "Using PostgreSQL store");
            let store = PostgresTrackingStore::new(config.postgres.clone(), config.poll_interval())
                .await
                .map_err(|e| anyhow!(e))?;
            Arc::new(store)
        }
    };

    let paths: Arc<dyn PathProvider> = match config.routing.provider {
        RoutingProvider::Interpolated => Arc::new(InterpolatedPathProvider::new(config.routing.waypoints)),
        RoutingProvider::Geojson => {
            let file = config
                .routing
                .geojson_path
                .as_deref()
                .ok_or_else(|| anyhow!("routing.geojson_path is not set"))?;
            Arc::new(GeoJsonRouteProvider::from_file(file, config.routing.endpoint_tolerance_m).await?)
        }
    };

    let (event_sender, mut event_receiver) = mpsc::channel::<RouteTrackingEvent>(256);
    let projections = Arc::new(Mutex::new(TrackingProjectionStore::new()));
    let projection_task = {
        let projections = projections.clone();
        tokio::spawn(async move {
            while let Some(event) = event_receiver.recv().await {
                projections.lock().await.apply_event(&event);
            }
        })
    };

    let engine = Arc::new(
        RouteSessionEngine::new(store.clone(), paths)
            .with_tick_interval(config.tick_interval())
            .with_event_sink(event_sender),
    );
    let observer = Arc::new(LiveObserver::new(store).with_settings(config.observer_settings()));

    let driver = DriverContext::new(config.demo.driver_id.clone())?;
    let service = RouteTrackingService::new(engine, observer, driver, logger);

    let (start, end) = config.demo.endpoints()?;
    let mut observation = service.observe(service.driver().driver_id()).await?;
    let session = service.start_route(start, end).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; stopping route");
                if let Err(e) = service.stop_route(&session).await {
                    error!(error = %e, "Failed to stop route");
                }
                break;
            }
            update = observation.changed() => match update {
                Some(ObservedPosition::Live(fix)) => {
                    info!(lat = ?fix.lat, lng = ?fix.lng, at = %fix.updated_at, "Driver position");
                }
                Some(ObservedPosition::Finished(fix)) => {
                    info!(lat = ?fix.lat, lng = ?fix.lng, "Route finished");
                    break;
                }
                Some(ObservedPosition::NoActiveSession) => info!("No active route"),
                Some(ObservedPosition::Degraded) => warn!("Live position feed degraded"),
                None => break,
            },
        }
    }

    service.unobserve(&observation);
    drop(session);
    drop(service);
    // The sink closes once the engine and its sessions are gone.
    if tokio::time::timeout(Duration::from_secs(2), projection_task).await.is_err() {
        warn!("Projection did not drain in time");
    }

    if let Some(progress) = projections.lock().await.latest_for_driver(&config.demo.driver_id) {
        info!(
            session_id = %progress.session_id,
            status = %progress.status,
            progress = progress.progress(),
            "Final route progress"
        );
    }
    info!("Route tracker stopped");
    Ok(())
}
