use crate::common::{DomainError, DomainResult, TrackingResult};
use crate::domains::logger::DynLogger;
use crate::domains::route_tracking::{
    Coordinate, LiveObserver, ObservationHandle, RouteSessionEngine, SessionHandle,
};
use std::sync::Arc;

/// The signed-in driver a service instance acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverContext {
    driver_id: String,
}

impl DriverContext {
    pub fn new(driver_id: impl Into<String>) -> DomainResult<Self> {
        let driver_id = driver_id.into();
        if driver_id.trim().is_empty() {
            return Err(DomainError::InvalidCommand {
                reason: "driver id must not be empty".to_string(),
            });
        }
        Ok(Self { driver_id })
    }

    pub fn driver_id(&self) -> &str {
        &self.driver_id
    }
}

/// Entry point for the driver app (start/stop its own route) and for
/// monitoring screens (observe any driver).
pub struct RouteTrackingService {
    engine: Arc<RouteSessionEngine>,
    observer: Arc<LiveObserver>,
    driver: DriverContext,
    logger: DynLogger,
}

impl RouteTrackingService {
    pub fn new(
        engine: Arc<RouteSessionEngine>,
        observer: Arc<LiveObserver>,
        driver: DriverContext,
        logger: DynLogger,
    ) -> Self {
        Self { engine, observer, driver, logger }
    }

    pub fn driver(&self) -> &DriverContext {
        &self.driver
    }

    pub async fn start_route(&self, start: Coordinate, end: Coordinate) -> TrackingResult<SessionHandle> {
        let driver_id = self.driver.driver_id();
        match self.engine.start_route(driver_id, start, end).await {
            Ok(handle) => {
                self.logger.info(&format!(
                    "Route {} for {} tracking from {} ({} waypoints)",
                    handle.session_id(),
                    driver_id,
                    handle.current(),
                    handle.path().len()
                ));
                Ok(handle)
            }
            Err(e) => {
                self.logger.error(&format!("Failed to start route for {}: {}", driver_id, e));
                Err(e)
            }
        }
    }

    /// Stops a route the context's driver owns.
    pub async fn stop_route(&self, handle: &SessionHandle) -> TrackingResult<()> {
        if handle.driver_id() != self.driver.driver_id() {
            self.logger.warn(&format!(
                "{} tried to stop route {} owned by {}",
                self.driver.driver_id(),
                handle.session_id(),
                handle.driver_id()
            ));
            return Err(DomainError::InvalidCommand {
                reason: "route belongs to another driver".to_string(),
            }
            .into());
        }

        self.engine.stop_route(handle).await.map_err(|e| {
            self.logger.error(&format!("Failed to stop route {}: {}", handle.session_id(), e));
            e
        })?;
        self.logger.info(&format!("Route {} stopped at {}", handle.session_id(), handle.current()));
        Ok(())
    }

    /// The route this process is currently advancing for the context's driver.
    pub async fn current_route(&self) -> Option<SessionHandle> {
        self.engine.active_session(self.driver.driver_id()).await
    }

    pub async fn observe(&self, driver_id: &str) -> TrackingResult<ObservationHandle> {
        let handle = self.observer.observe(driver_id).await?;
        self.logger.info(&format!("Observing {}: {:?}", driver_id, handle.current()));
        Ok(handle)
    }

    pub fn unobserve(&self, handle: &ObservationHandle) {
        if handle.is_observing() {
            self.logger.info(&format!("Stopped observing {}", handle.driver_id()));
        }
        self.observer.unobserve(handle);
    }
}
