use super::types::{Coordinate, NewTrackingSession, Path, TrackingRow};
use crate::common::{RoutingError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Port for resolving a driving route between two points.
/// Geometry comes from an external mapping source; the core never checks it.
#[async_trait]
pub trait PathProvider: Send + Sync {
    async fn route(&self, start: Coordinate, end: Coordinate) -> Result<Path, RoutingError>;
}

/// Port for the shared table of tracking records.
///
/// Implementations must reject a `create` for a driver that already has an
/// in-progress session, and must refuse position updates on completed sessions.
#[async_trait]
pub trait TrackingStore: Send + Sync {
    async fn create(&self, session: NewTrackingSession) -> StoreResult<Uuid>;

    async fn find_latest_in_progress(&self, driver_id: &str) -> StoreResult<Option<TrackingRow>>;

    async fn update_position(&self, id: Uuid, position: Coordinate) -> StoreResult<()>;

    /// Completing an already completed session succeeds without changing it.
    async fn complete(&self, id: Uuid, completed_at: DateTime<Utc>) -> StoreResult<()>;

    /// Opens a change feed delivering every update to the driver's tracking rows,
    /// in the order the store applied them.
    async fn subscribe(&self, driver_id: &str) -> StoreResult<Box<dyn TrackingSubscription>>;
}

#[async_trait]
pub trait TrackingSubscription: Send {
    /// Next changed row. `None` means the feed was dropped by the transport
    /// or unsubscribed.
    async fn next_change(&mut self) -> Option<TrackingRow>;

    fn unsubscribe(&mut self);
}
