use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    #[error("Invalid coordinate: lat={lat}, lng={lng}")]
    InvalidCoordinate { lat: f64, lng: f64 },

    #[error("Invalid command: {reason}")]
    InvalidCommand { reason: String },

    #[error("Session {id} is already completed")]
    SessionCompleted { id: Uuid },

    #[error("Invalid tracking record: {reason}")]
    InvalidRecord { reason: String },
}

/// Failures reported by a `TrackingStore` backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Driver {driver_id} already has an in-progress session")]
    Conflict { driver_id: String },

    #[error("Tracking session not found: {id}")]
    NotFound { id: Uuid },

    #[error("Tracking session {id} is not in progress")]
    NotActive { id: Uuid },

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// A path provider could not resolve a route.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("No route available: {reason}")]
pub struct RoutingError {
    pub reason: String,
}

impl RoutingError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

#[derive(Error, Debug)]
pub enum TrackingError {
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Routing unavailable: {0}")]
    RoutingUnavailable(#[from] RoutingError),

    #[error("Persistence write failed during {operation}: {source}")]
    PersistenceWriteFailed {
        operation: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("Subscription for driver {driver_id} dropped: {reason}")]
    SubscriptionDropped { driver_id: String, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] anyhow::Error),
}

impl TrackingError {
    pub fn persistence(operation: &'static str, source: StoreError) -> Self {
        TrackingError::PersistenceWriteFailed { operation, source }
    }
}

pub type DomainResult<T> = Result<T, DomainError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type TrackingResult<T> = Result<T, TrackingError>;
