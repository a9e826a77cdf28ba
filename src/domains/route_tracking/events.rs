use super::types::Coordinate;
use crate::common::DomainEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionReason {
    PathExhausted,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RouteTrackingEvent {
    SessionStarted {
        session_id: Uuid,
        driver_id: String,
        start: Coordinate,
        end: Coordinate,
        waypoints: usize,
        timestamp: DateTime<Utc>,
    },
    SessionResumed {
        session_id: Uuid,
        driver_id: String,
        position: Coordinate,
        waypoint_index: usize,
        waypoints: usize,
        timestamp: DateTime<Utc>,
    },
    PositionAdvanced {
        session_id: Uuid,
        driver_id: String,
        position: Coordinate,
        waypoint_index: usize,
        timestamp: DateTime<Utc>,
    },
    SessionCompleted {
        session_id: Uuid,
        driver_id: String,
        final_position: Coordinate,
        reason: CompletionReason,
        timestamp: DateTime<Utc>,
    },
}

impl RouteTrackingEvent {
    pub fn session_id(&self) -> Uuid {
        match self {
            RouteTrackingEvent::SessionStarted { session_id, .. } => *session_id,
            RouteTrackingEvent::SessionResumed { session_id, .. } => *session_id,
            RouteTrackingEvent::PositionAdvanced { session_id, .. } => *session_id,
            RouteTrackingEvent::SessionCompleted { session_id, .. } => *session_id,
        }
    }

    pub fn driver_id(&self) -> &str {
        match self {
            RouteTrackingEvent::SessionStarted { driver_id, .. } => driver_id,
            RouteTrackingEvent::SessionResumed { driver_id, .. } => driver_id,
            RouteTrackingEvent::PositionAdvanced { driver_id, .. } => driver_id,
            RouteTrackingEvent::SessionCompleted { driver_id, .. } => driver_id,
        }
    }
}

impl DomainEvent for RouteTrackingEvent {
    fn event_type(&self) -> &'static str {
        match self {
            RouteTrackingEvent::SessionStarted { .. } => "SessionStarted",
            RouteTrackingEvent::SessionResumed { .. } => "SessionResumed",
            RouteTrackingEvent::PositionAdvanced { .. } => "PositionAdvanced",
            RouteTrackingEvent::SessionCompleted { .. } => "SessionCompleted",
        }
    }

    fn aggregate_id(&self) -> String {
        self.session_id().to_string()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            RouteTrackingEvent::SessionStarted { timestamp, .. } => *timestamp,
            RouteTrackingEvent::SessionResumed { timestamp, .. } => *timestamp,
            RouteTrackingEvent::PositionAdvanced { timestamp, .. } => *timestamp,
            RouteTrackingEvent::SessionCompleted { timestamp, .. } => *timestamp,
        }
    }
}
