use super::types::{Coordinate, NewTrackingSession, TrackingRow, TrackingStatus};
use crate::common::{DomainError, DomainResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One worker's traversal of a route.
///
/// `current`, `status` and `completed_at` are only reachable through
/// [`TrackingSession::advance_to`] and [`TrackingSession::complete`], which keep
/// the completed state terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingSession {
    pub id: Uuid,
    pub driver_id: String,
    pub start: Coordinate,
    pub end: Coordinate,
    pub started_at: DateTime<Utc>,
    current: Coordinate,
    status: TrackingStatus,
    completed_at: Option<DateTime<Utc>>,
}

impl TrackingSession {
    pub fn begin(id: Uuid, new_session: NewTrackingSession) -> Self {
        Self {
            id,
            driver_id: new_session.driver_id,
            start: new_session.start,
            end: new_session.end,
            started_at: new_session.started_at,
            current: new_session.start,
            status: TrackingStatus::InProgress,
            completed_at: None,
        }
    }

    pub fn current(&self) -> Coordinate {
        self.current
    }

    pub fn status(&self) -> TrackingStatus {
        self.status
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == TrackingStatus::InProgress
    }

    pub fn advance_to(&mut self, position: Coordinate) -> DomainResult<()> {
        if !self.is_in_progress() {
            return Err(DomainError::SessionCompleted { id: self.id });
        }
        if !position.is_valid() {
            return Err(DomainError::InvalidCoordinate { lat: position.lat, lng: position.lng });
        }
        self.current = position;
        Ok(())
    }

    /// Returns `false` when the session was already completed; nothing changes then.
    pub fn complete(&mut self, at: DateTime<Utc>) -> bool {
        if !self.is_in_progress() {
            return false;
        }
        self.status = TrackingStatus::Completed;
        self.completed_at = Some(at);
        true
    }

    pub fn to_row(&self, created_at: DateTime<Utc>, updated_at: DateTime<Utc>) -> TrackingRow {
        TrackingRow {
            id: self.id,
            driver_id: self.driver_id.clone(),
            start_lat: Some(self.start.lat),
            start_lng: Some(self.start.lng),
            end_lat: Some(self.end.lat),
            end_lng: Some(self.end.lng),
            current_lat: Some(self.current.lat),
            current_lng: Some(self.current.lng),
            status: self.status.as_str().to_string(),
            started_at: Some(self.started_at),
            completed_at: self.completed_at,
            created_at,
            updated_at,
        }
    }
}

fn required_coordinate(lat: Option<f64>, lng: Option<f64>, field: &str) -> DomainResult<Coordinate> {
    match (lat, lng) {
        (Some(lat), Some(lng)) => Coordinate::new(lat, lng),
        _ => Err(DomainError::InvalidRecord {
            reason: format!("{} coordinate is missing", field),
        }),
    }
}

impl TryFrom<&TrackingRow> for TrackingSession {
    type Error = DomainError;

    fn try_from(row: &TrackingRow) -> DomainResult<Self> {
        let start = required_coordinate(row.start_lat, row.start_lng, "start")?;
        let end = required_coordinate(row.end_lat, row.end_lng, "end")?;
        // A row that never reported a position is still at its start point.
        let current = match (row.current_lat, row.current_lng) {
            (Some(_), Some(_)) => required_coordinate(row.current_lat, row.current_lng, "current")?,
            _ => start,
        };
        let status = row.status()?;
        if (status == TrackingStatus::Completed) != row.completed_at.is_some() {
            return Err(DomainError::InvalidRecord {
                reason: format!("status {} inconsistent with completed_at", status),
            });
        }

        Ok(Self {
            id: row.id,
            driver_id: row.driver_id.clone(),
            start,
            end,
            started_at: row.started_at.unwrap_or(row.created_at),
            current,
            status,
            completed_at: row.completed_at,
        })
    }
}
