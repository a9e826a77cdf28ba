use crate::common::{DomainError, DomainResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> DomainResult<Self> {
        let coordinate = Self { lat, lng };
        if !coordinate.is_valid() {
            return Err(DomainError::InvalidCoordinate { lat, lng });
        }
        Ok(coordinate)
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// Great-circle distance in metres (haversine).
    pub fn distance_m(&self, other: &Coordinate) -> f64 {
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lng = (other.lng - self.lng).to_radians();
        let a = (d_lat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos() * other.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().asin()
    }

    pub fn approx_eq(&self, other: &Coordinate, tolerance_m: f64) -> bool {
        self.distance_m(other) <= tolerance_m
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.lat, self.lng)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingStatus {
    InProgress,
    Completed,
}

impl TrackingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingStatus::InProgress => "in_progress",
            TrackingStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for TrackingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackingStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(TrackingStatus::InProgress),
            "completed" => Ok(TrackingStatus::Completed),
            other => Err(DomainError::InvalidRecord {
                reason: format!("unknown status '{}'", other),
            }),
        }
    }
}

/// Ordered waypoints from start to end, as supplied by a path provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    waypoints: Vec<Coordinate>,
}

impl Path {
    pub fn new(waypoints: Vec<Coordinate>) -> DomainResult<Self> {
        if waypoints.is_empty() {
            return Err(DomainError::InvalidCommand {
                reason: "path must contain at least one waypoint".to_string(),
            });
        }
        if let Some(bad) = waypoints.iter().find(|w| !w.is_valid()) {
            return Err(DomainError::InvalidCoordinate { lat: bad.lat, lng: bad.lng });
        }
        Ok(Self { waypoints })
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Coordinate> {
        self.waypoints.get(index).copied()
    }

    pub fn first(&self) -> Coordinate {
        self.waypoints[0]
    }

    pub fn last(&self) -> Coordinate {
        self.waypoints[self.waypoints.len() - 1]
    }

    pub fn waypoints(&self) -> &[Coordinate] {
        &self.waypoints
    }

    /// Index of the waypoint closest to `position`. Ties resolve to the earliest index.
    pub fn nearest_index(&self, position: &Coordinate) -> usize {
        let mut best = 0;
        let mut best_distance = f64::INFINITY;
        for (index, waypoint) in self.waypoints.iter().enumerate() {
            let distance = waypoint.distance_m(position);
            if distance < best_distance {
                best = index;
                best_distance = distance;
            }
        }
        best
    }
}

/// Store-level representation of a tracking record. Coordinate columns are
/// nullable, so readers must tolerate missing values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingRow {
    pub id: Uuid,
    pub driver_id: String,
    pub start_lat: Option<f64>,
    pub start_lng: Option<f64>,
    pub end_lat: Option<f64>,
    pub end_lng: Option<f64>,
    pub current_lat: Option<f64>,
    pub current_lng: Option<f64>,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackingRow {
    pub fn status(&self) -> DomainResult<TrackingStatus> {
        self.status.parse()
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self.status(), Ok(TrackingStatus::InProgress))
    }
}

/// Insert payload for a brand-new session.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTrackingSession {
    pub driver_id: String,
    pub start: Coordinate,
    pub end: Coordinate,
    pub started_at: DateTime<Utc>,
}

/// A normalized position read from a tracking row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionFix {
    pub session_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl PositionFix {
    /// Missing or non-finite coordinate fields are omitted.
    pub fn from_row(row: &TrackingRow) -> Self {
        Self {
            session_id: row.id,
            lat: row.current_lat.filter(|v| v.is_finite()),
            lng: row.current_lng.filter(|v| v.is_finite()),
            updated_at: row.updated_at,
        }
    }

    pub fn coordinate(&self) -> Option<Coordinate> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Coordinate::new(lat, lng).ok(),
            _ => None,
        }
    }
}

/// What an observer currently knows about a driver's position.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedPosition {
    NoActiveSession,
    Live(PositionFix),
    /// Last position of a session that completed while being observed.
    Finished(PositionFix),
    /// The change feed was lost and could not be reestablished; freshness is unknown.
    Degraded,
}

impl ObservedPosition {
    pub fn from_row(row: &TrackingRow) -> Self {
        let fix = PositionFix::from_row(row);
        match row.status() {
            Ok(TrackingStatus::Completed) => ObservedPosition::Finished(fix),
            _ => ObservedPosition::Live(fix),
        }
    }

    pub fn fix(&self) -> Option<&PositionFix> {
        match self {
            ObservedPosition::Live(fix) | ObservedPosition::Finished(fix) => Some(fix),
            _ => None,
        }
    }

    pub fn coordinate(&self) -> Option<Coordinate> {
        self.fix().and_then(PositionFix::coordinate)
    }

    pub fn is_live(&self) -> bool {
        matches!(self, ObservedPosition::Live(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(current_lat: Option<f64>, current_lng: Option<f64>, status: &str) -> TrackingRow {
        let now = Utc::now();
        TrackingRow {
            id: Uuid::new_v4(),
            driver_id: "driver-1".to_string(),
            start_lat: Some(28.6139),
            start_lng: Some(77.2090),
            end_lat: Some(28.7),
            end_lng: Some(77.3),
            current_lat,
            current_lng,
            status: status.to_string(),
            started_at: Some(now),
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_coordinate_validation() {
        assert!(Coordinate::new(28.6139, 77.2090).is_ok());
        assert!(Coordinate::new(91.0, 0.0).is_err());
        assert!(Coordinate::new(0.0, -180.5).is_err());
        assert!(Coordinate::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn test_distance_is_roughly_correct() {
        let a = Coordinate { lat: 0.0, lng: 0.0 };
        let b = Coordinate { lat: 0.0, lng: 1.0 };
        let d = a.distance_m(&b);
        assert!((d - 111_195.0).abs() < 100.0, "got {}", d);
        assert!(a.approx_eq(&a, 0.0));
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("in_progress".parse::<TrackingStatus>().unwrap(), TrackingStatus::InProgress);
        assert_eq!("completed".parse::<TrackingStatus>().unwrap(), TrackingStatus::Completed);
        assert!("paused".parse::<TrackingStatus>().is_err());
        assert_eq!(TrackingStatus::Completed.to_string(), "completed");
    }

    #[test]
    fn test_path_rejects_empty_and_invalid() {
        assert!(Path::new(vec![]).is_err());
        assert!(Path::new(vec![Coordinate { lat: 100.0, lng: 0.0 }]).is_err());
    }

    #[test]
    fn test_path_nearest_index() {
        let path = Path::new(vec![
            Coordinate { lat: 0.0, lng: 0.0 },
            Coordinate { lat: 0.0, lng: 1.0 },
            Coordinate { lat: 0.0, lng: 2.0 },
        ])
        .unwrap();
        assert_eq!(path.nearest_index(&Coordinate { lat: 0.1, lng: 1.2 }), 1);
        assert_eq!(path.nearest_index(&Coordinate { lat: 0.0, lng: 5.0 }), 2);
        assert_eq!(path.first(), Coordinate { lat: 0.0, lng: 0.0 });
        assert_eq!(path.last(), Coordinate { lat: 0.0, lng: 2.0 });
    }

    #[test]
    fn test_normalization_omits_missing_fields() {
        let fix = PositionFix::from_row(&row(Some(28.65), None, "in_progress"));
        assert_eq!(fix.lat, Some(28.65));
        assert_eq!(fix.lng, None);
        assert!(fix.coordinate().is_none());

        let json = serde_json::to_value(&fix).unwrap();
        assert!(json.get("lng").is_none());
        assert!(json.get("lat").is_some());

        let fix = PositionFix::from_row(&row(Some(f64::NAN), Some(77.25), "in_progress"));
        assert_eq!(fix.lat, None);
        assert_eq!(fix.lng, Some(77.25));
    }

    #[test]
    fn test_observed_position_follows_row_status() {
        let live = ObservedPosition::from_row(&row(Some(28.65), Some(77.25), "in_progress"));
        assert!(live.is_live());
        assert_eq!(live.coordinate(), Some(Coordinate { lat: 28.65, lng: 77.25 }));

        let finished = ObservedPosition::from_row(&row(Some(28.7), Some(77.3), "completed"));
        assert!(matches!(finished, ObservedPosition::Finished(_)));
        assert_eq!(ObservedPosition::NoActiveSession.coordinate(), None);
    }
}
