use super::events::{CompletionReason, RouteTrackingEvent};
use super::types::{Coordinate, TrackingStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Per-session progress as shown on the committee's vehicle tracking board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteProgress {
    pub session_id: Uuid,
    pub driver_id: String,
    pub status: TrackingStatus,
    pub waypoints_total: usize,
    pub waypoint_index: usize,
    pub last_position: Coordinate,
    pub completion_reason: Option<CompletionReason>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RouteProgress {
    pub fn new(
        session_id: Uuid,
        driver_id: String,
        position: Coordinate,
        waypoint_index: usize,
        waypoints_total: usize,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            driver_id,
            status: TrackingStatus::InProgress,
            waypoints_total,
            waypoint_index,
            last_position: position,
            completion_reason: None,
            started_at,
            last_activity: started_at,
            completed_at: None,
        }
    }

    /// Fraction of the path covered, from 0.0 to 1.0.
    pub fn progress(&self) -> f64 {
        if self.status == TrackingStatus::Completed && self.completion_reason == Some(CompletionReason::PathExhausted) {
            return 1.0;
        }
        if self.waypoints_total <= 1 {
            return 0.0;
        }
        (self.waypoint_index as f64 / (self.waypoints_total - 1) as f64).clamp(0.0, 1.0)
    }

    pub fn apply_event(&mut self, event: &RouteTrackingEvent) {
        if self.status == TrackingStatus::Completed {
            return;
        }
        match event {
            RouteTrackingEvent::PositionAdvanced { position, waypoint_index, timestamp, .. } => {
                self.last_position = *position;
                self.waypoint_index = *waypoint_index;
                self.last_activity = *timestamp;
            }
            RouteTrackingEvent::SessionCompleted { final_position, reason, timestamp, .. } => {
                self.status = TrackingStatus::Completed;
                self.last_position = *final_position;
                self.completion_reason = Some(*reason);
                self.completed_at = Some(*timestamp);
                self.last_activity = *timestamp;
            }
            RouteTrackingEvent::SessionResumed { position, waypoint_index, timestamp, .. } => {
                self.last_position = *position;
                self.waypoint_index = *waypoint_index;
                self.last_activity = *timestamp;
            }
            RouteTrackingEvent::SessionStarted { .. } => {}
        }
    }
}

#[derive(Debug, Default)]
pub struct TrackingProjectionStore {
    pub sessions: HashMap<Uuid, RouteProgress>,
}

impl TrackingProjectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_event(&mut self, event: &RouteTrackingEvent) {
        match event {
            RouteTrackingEvent::SessionStarted { session_id, driver_id, start, waypoints, timestamp, .. } => {
                let progress = RouteProgress::new(*session_id, driver_id.clone(), *start, 0, *waypoints, *timestamp);
                self.sessions.insert(*session_id, progress);
            }
            RouteTrackingEvent::SessionResumed {
                session_id,
                driver_id,
                position,
                waypoint_index,
                waypoints,
                timestamp,
            } => {
                self.sessions.entry(*session_id).or_insert_with(|| {
                    RouteProgress::new(*session_id, driver_id.clone(), *position, *waypoint_index, *waypoints, *timestamp)
                });
            }
            _ => {}
        }

        if let Some(progress) = self.sessions.get_mut(&event.session_id()) {
            progress.apply_event(event);
        }
    }

    pub fn active_sessions(&self) -> Vec<&RouteProgress> {
        let mut active: Vec<&RouteProgress> = self
            .sessions
            .values()
            .filter(|p| p.status == TrackingStatus::InProgress)
            .collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        active
    }

    pub fn latest_for_driver(&self, driver_id: &str) -> Option<&RouteProgress> {
        self.sessions
            .values()
            .filter(|p| p.driver_id == driver_id)
            .max_by_key(|p| p.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(session_id: Uuid) -> RouteTrackingEvent {
        RouteTrackingEvent::SessionStarted {
            session_id,
            driver_id: "driver-1".to_string(),
            start: Coordinate { lat: 28.6139, lng: 77.2090 },
            end: Coordinate { lat: 28.7, lng: 77.3 },
            waypoints: 5,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_progress_follows_events() {
        let session_id = Uuid::new_v4();
        let mut store = TrackingProjectionStore::new();
        store.apply_event(&started(session_id));
        assert_eq!(store.active_sessions().len(), 1);

        store.apply_event(&RouteTrackingEvent::PositionAdvanced {
            session_id,
            driver_id: "driver-1".to_string(),
            position: Coordinate { lat: 28.65, lng: 77.25 },
            waypoint_index: 2,
            timestamp: Utc::now(),
        });
        let progress = store.latest_for_driver("driver-1").unwrap();
        assert_eq!(progress.waypoint_index, 2);
        assert!((progress.progress() - 0.5).abs() < f64::EPSILON);

        store.apply_event(&RouteTrackingEvent::SessionCompleted {
            session_id,
            driver_id: "driver-1".to_string(),
            final_position: Coordinate { lat: 28.7, lng: 77.3 },
            reason: CompletionReason::PathExhausted,
            timestamp: Utc::now(),
        });
        let progress = &store.sessions[&session_id];
        assert_eq!(progress.status, TrackingStatus::Completed);
        assert_eq!(progress.progress(), 1.0);
        assert!(store.active_sessions().is_empty());
    }

    #[test]
    fn test_completed_progress_ignores_late_events() {
        let session_id = Uuid::new_v4();
        let mut store = TrackingProjectionStore::new();
        store.apply_event(&started(session_id));
        store.apply_event(&RouteTrackingEvent::SessionCompleted {
            session_id,
            driver_id: "driver-1".to_string(),
            final_position: Coordinate { lat: 28.62, lng: 77.22 },
            reason: CompletionReason::Stopped,
            timestamp: Utc::now(),
        });
        store.apply_event(&RouteTrackingEvent::PositionAdvanced {
            session_id,
            driver_id: "driver-1".to_string(),
            position: Coordinate { lat: 28.65, lng: 77.25 },
            waypoint_index: 2,
            timestamp: Utc::now(),
        });
        let progress = &store.sessions[&session_id];
        assert_eq!(progress.last_position, Coordinate { lat: 28.62, lng: 77.22 });
        assert_eq!(progress.waypoint_index, 0);
    }

    #[test]
    fn test_events_for_unknown_sessions_are_ignored() {
        let mut store = TrackingProjectionStore::new();
        store.apply_event(&RouteTrackingEvent::PositionAdvanced {
            session_id: Uuid::new_v4(),
            driver_id: "driver-9".to_string(),
            position: Coordinate { lat: 1.0, lng: 1.0 },
            waypoint_index: 1,
            timestamp: Utc::now(),
        });
        assert!(store.sessions.is_empty());
    }
}
