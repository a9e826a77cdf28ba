//! Route session engine.
//!
//! Drives one tracking session per driver: resolves the path, creates or
//! resumes the persisted record, advances the vehicle one waypoint per tick and
//! completes the session when the path runs out or the route is stopped.
//!
//! Each session runs two tasks. The tick task owns the schedule and the path
//! index and never awaits storage. The writer task persists positions in index
//! order, collapsing a backlog to the newest waypoint when writes are slow.

use super::events::{CompletionReason, RouteTrackingEvent};
use super::ports::{PathProvider, TrackingStore};
use super::session::TrackingSession;
use super::types::{Coordinate, NewTrackingSession, Path, TrackingStatus};
use crate::common::{DomainError, DomainEvent, StoreError, StoreResult, TrackingError, TrackingResult};
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default time between two position advances.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Endpoints of a resumed session may drift this far (metres) from the
/// requested ones before a warning is logged.
const ENDPOINT_TOLERANCE_M: f64 = 1.0;

struct SessionCore {
    session_id: Uuid,
    driver_id: String,
    path: Arc<Path>,
    store: Arc<dyn TrackingStore>,
    state: watch::Sender<TrackingSession>,
    lifecycle: Mutex<()>,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<RouteTrackingEvent>>,
}

impl SessionCore {
    fn publish(&self, event: RouteTrackingEvent) {
        if let Some(sender) = &self.events {
            // Never let a slow consumer hold up the tick schedule.
            let event_type = event.event_type();
            if let Err(e) = sender.try_send(event) {
                debug!(session_id = %self.session_id, event_type, error = %e, "Tracking event dropped");
            }
        }
    }

    fn is_active(&self) -> bool {
        self.state.borrow().is_in_progress() && !self.cancel.is_cancelled()
    }

    /// Persists the transition to completed. Returns `false` if the session was
    /// already completed.
    async fn finish(&self, reason: CompletionReason) -> TrackingResult<bool> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.state.borrow().is_in_progress() {
            return Ok(false);
        }

        let completed_at = Utc::now();
        self.store
            .complete(self.session_id, completed_at)
            .await
            .map_err(|e| TrackingError::persistence("complete", e))?;

        let mut final_position = None;
        self.state.send_modify(|session| {
            session.complete(completed_at);
            final_position = Some(session.current());
        });
        let final_position = final_position.unwrap_or_else(|| self.path.last());

        info!(
            session_id = %self.session_id,
            driver_id = %self.driver_id,
            ?reason,
            position = %final_position,
            "Tracking session completed"
        );
        self.publish(RouteTrackingEvent::SessionCompleted {
            session_id: self.session_id,
            driver_id: self.driver_id.clone(),
            final_position,
            reason,
            timestamp: completed_at,
        });
        Ok(true)
    }
}

/// Handle to a session driven by a [`RouteSessionEngine`].
///
/// Clones share the session. Dropping the last clone cancels the tick timer
/// without completing the session, so it can be resumed later.
#[derive(Clone)]
pub struct SessionHandle {
    core: Arc<SessionCore>,
    _timer: Arc<DropGuard>,
}

impl SessionHandle {
    pub fn session_id(&self) -> Uuid {
        self.core.session_id
    }

    pub fn driver_id(&self) -> &str {
        &self.core.driver_id
    }

    pub fn path(&self) -> &Path {
        &self.core.path
    }

    pub fn snapshot(&self) -> TrackingSession {
        self.core.state.borrow().clone()
    }

    pub fn current(&self) -> Coordinate {
        self.core.state.borrow().current()
    }

    pub fn status(&self) -> TrackingStatus {
        self.core.state.borrow().status()
    }

    /// True while the session is in progress and its timer is still running.
    pub fn is_active(&self) -> bool {
        self.core.is_active()
    }

    pub fn watch(&self) -> watch::Receiver<TrackingSession> {
        self.core.state.subscribe()
    }

    /// Resolves once the session has completed.
    pub async fn wait_until_completed(&self) -> TrackingSession {
        let mut rx = self.core.state.subscribe();
        let finished = match rx.wait_for(|session| !session.is_in_progress()).await {
            Ok(session) => session.clone(),
            Err(_) => self.snapshot(),
        };
        finished
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.core.session_id)
            .field("driver_id", &self.core.driver_id)
            .field("status", &self.status())
            .finish()
    }
}

struct RegisteredSession {
    core: Arc<SessionCore>,
    timer: Weak<DropGuard>,
}

impl RegisteredSession {
    fn handle(&self) -> Option<SessionHandle> {
        let timer = self.timer.upgrade()?;
        Some(SessionHandle {
            core: self.core.clone(),
            _timer: timer,
        })
    }
}

pub struct RouteSessionEngine {
    store: Arc<dyn TrackingStore>,
    paths: Arc<dyn PathProvider>,
    tick_interval: Duration,
    events: Option<mpsc::Sender<RouteTrackingEvent>>,
    sessions: Mutex<HashMap<String, RegisteredSession>>,
    /// One lock per driver, held for a whole `start_route`.
    starting: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RouteSessionEngine {
    pub fn new(store: Arc<dyn TrackingStore>, paths: Arc<dyn PathProvider>) -> Self {
        Self {
            store,
            paths,
            tick_interval: DEFAULT_TICK_INTERVAL,
            events: None,
            sessions: Mutex::new(HashMap::new()),
            starting: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Publishes lifecycle and position events to `sender`. Events are dropped
    /// when the channel is full.
    pub fn with_event_sink(mut self, sender: mpsc::Sender<RouteTrackingEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Starts (or resumes) the driver's route and begins advancing it.
    ///
    /// Fails with `RoutingUnavailable` before touching the store if no path can
    /// be resolved, and with `PersistenceWriteFailed` if the create or resume
    /// write does not go through.
    pub async fn start_route(
        &self,
        driver_id: &str,
        start: Coordinate,
        end: Coordinate,
    ) -> TrackingResult<SessionHandle> {
        if driver_id.trim().is_empty() {
            return Err(DomainError::InvalidCommand {
                reason: "driver id must not be empty".to_string(),
            }
            .into());
        }
        for point in [start, end] {
            if !point.is_valid() {
                return Err(DomainError::InvalidCoordinate { lat: point.lat, lng: point.lng }.into());
            }
        }

        // Starts for one driver run one at a time, so this engine never runs two
        // timers for a driver. Other drivers are not held up.
        let driver_lock = self.driver_lock(driver_id).await;
        let _starting = driver_lock.lock().await;
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(handle) = sessions
                .get(driver_id)
                .and_then(RegisteredSession::handle)
                .filter(SessionHandle::is_active)
            {
                debug!(driver_id, session_id = %handle.session_id(), "Route already running");
                return Ok(handle);
            }
            sessions.remove(driver_id);
        }

        let existing = self
            .store
            .find_latest_in_progress(driver_id)
            .await
            .map_err(|e| TrackingError::persistence("resume", e))?
            .map(|row| TrackingSession::try_from(&row))
            .transpose()?;

        let (session, path, start_index, resumed) = match existing {
            Some(session) => {
                if !session.start.approx_eq(&start, ENDPOINT_TOLERANCE_M)
                    || !session.end.approx_eq(&end, ENDPOINT_TOLERANCE_M)
                {
                    warn!(
                        driver_id,
                        session_id = %session.id,
                        "Resuming session with its persisted endpoints instead of the requested ones"
                    );
                }
                let path = self.resolve_path(session.start, session.end).await?;
                let (session, index) = self.resume(session, &path).await?;
                (session, path, index, true)
            }
            None => {
                let path = self.resolve_path(start, end).await?;
                match self.create(driver_id, start, end).await {
                    Ok(session) => (session, path, 0, false),
                    Err(StoreError::Conflict { .. }) => {
                        info!(driver_id, "Another process created the session first; resuming it");
                        let winner = self
                            .store
                            .find_latest_in_progress(driver_id)
                            .await
                            .map_err(|e| TrackingError::persistence("resume", e))?
                            .ok_or_else(|| {
                                TrackingError::persistence(
                                    "create",
                                    StoreError::Conflict { driver_id: driver_id.to_string() },
                                )
                            })?;
                        let winner = TrackingSession::try_from(&winner)?;
                        let path = if winner.start == start && winner.end == end {
                            path
                        } else {
                            self.resolve_path(winner.start, winner.end).await?
                        };
                        let (session, index) = self.resume(winner, &path).await?;
                        (session, path, index, true)
                    }
                    Err(e) => return Err(TrackingError::persistence("create", e)),
                }
            }
        };

        let handle = self.spawn_session(session, path, start_index, resumed);
        self.sessions.lock().await.insert(
            driver_id.to_string(),
            RegisteredSession {
                core: handle.core.clone(),
                timer: Arc::downgrade(&handle._timer),
            },
        );
        Ok(handle)
    }

    /// Stops the route: no tick fires after this returns, and the session is
    /// persisted as completed. Stopping a completed session does nothing.
    pub async fn stop_route(&self, handle: &SessionHandle) -> TrackingResult<()> {
        handle.core.cancel.cancel();
        let changed = handle.core.finish(CompletionReason::Stopped).await?;

        let mut sessions = self.sessions.lock().await;
        let owned = sessions
            .get(handle.driver_id())
            .map(|registered| registered.core.session_id == handle.session_id())
            .unwrap_or(false);
        if owned {
            sessions.remove(handle.driver_id());
        }
        if !changed {
            debug!(session_id = %handle.session_id(), "Stop requested for a completed session");
        }
        Ok(())
    }

    /// The handle of the driver's session if this engine is currently driving it.
    pub async fn active_session(&self, driver_id: &str) -> Option<SessionHandle> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(driver_id)
            .and_then(RegisteredSession::handle)
            .filter(SessionHandle::is_active)
    }

    async fn driver_lock(&self, driver_id: &str) -> Arc<Mutex<()>> {
        let mut starting = self.starting.lock().await;
        starting.entry(driver_id.to_string()).or_default().clone()
    }

    async fn resolve_path(&self, start: Coordinate, end: Coordinate) -> TrackingResult<Arc<Path>> {
        match self.paths.route(start, end).await {
            Ok(path) => Ok(Arc::new(path)),
            Err(e) => {
                warn!(%start, %end, error = %e, "Path provider could not resolve a route");
                Err(e.into())
            }
        }
    }

    async fn create(&self, driver_id: &str, start: Coordinate, end: Coordinate) -> StoreResult<TrackingSession> {
        let new_session = NewTrackingSession {
            driver_id: driver_id.to_string(),
            start,
            end,
            started_at: Utc::now(),
        };
        let id = self.store.create(new_session.clone()).await?;
        Ok(TrackingSession::begin(id, new_session))
    }

    /// Snaps the persisted position onto the path and writes it back.
    async fn resume(&self, mut session: TrackingSession, path: &Path) -> TrackingResult<(TrackingSession, usize)> {
        let index = path.nearest_index(&session.current());
        let position = path.get(index).unwrap_or_else(|| path.first());
        self.store
            .update_position(session.id, position)
            .await
            .map_err(|e| TrackingError::persistence("resume", e))?;
        session.advance_to(position)?;
        Ok((session, index))
    }

    fn spawn_session(&self, session: TrackingSession, path: Arc<Path>, start_index: usize, resumed: bool) -> SessionHandle {
        let cancel = CancellationToken::new();
        let (state, _) = watch::channel(session.clone());
        let core = Arc::new(SessionCore {
            session_id: session.id,
            driver_id: session.driver_id.clone(),
            path,
            store: self.store.clone(),
            state,
            lifecycle: Mutex::new(()),
            cancel: cancel.clone(),
            events: self.events.clone(),
        });

        let timestamp = Utc::now();
        let event = if resumed {
            info!(
                session_id = %session.id,
                driver_id = %session.driver_id,
                waypoint_index = start_index,
                waypoints = core.path.len(),
                "Resumed tracking session"
            );
            RouteTrackingEvent::SessionResumed {
                session_id: session.id,
                driver_id: session.driver_id.clone(),
                position: session.current(),
                waypoint_index: start_index,
                waypoints: core.path.len(),
                timestamp,
            }
        } else {
            info!(
                session_id = %session.id,
                driver_id = %session.driver_id,
                waypoints = core.path.len(),
                "Started tracking session"
            );
            RouteTrackingEvent::SessionStarted {
                session_id: session.id,
                driver_id: session.driver_id.clone(),
                start: session.start,
                end: session.end,
                waypoints: core.path.len(),
                timestamp,
            }
        };
        core.publish(event);

        tokio::spawn(drive(core.clone(), start_index, self.tick_interval));

        SessionHandle {
            core,
            _timer: Arc::new(cancel.drop_guard()),
        }
    }
}

async fn drive(core: Arc<SessionCore>, start_index: usize, tick_interval: Duration) {
    let (positions, pending) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_positions(core.store.clone(), core.session_id, pending));

    let mut ticker = interval_at(Instant::now() + tick_interval, tick_interval);
    let mut index = start_index;

    let exhausted = loop {
        tokio::select! {
            biased;

            _ = core.cancel.cancelled() => break false,

            _ = ticker.tick() => {
                index += 1;
                let Some(waypoint) = core.path.get(index) else {
                    break true;
                };
                let advanced = core
                    .state
                    .send_if_modified(|session| session.advance_to(waypoint).is_ok());
                if !advanced {
                    break false;
                }
                // The writer only goes away when this loop drops the sender.
                let _ = positions.send((index, waypoint));
                core.publish(RouteTrackingEvent::PositionAdvanced {
                    session_id: core.session_id,
                    driver_id: core.driver_id.clone(),
                    position: waypoint,
                    waypoint_index: index,
                    timestamp: Utc::now(),
                });
            }
        }
    };

    drop(positions);
    if !exhausted {
        debug!(session_id = %core.session_id, "Tick timer cancelled");
        return;
    }

    // Let the final waypoint land before the completion write.
    if let Err(e) = writer.await {
        warn!(session_id = %core.session_id, error = %e, "Position writer aborted");
    }
    if let Err(e) = core.finish(CompletionReason::PathExhausted).await {
        error!(
            session_id = %core.session_id,
            error = %e,
            "Failed to persist completion; the session stays in progress until resumed or stopped"
        );
    }
    core.cancel.cancel();
}

async fn write_positions(
    store: Arc<dyn TrackingStore>,
    session_id: Uuid,
    mut pending: mpsc::UnboundedReceiver<(usize, Coordinate)>,
) {
    while let Some(mut next) = pending.recv().await {
        let mut superseded = 0usize;
        while let Ok(newer) = pending.try_recv() {
            next = newer;
            superseded += 1;
        }
        if superseded > 0 {
            debug!(%session_id, superseded, "Skipped stale position writes");
        }

        let (index, position) = next;
        if let Err(e) = store.update_position(session_id, position).await {
            warn!(%session_id, waypoint_index = index, error = %e, "Dropped position update");
        }
    }
}
