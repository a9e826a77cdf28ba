//! Live observer for a driver's tracked position.
//!
//! Opens the store's change feed, seeds the observed value with a point query
//! and then follows the feed. A dropped feed is reestablished with exponential
//! backoff, followed by a fresh point query since the store keeps no history to
//! replay.

use super::ports::{TrackingStore, TrackingSubscription};
use super::types::{ObservedPosition, TrackingRow};
use crate::common::{DomainError, TrackingError, TrackingResult};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ObserverSettings {
    /// Consecutive failed reconnects before the observer reports `Degraded`.
    pub reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ObserverSettings {
    fn default() -> Self {
        Self {
            reconnect_attempts: 5,
            reconnect_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl ObserverSettings {
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .reconnect_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);
        let jitter_ms = (delay.as_millis() as u64 / 10).max(1);
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }
}

pub struct LiveObserver {
    store: Arc<dyn TrackingStore>,
    settings: ObserverSettings,
}

impl LiveObserver {
    pub fn new(store: Arc<dyn TrackingStore>) -> Self {
        Self {
            store,
            settings: ObserverSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ObserverSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Starts watching `driver_id`. The returned handle already holds the
    /// result of the initial point query.
    pub async fn observe(&self, driver_id: &str) -> TrackingResult<ObservationHandle> {
        if driver_id.trim().is_empty() {
            return Err(DomainError::InvalidCommand {
                reason: "driver id must not be empty".to_string(),
            }
            .into());
        }

        // Subscribe before querying so nothing written in between is missed.
        let subscription = match self.store.subscribe(driver_id).await {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                warn!(driver_id, error = %e, "Subscribe failed; retrying in the background");
                None
            }
        };

        let initial = match self.store.find_latest_in_progress(driver_id).await {
            Ok(Some(row)) => ObservedPosition::from_row(&row),
            Ok(None) => ObservedPosition::NoActiveSession,
            Err(e) => {
                warn!(driver_id, error = %e, "Initial position query failed");
                ObservedPosition::Degraded
            }
        };

        let (position, receiver) = watch::channel(initial);
        let cancel = CancellationToken::new();
        let observation = Observation {
            store: self.store.clone(),
            driver_id: driver_id.to_string(),
            settings: self.settings.clone(),
            position,
            cancel: cancel.clone(),
        };
        tokio::spawn(observation.run(subscription));

        debug!(driver_id, "Observation started");
        Ok(ObservationHandle {
            driver_id: driver_id.to_string(),
            position: receiver,
            cancel: cancel.clone(),
            _guard: cancel.drop_guard(),
        })
    }

    pub fn unobserve(&self, handle: &ObservationHandle) {
        handle.unobserve();
    }
}

/// Consumer side of an observation. Dropping it ends the subscription.
pub struct ObservationHandle {
    driver_id: String,
    position: watch::Receiver<ObservedPosition>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl ObservationHandle {
    pub fn driver_id(&self) -> &str {
        &self.driver_id
    }

    pub fn current(&self) -> ObservedPosition {
        self.position.borrow().clone()
    }

    /// A receiver for rendering loops that want to await changes themselves.
    pub fn updates(&self) -> watch::Receiver<ObservedPosition> {
        self.position.clone()
    }

    /// Waits for the next observed value. `None` once the observation has ended.
    pub async fn changed(&mut self) -> Option<ObservedPosition> {
        self.position.changed().await.ok()?;
        Some(self.position.borrow_and_update().clone())
    }

    /// Waits until the observed value satisfies `predicate`.
    pub async fn wait_for<F>(&mut self, predicate: F) -> Option<ObservedPosition>
    where
        F: FnMut(&ObservedPosition) -> bool,
    {
        self.position.wait_for(predicate).await.ok().map(|value| value.clone())
    }

    pub fn is_observing(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Tears the subscription down. Safe to call more than once.
    pub fn unobserve(&self) {
        self.cancel.cancel();
    }
}

struct Observation {
    store: Arc<dyn TrackingStore>,
    driver_id: String,
    settings: ObserverSettings,
    position: watch::Sender<ObservedPosition>,
    cancel: CancellationToken,
}

impl Observation {
    async fn run(self, mut subscription: Option<Box<dyn TrackingSubscription>>) {
        loop {
            let mut active = match subscription.take() {
                Some(active) => active,
                None => match self.reconnect().await {
                    Some(active) => active,
                    None => break,
                },
            };

            loop {
                tokio::select! {
                    biased;

                    _ = self.cancel.cancelled() => {
                        active.unsubscribe();
                        debug!(driver_id = %self.driver_id, "Observation stopped");
                        return;
                    }

                    change = active.next_change() => match change {
                        Some(row) => self.apply(&row),
                        None => break,
                    }
                }
            }
            let dropped = TrackingError::SubscriptionDropped {
                driver_id: self.driver_id.clone(),
                reason: "change feed closed".to_string(),
            };
            warn!(error = %dropped, "Reestablishing tracking subscription");
        }
        debug!(driver_id = %self.driver_id, "Observation stopped");
    }

    /// Last received wins; row timestamps are never used for ordering.
    fn apply(&self, row: &TrackingRow) {
        if row.driver_id != self.driver_id {
            debug!(
                driver_id = %self.driver_id,
                other = %row.driver_id,
                "Ignoring change for another driver"
            );
            return;
        }
        self.position.send_replace(ObservedPosition::from_row(row));
    }

    async fn reconnect(&self) -> Option<Box<dyn TrackingSubscription>> {
        let mut attempt = 0u32;
        loop {
            attempt = attempt.saturating_add(1);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.settings.backoff(attempt)) => {}
            }

            match self.store.subscribe(&self.driver_id).await {
                Ok(subscription) => {
                    self.reconcile().await;
                    info!(driver_id = %self.driver_id, attempt, "Tracking subscription reestablished");
                    return Some(subscription);
                }
                Err(e) => {
                    warn!(driver_id = %self.driver_id, attempt, error = %e, "Reconnect attempt failed");
                    if attempt >= self.settings.reconnect_attempts {
                        self.position.send_if_modified(|current| {
                            if *current == ObservedPosition::Degraded {
                                false
                            } else {
                                *current = ObservedPosition::Degraded;
                                true
                            }
                        });
                    }
                }
            }
        }
    }

    /// Changes made while disconnected are lost; re-read the current row instead.
    async fn reconcile(&self) {
        let observed = match self.store.find_latest_in_progress(&self.driver_id).await {
            Ok(Some(row)) => ObservedPosition::from_row(&row),
            Ok(None) => ObservedPosition::NoActiveSession,
            Err(e) => {
                warn!(driver_id = %self.driver_id, error = %e, "Reconciliation query failed");
                ObservedPosition::Degraded
            }
        };
        self.position.send_replace(observed);
    }
}
