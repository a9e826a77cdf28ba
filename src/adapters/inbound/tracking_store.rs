use crate::common::{StoreError, StoreResult};
use crate::domains::route_tracking::{
    Coordinate, NewTrackingSession, TrackingRow, TrackingSession, TrackingStore, TrackingSubscription,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

struct StoredRecord {
    session: TrackingSession,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    position_writes: u64,
}

impl StoredRecord {
    fn row(&self) -> TrackingRow {
        self.session.to_row(self.created_at, self.updated_at)
    }
}

struct Subscriber {
    driver_id: String,
    sender: mpsc::UnboundedSender<TrackingRow>,
}

#[derive(Default)]
struct State {
    records: HashMap<Uuid, StoredRecord>,
    subscribers: Vec<Subscriber>,
}

impl State {
    /// Called with the write lock held, so feeds see changes in apply order.
    fn publish(&mut self, row: TrackingRow) {
        self.subscribers.retain(|subscriber| {
            if subscriber.driver_id != row.driver_id {
                return !subscriber.sender.is_closed();
            }
            subscriber.sender.send(row.clone()).is_ok()
        });
    }
}

/// Remaining number of forced failures per operation.
#[derive(Default)]
struct Faults {
    creates: usize,
    queries: usize,
    position_writes: usize,
    completions: usize,
    subscribes: usize,
}

fn take_fault(counter: &mut usize) -> bool {
    if *counter == 0 {
        return false;
    }
    *counter -= 1;
    true
}

/// In-memory tracking store for tests, demos and single-process deployments.
///
/// Besides the store contract it can inject failures and drop or spoof change
/// feed traffic, which is how the engine's and observer's recovery paths are
/// exercised.
#[derive(Default)]
pub struct InMemoryTrackingStore {
    state: RwLock<State>,
    faults: Mutex<Faults>,
}

impl InMemoryTrackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn fault(&self, pick: impl FnOnce(&mut Faults) -> &mut usize, operation: &str) -> StoreResult<()> {
        let mut faults = self
            .faults
            .lock()
            .map_err(|_| StoreError::Backend("fault table poisoned".to_string()))?;
        if take_fault(pick(&mut faults)) {
            return Err(StoreError::Backend(format!("injected {} failure", operation)));
        }
        Ok(())
    }

    fn set_fault(&self, pick: impl FnOnce(&mut Faults) -> &mut usize, count: usize) {
        if let Ok(mut faults) = self.faults.lock() {
            *pick(&mut faults) = count;
        }
    }

    pub fn fail_creates(&self, count: usize) {
        self.set_fault(|f| &mut f.creates, count);
    }

    pub fn fail_queries(&self, count: usize) {
        self.set_fault(|f| &mut f.queries, count);
    }

    pub fn fail_position_writes(&self, count: usize) {
        self.set_fault(|f| &mut f.position_writes, count);
    }

    pub fn fail_completions(&self, count: usize) {
        self.set_fault(|f| &mut f.completions, count);
    }

    pub fn fail_subscribes(&self, count: usize) {
        self.set_fault(|f| &mut f.subscribes, count);
    }

    /// Closes every open change feed, as a transport failure would.
    pub async fn drop_subscriptions(&self) {
        self.state.write().await.subscribers.clear();
    }

    /// Delivers `row` to the driver's feeds without touching stored records.
    pub async fn inject_change(&self, row: TrackingRow) {
        self.state.write().await.publish(row);
    }

    pub async fn subscriber_count(&self) -> usize {
        let state = self.state.read().await;
        state.subscribers.iter().filter(|s| !s.sender.is_closed()).count()
    }

    pub async fn get(&self, id: Uuid) -> Option<TrackingRow> {
        self.state.read().await.records.get(&id).map(StoredRecord::row)
    }

    pub async fn sessions_for(&self, driver_id: &str) -> Vec<TrackingSession> {
        let state = self.state.read().await;
        let mut sessions: Vec<TrackingSession> = state
            .records
            .values()
            .filter(|r| r.session.driver_id == driver_id)
            .map(|r| r.session.clone())
            .collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        sessions
    }

    pub async fn position_writes(&self, id: Uuid) -> u64 {
        self.state
            .read()
            .await
            .records
            .get(&id)
            .map(|r| r.position_writes)
            .unwrap_or(0)
    }
}

#[async_trait]
impl TrackingStore for InMemoryTrackingStore {
    async fn create(&self, session: NewTrackingSession) -> StoreResult<Uuid> {
        self.fault(|f| &mut f.creates, "create")?;
        let mut state = self.state.write().await;

        let conflict = state
            .records
            .values()
            .any(|r| r.session.driver_id == session.driver_id && r.session.is_in_progress());
        if conflict {
            return Err(StoreError::Conflict { driver_id: session.driver_id });
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let record = StoredRecord {
            session: TrackingSession::begin(id, session),
            created_at: now,
            updated_at: now,
            position_writes: 0,
        };
        let row = record.row();
        state.records.insert(id, record);
        state.publish(row);
        Ok(id)
    }

    async fn find_latest_in_progress(&self, driver_id: &str) -> StoreResult<Option<TrackingRow>> {
        self.fault(|f| &mut f.queries, "query")?;
        let state = self.state.read().await;
        Ok(state
            .records
            .values()
            .filter(|r| r.session.driver_id == driver_id && r.session.is_in_progress())
            .max_by_key(|r| r.session.started_at)
            .map(StoredRecord::row))
    }

    async fn update_position(&self, id: Uuid, position: Coordinate) -> StoreResult<()> {
        self.fault(|f| &mut f.position_writes, "position write")?;
        let mut state = self.state.write().await;

        let record = state.records.get_mut(&id).ok_or(StoreError::NotFound { id })?;
        record
            .session
            .advance_to(position)
            .map_err(|_| StoreError::NotActive { id })?;
        record.updated_at = Utc::now();
        record.position_writes += 1;
        let row = record.row();
        state.publish(row);
        Ok(())
    }

    async fn complete(&self, id: Uuid, completed_at: DateTime<Utc>) -> StoreResult<()> {
        self.fault(|f| &mut f.completions, "complete")?;
        let mut state = self.state.write().await;

        let record = state.records.get_mut(&id).ok_or(StoreError::NotFound { id })?;
        if !record.session.complete(completed_at) {
            return Ok(());
        }
        record.updated_at = Utc::now();
        let row = record.row();
        state.publish(row);
        Ok(())
    }

    async fn subscribe(&self, driver_id: &str) -> StoreResult<Box<dyn TrackingSubscription>> {
        self.fault(|f| &mut f.subscribes, "subscribe")?;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.state.write().await.subscribers.push(Subscriber {
            driver_id: driver_id.to_string(),
            sender,
        });
        Ok(Box::new(InMemorySubscription { receiver, closed: false }))
    }
}

struct InMemorySubscription {
    receiver: mpsc::UnboundedReceiver<TrackingRow>,
    closed: bool,
}

#[async_trait]
impl TrackingSubscription for InMemorySubscription {
    async fn next_change(&mut self) -> Option<TrackingRow> {
        if self.closed {
            return None;
        }
        self.receiver.recv().await
    }

    fn unsubscribe(&mut self) {
        self.closed = true;
        self.receiver.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::route_tracking::TrackingStatus;
    use tokio_test::{assert_err, assert_ok};

    fn new_session(driver_id: &str) -> NewTrackingSession {
        NewTrackingSession {
            driver_id: driver_id.to_string(),
            start: Coordinate { lat: 28.6139, lng: 77.2090 },
            end: Coordinate { lat: 28.7, lng: 77.3 },
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_at_most_one_in_progress_session_per_driver() {
        let store = InMemoryTrackingStore::new();
        let first = store.create(new_session("driver-1")).await.unwrap();

        let err = store.create(new_session("driver-1")).await.unwrap_err();
        assert_eq!(err, StoreError::Conflict { driver_id: "driver-1".to_string() });
        assert_ok!(store.create(new_session("driver-2")).await);

        assert_ok!(store.complete(first, Utc::now()).await);
        assert_ok!(store.create(new_session("driver-1")).await);
        assert_eq!(store.sessions_for("driver-1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_completed_sessions_are_terminal() {
        let store = InMemoryTrackingStore::new();
        let id = store.create(new_session("driver-1")).await.unwrap();
        let completed_at = Utc::now();
        store.complete(id, completed_at).await.unwrap();

        let err = store
            .update_position(id, Coordinate { lat: 28.65, lng: 77.25 })
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotActive { id });

        assert_ok!(store.complete(id, Utc::now()).await);
        let row = store.get(id).await.unwrap();
        assert_eq!(row.status().unwrap(), TrackingStatus::Completed);
        assert_eq!(row.completed_at, Some(completed_at));
        assert_eq!(row.current_lat, Some(28.6139));
        assert!(store.find_latest_in_progress("driver-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_feed_delivers_changes_in_order() {
        let store = InMemoryTrackingStore::new();
        let mut feed = store.subscribe("driver-1").await.unwrap();
        let mut other = store.subscribe("driver-2").await.unwrap();

        let id = store.create(new_session("driver-1")).await.unwrap();
        store.update_position(id, Coordinate { lat: 28.65, lng: 77.25 }).await.unwrap();
        store.complete(id, Utc::now()).await.unwrap();

        let created = feed.next_change().await.unwrap();
        assert_eq!(created.current_lat, Some(28.6139));
        let moved = feed.next_change().await.unwrap();
        assert_eq!(moved.current_lat, Some(28.65));
        let done = feed.next_change().await.unwrap();
        assert_eq!(done.status, "completed");

        other.unsubscribe();
        assert!(other.next_change().await.is_none());
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let store = InMemoryTrackingStore::new();
        store.fail_creates(1);
        assert_err!(store.create(new_session("driver-1")).await);
        let id = store.create(new_session("driver-1")).await.unwrap();

        store.fail_position_writes(2);
        let position = Coordinate { lat: 28.65, lng: 77.25 };
        assert_err!(store.update_position(id, position).await);
        assert_err!(store.update_position(id, position).await);
        assert_ok!(store.update_position(id, position).await);
        assert_eq!(store.position_writes(id).await, 1);
    }

    #[tokio::test]
    async fn test_drop_subscriptions_ends_feeds() {
        let store = InMemoryTrackingStore::new();
        let mut feed = store.subscribe("driver-1").await.unwrap();
        assert_eq!(store.subscriber_count().await, 1);

        store.drop_subscriptions().await;
        assert!(feed.next_change().await.is_none());
        assert_eq!(store.subscriber_count().await, 0);
    }
}
