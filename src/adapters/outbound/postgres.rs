use crate::common::{StoreError, StoreResult};
use crate::config::PostgresConfig;
use crate::domains::route_tracking::{
    Coordinate, NewTrackingSession, TrackingRow, TrackingStatus, TrackingStore, TrackingSubscription,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, PoolConfig, Runtime};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Row};
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

const SELECT_COLUMNS: &str = "id, driver_id, start_lat, start_lng, end_lat, end_lng, current_lat, current_lng, \
     status, started_at, completed_at, created_at, updated_at, change_seq";

/// Tracking store on the `vehicle_tracking` table.
///
/// A partial unique index keeps one in-progress row per driver. Every write
/// bumps `change_seq`, which the polling change feed follows.
pub struct PostgresTrackingStore {
    pool: Pool,
    poll_interval: Duration,
}

impl PostgresTrackingStore {
    pub async fn new(config: PostgresConfig, poll_interval: Duration) -> Result<Self, String> {
        let mut pg_config = Config::new();
        pg_config.host = Some(config.host);
        pg_config.port = Some(config.port);
        pg_config.dbname = Some(config.database);
        pg_config.user = Some(config.username);
        pg_config.password = Some(config.password);
        pg_config.pool = Some(PoolConfig::new(config.max_connections as usize));

        let pool = pg_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| format!("Failed to create PostgreSQL pool: {}", e))?;

        let store = Self::from_pool(pool, poll_interval);
        store.initialize_schema().await?;
        Ok(store)
    }

    pub fn from_pool(pool: Pool, poll_interval: Duration) -> Self {
        Self { pool, poll_interval }
    }

    pub async fn initialize_schema(&self) -> Result<(), String> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| format!("Failed to get database connection: {}", e))?;

        let schema = r#"
            CREATE SEQUENCE IF NOT EXISTS vehicle_tracking_change_seq;

            CREATE TABLE IF NOT EXISTS vehicle_tracking (
                id UUID PRIMARY KEY,
                driver_id TEXT NOT NULL,
                start_lat DOUBLE PRECISION,
                start_lng DOUBLE PRECISION,
                end_lat DOUBLE PRECISION,
                end_lng DOUBLE PRECISION,
                current_lat DOUBLE PRECISION,
                current_lng DOUBLE PRECISION,
                status TEXT NOT NULL DEFAULT 'in_progress'
                    CHECK (status IN ('in_progress', 'completed')),
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                change_seq BIGINT NOT NULL DEFAULT nextval('vehicle_tracking_change_seq'),
                CHECK ((status = 'completed') = (completed_at IS NOT NULL))
            );

            CREATE UNIQUE INDEX IF NOT EXISTS uq_vehicle_tracking_driver_in_progress
            ON vehicle_tracking(driver_id) WHERE status = 'in_progress';

            CREATE INDEX IF NOT EXISTS idx_vehicle_tracking_driver_change
            ON vehicle_tracking(driver_id, change_seq);
        "#;

        client
            .batch_execute(schema)
            .await
            .map_err(|e| format!("Failed to initialize database schema: {}", e))?;
        Ok(())
    }

    async fn client(&self) -> StoreResult<deadpool_postgres::Client> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to get database connection: {}", e)))
    }

    async fn exists(&self, client: &deadpool_postgres::Client, id: Uuid) -> StoreResult<bool> {
        let row = client
            .query_opt("SELECT 1 FROM vehicle_tracking WHERE id = $1", &[&id])
            .await
            .map_err(backend("lookup"))?;
        Ok(row.is_some())
    }
}

fn backend(operation: &'static str) -> impl Fn(tokio_postgres::Error) -> StoreError {
    move |e| StoreError::Backend(format!("{} failed: {}", operation, e))
}

fn decode_row(row: &Row) -> StoreResult<TrackingRow> {
    let decode = |e: tokio_postgres::Error| StoreError::Backend(format!("Failed to decode tracking row: {}", e));
    Ok(TrackingRow {
        id: row.try_get("id").map_err(decode)?,
        driver_id: row.try_get("driver_id").map_err(decode)?,
        start_lat: row.try_get("start_lat").map_err(decode)?,
        start_lng: row.try_get("start_lng").map_err(decode)?,
        end_lat: row.try_get("end_lat").map_err(decode)?,
        end_lng: row.try_get("end_lng").map_err(decode)?,
        current_lat: row.try_get("current_lat").map_err(decode)?,
        current_lng: row.try_get("current_lng").map_err(decode)?,
        status: row.try_get("status").map_err(decode)?,
        started_at: row.try_get("started_at").map_err(decode)?,
        completed_at: row.try_get("completed_at").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

#[async_trait]
impl TrackingStore for PostgresTrackingStore {
    async fn create(&self, session: NewTrackingSession) -> StoreResult<Uuid> {
        let client = self.client().await?;
        let id = Uuid::new_v4();
        let status = TrackingStatus::InProgress.as_str();

        let result = client
            .execute(
                "INSERT INTO vehicle_tracking
                    (id, driver_id, start_lat, start_lng, end_lat, end_lng, current_lat, current_lng, status, started_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $3, $4, $7, $8)",
                &[
                    &id,
                    &session.driver_id,
                    &session.start.lat,
                    &session.start.lng,
                    &session.end.lat,
                    &session.end.lng,
                    &status,
                    &session.started_at,
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(id),
            Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                Err(StoreError::Conflict { driver_id: session.driver_id })
            }
            Err(e) => Err(backend("insert")(e)),
        }
    }

    async fn find_latest_in_progress(&self, driver_id: &str) -> StoreResult<Option<TrackingRow>> {
        let client = self.client().await?;
        let query = format!(
            "SELECT {} FROM vehicle_tracking
             WHERE driver_id = $1 AND status = 'in_progress'
             ORDER BY started_at DESC NULLS LAST
             LIMIT 1",
            SELECT_COLUMNS
        );
        let row = client
            .query_opt(query.as_str(), &[&driver_id])
            .await
            .map_err(backend("query"))?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn update_position(&self, id: Uuid, position: Coordinate) -> StoreResult<()> {
        let client = self.client().await?;
        let updated = client
            .execute(
                "UPDATE vehicle_tracking
                 SET current_lat = $2, current_lng = $3, updated_at = NOW(),
                     change_seq = nextval('vehicle_tracking_change_seq')
                 WHERE id = $1 AND status = 'in_progress'",
                &[&id, &position.lat, &position.lng],
            )
            .await
            .map_err(backend("update"))?;

        if updated == 0 {
            return if self.exists(&client, id).await? {
                Err(StoreError::NotActive { id })
            } else {
                Err(StoreError::NotFound { id })
            };
        }
        Ok(())
    }

    async fn complete(&self, id: Uuid, completed_at: DateTime<Utc>) -> StoreResult<()> {
        let client = self.client().await?;
        let updated = client
            .execute(
                "UPDATE vehicle_tracking
                 SET status = 'completed', completed_at = $2, updated_at = NOW(),
                     change_seq = nextval('vehicle_tracking_change_seq')
                 WHERE id = $1 AND status = 'in_progress'",
                &[&id, &completed_at],
            )
            .await
            .map_err(backend("complete"))?;

        if updated == 0 && !self.exists(&client, id).await? {
            return Err(StoreError::NotFound { id });
        }
        Ok(())
    }

    async fn subscribe(&self, driver_id: &str) -> StoreResult<Box<dyn TrackingSubscription>> {
        let client = self.client().await?;
        let cursor: i64 = client
            .query_one(
                "SELECT COALESCE(MAX(change_seq), 0) FROM vehicle_tracking WHERE driver_id = $1",
                &[&driver_id],
            )
            .await
            .map_err(backend("subscribe"))?
            .try_get(0)
            .map_err(backend("subscribe"))?;
        drop(client);

        let (sender, receiver) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        tokio::spawn(poll_changes(
            self.pool.clone(),
            driver_id.to_string(),
            cursor,
            self.poll_interval,
            sender,
            cancel.clone(),
        ));

        Ok(Box::new(PollingSubscription {
            receiver,
            cancel: cancel.clone(),
            _poller: cancel.drop_guard(),
        }))
    }
}

/// Follows `change_seq` for one driver. Exits, closing the feed, on the first
/// database error or when the subscription goes away.
async fn poll_changes(
    pool: Pool,
    driver_id: String,
    mut cursor: i64,
    poll_interval: Duration,
    sender: mpsc::Sender<TrackingRow>,
    cancel: CancellationToken,
) {
    let query = format!(
        "SELECT {} FROM vehicle_tracking WHERE driver_id = $1 AND change_seq > $2 ORDER BY change_seq",
        SELECT_COLUMNS
    );
    let mut ticker = tokio::time::interval(poll_interval);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let rows = match pool.get().await {
            Ok(client) => client.query(query.as_str(), &[&driver_id, &cursor]).await,
            Err(e) => {
                tracing::warn!(%driver_id, error = %e, "Change feed lost its connection");
                return;
            }
        };
        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(%driver_id, error = %e, "Change feed query failed");
                return;
            }
        };

        for row in rows {
            let seq: i64 = match row.try_get("change_seq") {
                Ok(seq) => seq,
                Err(e) => {
                    tracing::warn!(%driver_id, error = %e, "Change feed row without sequence");
                    return;
                }
            };
            let tracking_row = match decode_row(&row) {
                Ok(tracking_row) => tracking_row,
                Err(e) => {
                    tracing::warn!(%driver_id, error = %e, "Skipping undecodable tracking row");
                    cursor = seq;
                    continue;
                }
            };
            if sender.send(tracking_row).await.is_err() {
                return;
            }
            cursor = seq;
        }
    }
}

struct PollingSubscription {
    receiver: mpsc::Receiver<TrackingRow>,
    cancel: CancellationToken,
    _poller: DropGuard,
}

#[async_trait]
impl TrackingSubscription for PollingSubscription {
    async fn next_change(&mut self) -> Option<TrackingRow> {
        self.receiver.recv().await
    }

    fn unsubscribe(&mut self) {
        self.cancel.cancel();
        self.receiver.close();
    }
}
