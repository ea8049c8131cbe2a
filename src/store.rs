//! SQLite-backed snapshot and accuracy stores.
//!
//! Both tables are append-only. Timestamps are stored as Unix milliseconds so
//! that window and range filters compare numerically.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use tracing::info;
use utoipa::ToSchema;

use crate::models::{
    from_millis, to_millis, AccuracyRecord, Direction, ForecastSnapshot, TrackKey,
};

/// Open the database, creating the file if needed, and apply migrations
pub async fn connect(database_url: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| StoreError::DatabaseError(e.to_string()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

    migrate(&pool).await?;
    info!(database_url = %database_url, "Database ready");

    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::migrate!()
        .run(pool)
        .await
        .map_err(|e| StoreError::DatabaseError(e.to_string()))
}

/// Internal struct for snapshot rows
#[derive(Debug, FromRow)]
struct SnapshotRow {
    stop_code: String,
    direction: String,
    destination: String,
    forecast_minutes: i64,
    recorded_at: i64,
}

impl TryFrom<SnapshotRow> for ForecastSnapshot {
    type Error = StoreError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        let direction = Direction::parse(&row.direction)
            .ok_or_else(|| StoreError::InvalidRow(format!("unknown direction {}", row.direction)))?;
        let forecast_minutes = u32::try_from(row.forecast_minutes)
            .map_err(|_| StoreError::InvalidRow(format!("bad minutes {}", row.forecast_minutes)))?;

        Ok(ForecastSnapshot {
            stop_code: row.stop_code,
            direction,
            destination: row.destination,
            forecast_minutes,
            recorded_at: from_millis(row.recorded_at),
        })
    }
}

/// Internal struct for accuracy rows
#[derive(Debug, FromRow)]
struct AccuracyRow {
    stop_code: String,
    direction: String,
    destination: String,
    forecasted_minutes: i64,
    actual_minutes: i64,
    accuracy_delta: i64,
    observed_from: i64,
    observed_to: i64,
    calculated_at: i64,
}

impl TryFrom<AccuracyRow> for AccuracyRecord {
    type Error = StoreError;

    fn try_from(row: AccuracyRow) -> Result<Self, Self::Error> {
        let direction = Direction::parse(&row.direction)
            .ok_or_else(|| StoreError::InvalidRow(format!("unknown direction {}", row.direction)))?;

        Ok(AccuracyRecord {
            key: TrackKey {
                stop_code: row.stop_code,
                direction,
                destination: row.destination,
            },
            forecasted_minutes: row.forecasted_minutes,
            actual_minutes: row.actual_minutes,
            accuracy_delta: row.accuracy_delta,
            observed_from: from_millis(row.observed_from),
            observed_to: from_millis(row.observed_to),
            calculated_at: from_millis(row.calculated_at),
        })
    }
}

fn collect_rows<R, T>(rows: Vec<R>) -> Result<Vec<T>, StoreError>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

// --- Snapshot store ---

/// Append one stop's batch in a single transaction; nothing is kept on failure
pub async fn insert_snapshot_batch(
    pool: &SqlitePool,
    snapshots: &[ForecastSnapshot],
) -> Result<u64, StoreError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

    for snapshot in snapshots {
        insert_snapshot(&mut tx, snapshot).await?;
    }

    tx.commit()
        .await
        .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

    Ok(snapshots.len() as u64)
}

async fn insert_snapshot(
    tx: &mut Transaction<'_, Sqlite>,
    snapshot: &ForecastSnapshot,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO snapshots (stop_code, direction, destination, forecast_minutes, forecast_arrival_time, recorded_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&snapshot.stop_code)
    .bind(snapshot.direction.as_str())
    .bind(&snapshot.destination)
    .bind(i64::from(snapshot.forecast_minutes))
    .bind(to_millis(snapshot.forecast_arrival_time()))
    .bind(to_millis(snapshot.recorded_at))
    .execute(&mut **tx)
    .await
    .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

    Ok(())
}

/// All snapshots recorded at or after `since`, grouped by track and in capture order
pub async fn snapshots_since(
    pool: &SqlitePool,
    since: DateTime<Utc>,
) -> Result<Vec<ForecastSnapshot>, StoreError> {
    let rows: Vec<SnapshotRow> = sqlx::query_as(
        r#"
        SELECT stop_code, direction, destination, forecast_minutes, recorded_at
        FROM snapshots
        WHERE recorded_at >= ?
        ORDER BY stop_code, direction, destination, recorded_at, forecast_minutes
        "#,
    )
    .bind(to_millis(since))
    .fetch_all(pool)
    .await
    .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

    collect_rows(rows)
}

/// Snapshots for one stop with `from <= recorded_at < to`
pub async fn snapshots_for_stop(
    pool: &SqlitePool,
    stop_code: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<ForecastSnapshot>, StoreError> {
    let rows: Vec<SnapshotRow> = sqlx::query_as(
        r#"
        SELECT stop_code, direction, destination, forecast_minutes, recorded_at
        FROM snapshots
        WHERE stop_code = ? AND recorded_at >= ? AND recorded_at < ?
        ORDER BY recorded_at, id
        "#,
    )
    .bind(stop_code)
    .bind(to_millis(from))
    .bind(to_millis(to))
    .fetch_all(pool)
    .await
    .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

    collect_rows(rows)
}

/// The most recent capture for a stop, soonest trams first
#[derive(Debug, Clone)]
pub struct LatestBatch {
    pub recorded_at: DateTime<Utc>,
    pub snapshots: Vec<ForecastSnapshot>,
}

pub async fn latest_batch(
    pool: &SqlitePool,
    stop_code: &str,
    limit: u32,
) -> Result<Option<LatestBatch>, StoreError> {
    let (latest,): (Option<i64>,) =
        sqlx::query_as("SELECT MAX(recorded_at) FROM snapshots WHERE stop_code = ?")
            .bind(stop_code)
            .fetch_one(pool)
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

    let Some(recorded_at) = latest else {
        return Ok(None);
    };

    let rows: Vec<SnapshotRow> = sqlx::query_as(
        r#"
        SELECT stop_code, direction, destination, forecast_minutes, recorded_at
        FROM snapshots
        WHERE stop_code = ? AND recorded_at = ?
        ORDER BY forecast_minutes, id
        LIMIT ?
        "#,
    )
    .bind(stop_code)
    .bind(recorded_at)
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await
    .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

    Ok(Some(LatestBatch {
        recorded_at: from_millis(recorded_at),
        snapshots: collect_rows(rows)?,
    }))
}

// --- Accuracy store ---

/// Start a transaction that holds the write lock from its first statement.
///
/// Reads made before the first write would otherwise pin a WAL snapshot, and a
/// batch committed by another connection in between fails the later write
/// with `SQLITE_BUSY_SNAPSHOT` instead of waiting on the busy timeout.
pub async fn begin_write(pool: &SqlitePool) -> Result<Transaction<'static, Sqlite>, StoreError> {
    pool.begin_with("BEGIN IMMEDIATE")
        .await
        .map_err(|e| StoreError::DatabaseError(e.to_string()))
}

/// Whether a record for the same key and forecast was already observed within `window`
pub async fn accuracy_exists_near(
    tx: &mut Transaction<'_, Sqlite>,
    record: &AccuracyRecord,
    window: Duration,
) -> Result<bool, StoreError> {
    let (count,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)
        FROM accuracy_records
        WHERE stop_code = ? AND direction = ? AND destination = ? AND forecasted_minutes = ?
          AND observed_from >= ? AND observed_from <= ?
        "#,
    )
    .bind(&record.key.stop_code)
    .bind(record.key.direction.as_str())
    .bind(&record.key.destination)
    .bind(record.forecasted_minutes)
    .bind(to_millis(record.observed_from - window))
    .bind(to_millis(record.observed_from + window))
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

    Ok(count > 0)
}

pub async fn insert_accuracy(
    tx: &mut Transaction<'_, Sqlite>,
    record: &AccuracyRecord,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO accuracy_records (
            stop_code, direction, destination, forecasted_minutes, actual_minutes,
            accuracy_delta, observed_from, observed_to, calculated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.key.stop_code)
    .bind(record.key.direction.as_str())
    .bind(&record.key.destination)
    .bind(record.forecasted_minutes)
    .bind(record.actual_minutes)
    .bind(record.accuracy_delta)
    .bind(to_millis(record.observed_from))
    .bind(to_millis(record.observed_to))
    .bind(to_millis(record.calculated_at))
    .execute(&mut **tx)
    .await
    .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

    Ok(())
}

/// Accuracy records for one stop with `from <= calculated_at < to`
pub async fn accuracy_for_stop(
    pool: &SqlitePool,
    stop_code: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<AccuracyRecord>, StoreError> {
    let rows: Vec<AccuracyRow> = sqlx::query_as(
        r#"
        SELECT stop_code, direction, destination, forecasted_minutes, actual_minutes,
               accuracy_delta, observed_from, observed_to, calculated_at
        FROM accuracy_records
        WHERE stop_code = ? AND calculated_at >= ? AND calculated_at < ?
        ORDER BY calculated_at, id
        "#,
    )
    .bind(stop_code)
    .bind(to_millis(from))
    .bind(to_millis(to))
    .fetch_all(pool)
    .await
    .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

    collect_rows(rows)
}

/// Aggregated accuracy for one destination and direction
#[derive(Debug, Clone, Serialize, ToSchema, FromRow)]
pub struct AccuracySummary {
    pub destination: String,
    pub direction: String,
    pub measurements: i64,
    pub avg_accuracy_minutes: f64,
    pub best_case_minutes: i64,
    pub worst_case_minutes: i64,
}

pub async fn accuracy_summary(
    pool: &SqlitePool,
    stop_code: &str,
    since: DateTime<Utc>,
) -> Result<Vec<AccuracySummary>, StoreError> {
    sqlx::query_as(
        r#"
        SELECT
            destination,
            direction,
            COUNT(*) AS measurements,
            ROUND(AVG(accuracy_delta), 2) AS avg_accuracy_minutes,
            MIN(accuracy_delta) AS best_case_minutes,
            MAX(accuracy_delta) AS worst_case_minutes
        FROM accuracy_records
        WHERE stop_code = ? AND calculated_at >= ?
        GROUP BY destination, direction
        ORDER BY destination, direction
        "#,
    )
    .bind(stop_code)
    .bind(to_millis(since))
    .fetch_all(pool)
    .await
    .map_err(|e| StoreError::DatabaseError(e.to_string()))
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StoreStats {
    pub total_snapshots_stored: i64,
    pub total_accuracy_records: i64,
    pub latest_poll: Option<DateTime<Utc>>,
}

pub async fn stats(pool: &SqlitePool) -> Result<StoreStats, StoreError> {
    let (total_snapshots_stored, latest): (i64, Option<i64>) =
        sqlx::query_as("SELECT COUNT(*), MAX(recorded_at) FROM snapshots")
            .fetch_one(pool)
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

    let (total_accuracy_records,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM accuracy_records")
        .fetch_one(pool)
        .await
        .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

    Ok(StoreStats {
        total_snapshots_stored,
        total_accuracy_records,
        latest_poll: latest.map(from_millis),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Invalid stored row: {0}")]
    InvalidRow(String),
}

/// In-memory database with migrations applied, for tests
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    // One connection: every connection to sqlite::memory: is a separate database
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    migrate(&pool).await.unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 12, 29, 14, 0, 0).unwrap()
    }

    fn snapshot(stop: &str, destination: &str, minutes: u32, recorded_at: DateTime<Utc>) -> ForecastSnapshot {
        ForecastSnapshot {
            stop_code: stop.to_string(),
            direction: Direction::Inbound,
            destination: destination.to_string(),
            forecast_minutes: minutes,
            recorded_at,
        }
    }

    fn accuracy(forecasted: i64, observed_from: DateTime<Utc>) -> AccuracyRecord {
        AccuracyRecord {
            key: TrackKey {
                stop_code: "cab".to_string(),
                direction: Direction::Inbound,
                destination: "Broombridge".to_string(),
            },
            forecasted_minutes: forecasted,
            actual_minutes: forecasted,
            accuracy_delta: 0,
            observed_from,
            observed_to: observed_from + Duration::seconds(30),
            calculated_at: observed_from + Duration::minutes(1),
        }
    }

    #[tokio::test]
    async fn test_batch_insert_and_range_query() {
        let pool = test_pool().await;
        let batch = vec![
            snapshot("cab", "Broombridge", 8, t0()),
            snapshot("cab", "Broombridge", 22, t0()),
        ];
        let later = vec![snapshot("cab", "Broombridge", 7, t0() + Duration::seconds(30))];

        assert_eq!(insert_snapshot_batch(&pool, &batch).await.unwrap(), 2);
        insert_snapshot_batch(&pool, &later).await.unwrap();
        insert_snapshot_batch(&pool, &[snapshot("tal", "Tallaght", 3, t0())]).await.unwrap();

        let first_poll = snapshots_for_stop(&pool, "cab", t0(), t0() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(first_poll, batch);

        let all_cab = snapshots_for_stop(&pool, "cab", t0(), t0() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(all_cab.len(), 3);
        assert_eq!(all_cab[2].forecast_minutes, 7);
    }

    #[tokio::test]
    async fn test_snapshots_since_orders_by_track_then_time() {
        let pool = test_pool().await;
        insert_snapshot_batch(&pool, &[snapshot("cab", "Broombridge", 2, t0() + Duration::seconds(30))])
            .await
            .unwrap();
        insert_snapshot_batch(&pool, &[snapshot("cab", "Broombridge", 3, t0())])
            .await
            .unwrap();
        insert_snapshot_batch(&pool, &[snapshot("cab", "Broombridge", 9, t0() - Duration::hours(3))])
            .await
            .unwrap();

        let rows = snapshots_since(&pool, t0() - Duration::hours(2)).await.unwrap();
        let minutes: Vec<u32> = rows.iter().map(|s| s.forecast_minutes).collect();
        assert_eq!(minutes, vec![3, 2]);
    }

    #[tokio::test]
    async fn test_latest_batch_returns_most_recent_capture() {
        let pool = test_pool().await;
        assert!(latest_batch(&pool, "cab", 3).await.unwrap().is_none());

        insert_snapshot_batch(&pool, &[snapshot("cab", "Broombridge", 5, t0())])
            .await
            .unwrap();
        let later = t0() + Duration::seconds(30);
        insert_snapshot_batch(
            &pool,
            &[
                snapshot("cab", "Broombridge", 20, later),
                snapshot("cab", "Sandyford", 4, later),
                snapshot("cab", "Broombridge", 9, later),
            ],
        )
        .await
        .unwrap();

        let batch = latest_batch(&pool, "cab", 2).await.unwrap().unwrap();
        assert_eq!(batch.recorded_at, later);
        let minutes: Vec<u32> = batch.snapshots.iter().map(|s| s.forecast_minutes).collect();
        assert_eq!(minutes, vec![4, 9]);
    }

    #[tokio::test]
    async fn test_accuracy_dedup_lookup_window() {
        let pool = test_pool().await;
        let mut tx = pool.begin().await.unwrap();
        insert_accuracy(&mut tx, &accuracy(2, t0())).await.unwrap();

        let window = Duration::minutes(2);
        let near = accuracy(2, t0() + Duration::seconds(90));
        let far = accuracy(2, t0() + Duration::minutes(5));
        let other_minutes = accuracy(1, t0());

        assert!(accuracy_exists_near(&mut tx, &near, window).await.unwrap());
        assert!(!accuracy_exists_near(&mut tx, &far, window).await.unwrap());
        assert!(!accuracy_exists_near(&mut tx, &other_minutes, window).await.unwrap());
        tx.commit().await.unwrap();

        let stored = accuracy_for_stop(&pool, "cab", t0(), t0() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(stored, vec![accuracy(2, t0())]);
    }

    #[tokio::test]
    async fn test_rolled_back_accuracy_is_not_visible() {
        let pool = test_pool().await;
        let mut tx = pool.begin().await.unwrap();
        insert_accuracy(&mut tx, &accuracy(1, t0())).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(stats(&pool).await.unwrap().total_accuracy_records, 0);
    }

    #[tokio::test]
    async fn test_write_transaction_waits_out_concurrent_snapshot_batch() {
        let path = std::env::temp_dir().join(format!("luas_tracker_write_lock_{}.db", std::process::id()));
        let remove_files = |path: &std::path::Path| {
            for suffix in ["", "-wal", "-shm"] {
                let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
            }
        };
        remove_files(&path);
        let pool = connect(&format!("sqlite://{}", path.display())).await.unwrap();

        // Read first, as the reconciler's dedup check does
        let mut tx = begin_write(&pool).await.unwrap();
        assert!(!accuracy_exists_near(&mut tx, &accuracy(2, t0()), Duration::minutes(2))
            .await
            .unwrap());

        let writer = tokio::spawn({
            let pool = pool.clone();
            async move {
                insert_snapshot_batch(&pool, &[snapshot("cab", "Broombridge", 1, t0())]).await
            }
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        insert_accuracy(&mut tx, &accuracy(2, t0())).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(writer.await.unwrap().unwrap(), 1);

        let totals = stats(&pool).await.unwrap();
        assert_eq!(totals.total_accuracy_records, 1);
        assert_eq!(totals.total_snapshots_stored, 1);

        pool.close().await;
        remove_files(&path);
    }

    #[tokio::test]
    async fn test_accuracy_summary_aggregates_by_destination() {
        let pool = test_pool().await;
        let mut tx = pool.begin().await.unwrap();
        for (delta, minute) in [(-1, 0), (1, 10), (0, 20)] {
            let mut record = accuracy(2, t0() + Duration::minutes(minute));
            record.accuracy_delta = delta;
            insert_accuracy(&mut tx, &record).await.unwrap();
        }
        tx.commit().await.unwrap();

        let summary = accuracy_summary(&pool, "cab", t0()).await.unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].destination, "Broombridge");
        assert_eq!(summary[0].direction, "Inbound");
        assert_eq!(summary[0].measurements, 3);
        assert_eq!(summary[0].avg_accuracy_minutes, 0.0);
        assert_eq!(summary[0].best_case_minutes, -1);
        assert_eq!(summary[0].worst_case_minutes, 1);
    }

    #[tokio::test]
    async fn test_stats_counts_rows() {
        let pool = test_pool().await;
        let empty = stats(&pool).await.unwrap();
        assert_eq!(empty.total_snapshots_stored, 0);
        assert!(empty.latest_poll.is_none());

        insert_snapshot_batch(&pool, &[snapshot("cab", "Broombridge", 5, t0())])
            .await
            .unwrap();
        let filled = stats(&pool).await.unwrap();
        assert_eq!(filled.total_snapshots_stored, 1);
        assert_eq!(filled.latest_poll, Some(t0()));
    }
}
