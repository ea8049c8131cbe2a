//! Snapshot reconciliation
//!
//! Turns sequences of forecast snapshots into accuracy measurements. The feed
//! carries no vehicle identity, so every snapshot sharing a stop, direction and
//! destination is treated as one queue of interchangeable trams (a track), and
//! only a small set of single-step countdown transitions between consecutive
//! polls is accepted as evidence that one tram was observed twice:
//!
//! - A track is read in capture order; all rows captured at the same instant
//!   form one poll, represented by its lead tram (the smallest forecast).
//! - Consecutive polls further apart than the maximum poll gap are ignored.
//! - The lead forecast must step along one of the allowed `(from, to)` pairs.
//! - The arrival is estimated at the midpoint of the two captures and the
//!   measurement is dropped if it misses the forecast by more than the sanity
//!   bound.
//!
//! Accepted records are deduplicated against what is already stored and
//! written in one transaction per cycle. The reconciler keeps no state between
//! cycles, so re-running it over the same window is a no-op.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::models::{AccuracyRecord, ForecastSnapshot, TrackKey};
use crate::store::{self, StoreError};

/// Table of accepted `(from, to)` forecast transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRules {
    pairs: Vec<(u32, u32)>,
}

impl TransitionRules {
    pub fn new(pairs: impl IntoIterator<Item = (u32, u32)>) -> Self {
        let mut pairs: Vec<(u32, u32)> = pairs.into_iter().collect();
        pairs.sort_unstable();
        pairs.dedup();
        Self { pairs }
    }

    pub fn matches(&self, from: u32, to: u32) -> bool {
        self.pairs.binary_search(&(from, to)).is_ok()
    }
}

impl Default for TransitionRules {
    fn default() -> Self {
        Self::new([(1, 0), (2, 1), (3, 2)])
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    /// How far back each cycle reads snapshots
    pub snapshot_window: Duration,
    pub max_poll_gap: Duration,
    pub sanity_bound_minutes: i64,
    pub dedup_window: Duration,
    pub rules: TransitionRules,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            snapshot_window: Duration::hours(2),
            max_poll_gap: Duration::minutes(2),
            sanity_bound_minutes: 2,
            dedup_window: Duration::minutes(2),
            rules: TransitionRules::default(),
        }
    }
}

/// What happened to one pair of consecutive polls
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairOutcome {
    Accepted(AccuracyRecord),
    GapTooLarge,
    Unmatched,
    SanityRejected { accuracy_delta: i64 },
}

/// Counters for one pass over the snapshot window
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub tracks: usize,
    pub pairs: usize,
    pub accepted: usize,
    pub gap_too_large: usize,
    pub unmatched: usize,
    pub sanity_rejected: usize,
}

/// Counters for one reconciliation cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub scan: ScanSummary,
    pub duplicates: usize,
    pub inserted: usize,
}

/// Group snapshots into tracks, each in non-decreasing capture order
pub fn build_tracks(snapshots: &[ForecastSnapshot]) -> BTreeMap<TrackKey, Vec<&ForecastSnapshot>> {
    let mut tracks: BTreeMap<TrackKey, Vec<&ForecastSnapshot>> = BTreeMap::new();
    for snapshot in snapshots {
        tracks.entry(snapshot.track_key()).or_default().push(snapshot);
    }
    for track in tracks.values_mut() {
        track.sort_by_key(|s| (s.recorded_at, s.forecast_minutes));
    }
    tracks
}

/// Collapse a sorted track to one lead observation per capture instant
fn lead_observations<'a>(track: &[&'a ForecastSnapshot]) -> Vec<&'a ForecastSnapshot> {
    let mut leads: Vec<&ForecastSnapshot> = Vec::with_capacity(track.len());
    for snapshot in track {
        match leads.last() {
            // Sorted by minutes within a capture, so the first row is the lead
            Some(last) if last.recorded_at == snapshot.recorded_at => {}
            _ => leads.push(snapshot),
        }
    }
    leads
}

/// Apply the gap filter, transition match and sanity bound to one pair
pub fn evaluate_pair(
    prev: &ForecastSnapshot,
    curr: &ForecastSnapshot,
    policy: &ReconcilePolicy,
    now: DateTime<Utc>,
) -> PairOutcome {
    let gap = curr.recorded_at - prev.recorded_at;
    if gap > policy.max_poll_gap {
        return PairOutcome::GapTooLarge;
    }

    if !policy.rules.matches(prev.forecast_minutes, curr.forecast_minutes) {
        return PairOutcome::Unmatched;
    }

    let forecasted_minutes = i64::from(prev.forecast_minutes);
    let actual_minutes = estimate_actual_minutes(prev, curr);
    let accuracy_delta = actual_minutes - forecasted_minutes;

    if accuracy_delta.abs() > policy.sanity_bound_minutes {
        return PairOutcome::SanityRejected { accuracy_delta };
    }

    PairOutcome::Accepted(AccuracyRecord {
        key: prev.track_key(),
        forecasted_minutes,
        actual_minutes,
        accuracy_delta,
        observed_from: prev.recorded_at,
        observed_to: curr.recorded_at,
        calculated_at: now,
    })
}

/// Minutes from the earlier capture until the estimated arrival.
///
/// The countdown stepped somewhere between the two captures, so that instant
/// is taken as the midpoint. From there the tram is still `curr` minutes out,
/// which is zero for the `1 -> 0` step.
fn estimate_actual_minutes(prev: &ForecastSnapshot, curr: &ForecastSnapshot) -> i64 {
    let gap_ms = (curr.recorded_at - prev.recorded_at).num_milliseconds();
    let to_midpoint_ms = gap_ms as f64 / 2.0;
    let remaining_ms = f64::from(curr.forecast_minutes) * 60_000.0;
    ((to_midpoint_ms + remaining_ms) / 60_000.0).round() as i64
}

/// Scan every track in the window and collect accepted measurements
pub fn scan_snapshots(
    snapshots: &[ForecastSnapshot],
    policy: &ReconcilePolicy,
    now: DateTime<Utc>,
) -> (Vec<AccuracyRecord>, ScanSummary) {
    let tracks = build_tracks(snapshots);
    let mut summary = ScanSummary {
        tracks: tracks.len(),
        ..ScanSummary::default()
    };
    let mut records = Vec::new();

    for (key, track) in &tracks {
        let leads = lead_observations(track);

        for pair in leads.windows(2) {
            summary.pairs += 1;
            match evaluate_pair(pair[0], pair[1], policy, now) {
                PairOutcome::Accepted(record) => {
                    summary.accepted += 1;
                    records.push(record);
                }
                PairOutcome::GapTooLarge => summary.gap_too_large += 1,
                PairOutcome::Unmatched => summary.unmatched += 1,
                PairOutcome::SanityRejected { accuracy_delta } => {
                    summary.sanity_rejected += 1;
                    debug!(
                        stop = %key.stop_code,
                        direction = %key.direction,
                        destination = %key.destination,
                        from = pair[0].forecast_minutes,
                        to = pair[1].forecast_minutes,
                        accuracy_delta,
                        "Discarding implausible measurement"
                    );
                }
            }
        }
    }

    (records, summary)
}

/// Periodic reconciliation over the trailing snapshot window
pub struct Reconciler {
    pool: SqlitePool,
    policy: ReconcilePolicy,
}

impl Reconciler {
    pub fn new(pool: SqlitePool, policy: ReconcilePolicy) -> Self {
        Self { pool, policy }
    }

    /// Run one cycle as of `now`; all of its records commit together or not at all
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleSummary, ReconcileError> {
        let since = now - self.policy.snapshot_window;
        let snapshots = store::snapshots_since(&self.pool, since).await?;
        let (records, scan) = scan_snapshots(&snapshots, &self.policy, now);

        let mut summary = CycleSummary {
            scan,
            ..CycleSummary::default()
        };

        if records.is_empty() {
            debug!(snapshots = snapshots.len(), tracks = summary.scan.tracks, "No transitions to record");
            return Ok(summary);
        }

        let mut tx = store::begin_write(&self.pool).await?;

        // Checked inside the transaction so records from this cycle count too
        for record in &records {
            if store::accuracy_exists_near(&mut tx, record, self.policy.dedup_window).await? {
                summary.duplicates += 1;
                debug!(
                    stop = %record.key.stop_code,
                    destination = %record.key.destination,
                    forecasted_minutes = record.forecasted_minutes,
                    observed_from = %record.observed_from,
                    "Skipping already recorded transition"
                );
                continue;
            }
            store::insert_accuracy(&mut tx, record).await?;
            summary.inserted += 1;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        info!(
            snapshots = snapshots.len(),
            tracks = summary.scan.tracks,
            pairs = summary.scan.pairs,
            accepted = summary.scan.accepted,
            sanity_rejected = summary.scan.sanity_rejected,
            duplicates = summary.duplicates,
            inserted = summary.inserted,
            "Completed reconciliation cycle"
        );

        Ok(summary)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 12, 29, 14, 0, 0).unwrap()
    }

    fn snap(minutes: u32, offset_secs: i64) -> ForecastSnapshot {
        snap_for("Broombridge", minutes, offset_secs)
    }

    fn snap_for(destination: &str, minutes: u32, offset_secs: i64) -> ForecastSnapshot {
        ForecastSnapshot {
            stop_code: "cab".to_string(),
            direction: Direction::Inbound,
            destination: destination.to_string(),
            forecast_minutes: minutes,
            recorded_at: t0() + Duration::seconds(offset_secs),
        }
    }

    fn now() -> DateTime<Utc> {
        t0() + Duration::minutes(5)
    }

    fn scan(snapshots: &[ForecastSnapshot]) -> (Vec<AccuracyRecord>, ScanSummary) {
        scan_snapshots(snapshots, &ReconcilePolicy::default(), now())
    }

    // --- transition rules ---

    #[test]
    fn test_default_rules_are_single_step_decrements() {
        let rules = TransitionRules::default();
        assert!(rules.matches(1, 0));
        assert!(rules.matches(2, 1));
        assert!(rules.matches(3, 2));
        assert!(!rules.matches(12, 0));
        assert!(!rules.matches(5, 3));
        assert!(!rules.matches(4, 3));
        assert!(!rules.matches(0, 0));
    }

    #[test]
    fn test_custom_rules_table() {
        let rules = TransitionRules::new([(5, 0), (5, 0), (1, 0)]);
        assert!(rules.matches(5, 0));
        assert!(rules.matches(1, 0));
        assert!(!rules.matches(2, 1));
    }

    // --- pair evaluation ---

    #[test]
    fn test_single_step_transitions_within_gap_are_accepted() {
        for n in 1..=3u32 {
            for gap_secs in [15, 30, 60, 90, 120] {
                let outcome = evaluate_pair(
                    &snap(n, 0),
                    &snap(n - 1, gap_secs),
                    &ReconcilePolicy::default(),
                    now(),
                );
                let PairOutcome::Accepted(record) = outcome else {
                    panic!("{n}->{} at {gap_secs}s was not accepted: {outcome:?}", n - 1);
                };
                assert_eq!(record.forecasted_minutes, i64::from(n));
                assert!((-2..=2).contains(&record.accuracy_delta));
                assert_eq!(record.accuracy_delta, record.actual_minutes - record.forecasted_minutes);
            }
        }
    }

    #[test]
    fn test_two_to_one_scenario() {
        let outcome = evaluate_pair(&snap(2, 0), &snap(1, 30), &ReconcilePolicy::default(), now());

        let PairOutcome::Accepted(record) = outcome else {
            panic!("expected a measurement, got {outcome:?}");
        };
        assert_eq!(record.key.stop_code, "cab");
        assert_eq!(record.key.direction, Direction::Inbound);
        assert_eq!(record.key.destination, "Broombridge");
        assert_eq!(record.forecasted_minutes, 2);
        assert!(record.actual_minutes == 0 || record.actual_minutes == 1);
        assert!((-2..=2).contains(&record.accuracy_delta));
        assert_eq!(record.observed_from, t0());
        assert_eq!(record.observed_to, t0() + Duration::seconds(30));
        assert_eq!(record.calculated_at, now());
    }

    #[test]
    fn test_due_transition_uses_midpoint() {
        let outcome = evaluate_pair(&snap(1, 0), &snap(0, 120), &ReconcilePolicy::default(), now());

        let PairOutcome::Accepted(record) = outcome else {
            panic!("expected a measurement, got {outcome:?}");
        };
        assert_eq!(record.actual_minutes, 1);
        assert_eq!(record.accuracy_delta, 0);
    }

    #[test]
    fn test_arrival_estimate_adds_remaining_forecast() {
        let policy = ReconcilePolicy::default();
        let cases = [
            // (from, to, gap secs, actual minutes)
            (3, 2, 30, 2),
            (3, 2, 120, 3),
            (2, 1, 30, 1),
            (2, 1, 120, 2),
            (1, 0, 30, 0),
            (1, 0, 90, 1),
        ];

        for (from, to, gap_secs, actual) in cases {
            let outcome = evaluate_pair(&snap(from, 0), &snap(to, gap_secs), &policy, now());
            let PairOutcome::Accepted(record) = outcome else {
                panic!("{from}->{to} at {gap_secs}s was not accepted: {outcome:?}");
            };
            assert_eq!(record.actual_minutes, actual, "{from}->{to} at {gap_secs}s");
            assert_eq!(record.accuracy_delta, actual - i64::from(from));
        }
    }

    #[test]
    fn test_gap_over_limit_is_rejected() {
        let outcome = evaluate_pair(&snap(1, 0), &snap(0, 121), &ReconcilePolicy::default(), now());
        assert_eq!(outcome, PairOutcome::GapTooLarge);
    }

    #[test]
    fn test_large_jumps_are_unmatched() {
        let policy = ReconcilePolicy::default();
        assert_eq!(evaluate_pair(&snap(12, 0), &snap(0, 30), &policy, now()), PairOutcome::Unmatched);
        assert_eq!(evaluate_pair(&snap(5, 0), &snap(3, 30), &policy, now()), PairOutcome::Unmatched);
        assert_eq!(evaluate_pair(&snap(2, 0), &snap(2, 30), &policy, now()), PairOutcome::Unmatched);
    }

    #[test]
    fn test_sanity_bound_rejects_implausible_delta() {
        let policy = ReconcilePolicy {
            rules: TransitionRules::new([(10, 0)]),
            ..ReconcilePolicy::default()
        };

        let outcome = evaluate_pair(&snap(10, 0), &snap(0, 60), &policy, now());
        assert_eq!(outcome, PairOutcome::SanityRejected { accuracy_delta: -9 });
    }

    // --- track scanning ---

    #[test]
    fn test_tracks_are_partitioned_by_destination() {
        let snapshots = vec![
            snap_for("Broombridge", 2, 0),
            snap_for("Sandyford", 9, 0),
            snap_for("Broombridge", 1, 30),
            snap_for("Sandyford", 8, 30),
        ];

        let tracks = build_tracks(&snapshots);
        assert_eq!(tracks.len(), 2);

        let (records, summary) = scan(&snapshots);
        assert_eq!(summary.tracks, 2);
        assert_eq!(summary.pairs, 2);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key.destination, "Broombridge");
    }

    #[test]
    fn test_unordered_input_is_scanned_in_capture_order() {
        let snapshots = vec![snap(1, 60), snap(3, 0), snap(2, 30)];

        let (records, summary) = scan(&snapshots);
        assert_eq!(summary.pairs, 2);
        let forecasts: Vec<i64> = records.iter().map(|r| r.forecasted_minutes).collect();
        assert_eq!(forecasts, vec![3, 2]);
    }

    #[test]
    fn test_trams_in_the_same_poll_are_not_paired() {
        // Two trams 3 and 2 minutes out in one poll, then the next poll
        let snapshots = vec![snap(3, 0), snap(2, 0), snap(14, 0), snap(1, 30), snap(2, 30)];

        let (records, summary) = scan(&snapshots);
        assert_eq!(summary.pairs, 1);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].forecasted_minutes, 2);
    }

    #[test]
    fn test_jump_scenario_produces_nothing() {
        let (records, summary) = scan(&[snap(12, 0), snap(0, 30)]);
        assert!(records.is_empty());
        assert_eq!(summary.unmatched, 1);
    }

    #[test]
    fn test_missed_polls_produce_nothing() {
        let (records, summary) = scan(&[snap(1, 0), snap(0, 180)]);
        assert!(records.is_empty());
        assert_eq!(summary.gap_too_large, 1);
    }

    // --- store-backed cycles ---

    async fn seed(pool: &SqlitePool, snapshots: &[ForecastSnapshot]) {
        for snapshot in snapshots {
            store::insert_snapshot_batch(pool, std::slice::from_ref(snapshot))
                .await
                .unwrap();
        }
    }

    async fn stored_records(pool: &SqlitePool) -> Vec<AccuracyRecord> {
        store::accuracy_for_stop(pool, "cab", t0() - Duration::days(1), t0() + Duration::days(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_cycle_writes_one_record_per_transition() {
        let pool = store::test_pool().await;
        seed(&pool, &[snap(2, 0), snap(1, 30), snap(12, 60), snap(0, 90)]).await;

        let reconciler = Reconciler::new(pool.clone(), ReconcilePolicy::default());
        let summary = reconciler.run_cycle(now()).await.unwrap();

        assert_eq!(summary.inserted, 1);
        let records = stored_records(&pool).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].forecasted_minutes, 2);
        assert_eq!(records[0].calculated_at, now());
    }

    #[tokio::test]
    async fn test_rerun_over_same_window_is_idempotent() {
        let pool = store::test_pool().await;
        seed(&pool, &[snap(3, 0), snap(2, 30), snap(1, 60), snap(0, 90)]).await;

        let reconciler = Reconciler::new(pool.clone(), ReconcilePolicy::default());
        let first = reconciler.run_cycle(now()).await.unwrap();
        let second = reconciler
            .run_cycle(now() + Duration::minutes(4))
            .await
            .unwrap();

        assert_eq!(first.inserted, 3);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 3);
        assert_eq!(stored_records(&pool).await.len(), 3);
    }

    #[tokio::test]
    async fn test_flicker_within_dedup_window_is_recorded_once() {
        let pool = store::test_pool().await;
        seed(&pool, &[snap(2, 0), snap(1, 30), snap(2, 60), snap(1, 90)]).await;

        let reconciler = Reconciler::new(pool.clone(), ReconcilePolicy::default());
        let summary = reconciler.run_cycle(now()).await.unwrap();

        assert_eq!(summary.scan.accepted, 2);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(stored_records(&pool).await.len(), 1);
    }

    #[tokio::test]
    async fn test_snapshots_outside_window_are_ignored() {
        let pool = store::test_pool().await;
        seed(&pool, &[snap(2, 0), snap(1, 30)]).await;

        let reconciler = Reconciler::new(pool.clone(), ReconcilePolicy::default());
        let summary = reconciler
            .run_cycle(t0() + Duration::hours(3))
            .await
            .unwrap();

        assert_eq!(summary.scan.tracks, 0);
        assert!(stored_records(&pool).await.is_empty());
    }

    #[tokio::test]
    async fn test_failure_midway_rolls_back_whole_cycle() {
        let pool = store::test_pool().await;
        seed(&pool, &[snap(3, 0), snap(2, 30), snap(1, 60)]).await;
        // Let the first insert through, reject the second
        sqlx::query(
            r#"
            CREATE TRIGGER reject_second_record BEFORE INSERT ON accuracy_records
            WHEN (SELECT COUNT(*) FROM accuracy_records) >= 1
            BEGIN
                SELECT RAISE(ABORT, 'rejected');
            END
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        let reconciler = Reconciler::new(pool.clone(), ReconcilePolicy::default());
        let result = reconciler.run_cycle(now()).await;

        assert!(matches!(result, Err(ReconcileError::StoreError(_))));
        assert!(stored_records(&pool).await.is_empty());

        // The next firing retries the same window from scratch
        sqlx::query("DROP TRIGGER reject_second_record")
            .execute(&pool)
            .await
            .unwrap();
        let summary = reconciler.run_cycle(now()).await.unwrap();
        assert_eq!(summary.inserted, 2);
        assert_eq!(stored_records(&pool).await.len(), 2);
    }
}
