use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Travel direction as reported by the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "Inbound",
            Direction::Outbound => "Outbound",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "Inbound" => Some(Direction::Inbound),
            "Outbound" => Some(Direction::Outbound),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single normalized forecast as handed over by a feed adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForecastRecord {
    pub stop_code: String,
    pub direction: Direction,
    pub destination: String,
    pub forecast_minutes: u32,
    pub observed_at: DateTime<Utc>,
}

/// A persisted forecast, stamped with the sampler's capture time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForecastSnapshot {
    pub stop_code: String,
    pub direction: Direction,
    pub destination: String,
    pub forecast_minutes: u32,
    pub recorded_at: DateTime<Utc>,
}

impl ForecastSnapshot {
    pub fn from_record(record: &ForecastRecord, recorded_at: DateTime<Utc>) -> Self {
        Self {
            stop_code: record.stop_code.clone(),
            direction: record.direction,
            destination: record.destination.clone(),
            forecast_minutes: record.forecast_minutes,
            recorded_at,
        }
    }

    pub fn forecast_arrival_time(&self) -> DateTime<Utc> {
        self.recorded_at + Duration::minutes(i64::from(self.forecast_minutes))
    }

    pub fn track_key(&self) -> TrackKey {
        TrackKey {
            stop_code: self.stop_code.clone(),
            direction: self.direction,
            destination: self.destination.clone(),
        }
    }
}

/// Identity of a track: one stop, one direction, one destination
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackKey {
    pub stop_code: String,
    pub direction: Direction,
    pub destination: String,
}

/// A forecast accuracy measurement derived from one pair of snapshots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccuracyRecord {
    pub key: TrackKey,
    pub forecasted_minutes: i64,
    pub actual_minutes: i64,
    pub accuracy_delta: i64,
    /// Capture time of the earlier snapshot of the pair
    pub observed_from: DateTime<Utc>,
    /// Capture time of the later snapshot of the pair
    pub observed_to: DateTime<Utc>,
    pub calculated_at: DateTime<Utc>,
}

pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}
