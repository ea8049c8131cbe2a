use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::reconcile::{ReconcilePolicy, TransitionRules};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Stop codes to sample, in polling order
    pub stop_codes: Vec<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_reconciliation_interval")]
    pub reconciliation_interval_seconds: u64,
    #[serde(default = "default_two")]
    pub max_poll_gap_minutes: i64,
    #[serde(default = "default_two")]
    pub accuracy_sanity_bound_minutes: i64,
    #[serde(default = "default_two")]
    pub dedup_window_minutes: i64,
    #[serde(default = "default_two")]
    pub snapshot_window_hours: i64,
    /// Allowed `[from, to]` forecast transitions treated as an arrival
    #[serde(default = "default_transition_rules")]
    pub transition_rules: Vec<(u32, u32)>,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_seconds: u64,
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    #[serde(default = "default_feed_base_url")]
    pub feed_base_url: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Allowed CORS origins. Required unless cors_permissive is true.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Explicitly allow all origins (development only). Defaults to false.
    #[serde(default)]
    pub cors_permissive: bool,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_reconciliation_interval() -> u64 {
    120
}

fn default_two() -> i64 {
    2
}

fn default_transition_rules() -> Vec<(u32, u32)> {
    vec![(1, 0), (2, 1), (3, 2)]
}

fn default_fetch_timeout() -> u64 {
    10
}

fn default_max_concurrent_fetches() -> usize {
    4
}

fn default_feed_base_url() -> String {
    "http://luasforecasts.rpa.ie/xml/get.ashx".to_string()
}

fn default_database_url() -> String {
    "sqlite://luas_tracker.db".to_string()
}

fn default_listen_addr() -> String {
    "127.0.0.1:3000".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.stop_codes.is_empty() {
            return Err(ConfigError::Invalid("stop_codes must not be empty".to_string()));
        }
        if self.stop_codes.iter().any(|code| code.trim().is_empty()) {
            return Err(ConfigError::Invalid("stop_codes must not contain blank codes".to_string()));
        }
        if self.poll_interval_seconds == 0 || self.reconciliation_interval_seconds == 0 {
            return Err(ConfigError::Invalid("intervals must be positive".to_string()));
        }
        if self.transition_rules.is_empty() {
            return Err(ConfigError::Invalid("transition_rules must not be empty".to_string()));
        }
        if self.fetch_timeout_seconds == 0 {
            return Err(ConfigError::Invalid("fetch_timeout_seconds must be positive".to_string()));
        }
        if self.fetch_timeout_seconds >= self.poll_interval_seconds {
            return Err(ConfigError::Invalid(
                "fetch_timeout_seconds must be shorter than poll_interval_seconds".to_string(),
            ));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(ConfigError::Invalid("max_concurrent_fetches must be positive".to_string()));
        }
        for (name, value) in [
            ("max_poll_gap_minutes", self.max_poll_gap_minutes),
            ("accuracy_sanity_bound_minutes", self.accuracy_sanity_bound_minutes),
            ("dedup_window_minutes", self.dedup_window_minutes),
            ("snapshot_window_hours", self.snapshot_window_hours),
        ] {
            if value < 0 {
                return Err(ConfigError::Invalid(format!("{name} must not be negative")));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_secs(self.reconciliation_interval_seconds)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }

    /// Build the reconciliation policy from the configured bounds
    pub fn reconcile_policy(&self) -> ReconcilePolicy {
        ReconcilePolicy {
            snapshot_window: chrono::Duration::hours(self.snapshot_window_hours),
            max_poll_gap: chrono::Duration::minutes(self.max_poll_gap_minutes),
            sanity_bound_minutes: self.accuracy_sanity_bound_minutes,
            dedup_window: chrono::Duration::minutes(self.dedup_window_minutes),
            rules: TransitionRules::new(self.transition_rules.iter().copied()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}
