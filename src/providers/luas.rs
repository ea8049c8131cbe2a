//! Luas real-time forecast API client
//!
//! The forecast endpoint returns one XML document per stop:
//!
//! ```xml
//! <stopInfo created="2025-12-29T14:34:37" stop="Cabra" stopAbv="CAB">
//!     <message>Services running</message>
//!     <direction name="Inbound">
//!         <tram dueMins="DUE" destination="Broombridge" />
//!         <tram dueMins="12" destination="Broombridge" />
//!     </direction>
//!     <direction name="Outbound">
//!         <tram destination="No trams forecast" dueMins="" />
//!     </direction>
//! </stopInfo>
//! ```
//!
//! `dueMins` is either a number of minutes or `DUE`. A direction with nothing
//! scheduled carries a placeholder tram that is dropped here.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{FeedError, ForecastSource};
use crate::models::{Direction, ForecastRecord};

const NO_TRAMS_PLACEHOLDER: &str = "No trams forecast";

#[derive(Debug, Deserialize)]
struct StopInfo {
    #[serde(rename = "direction", default)]
    directions: Vec<DirectionElement>,
}

#[derive(Debug, Deserialize)]
struct DirectionElement {
    #[serde(rename = "@name", default)]
    name: String,
    #[serde(rename = "tram", default)]
    trams: Vec<TramElement>,
}

#[derive(Debug, Deserialize)]
struct TramElement {
    #[serde(rename = "@dueMins", default)]
    due_mins: String,
    #[serde(rename = "@destination", default)]
    destination: String,
}

#[derive(Debug, Clone)]
pub struct LuasClient {
    client: reqwest::Client,
    base_url: String,
}

impl LuasClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| FeedError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn forecast_url(&self, stop_code: &str) -> String {
        format!(
            "{}?action=forecast&stop={}&encrypt=false",
            self.base_url,
            urlencoding::encode(stop_code)
        )
    }

    async fn fetch_body(&self, stop_code: &str) -> Result<String, FeedError> {
        let url = self.forecast_url(stop_code);
        debug!(url = %url, stop = %stop_code, "Fetching forecasts");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(FeedError::Transport(format!(
                "HTTP {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        Ok(text)
    }
}

impl ForecastSource for LuasClient {
    async fn fetch_forecasts(&self, stop_code: &str) -> Result<Vec<ForecastRecord>, FeedError> {
        let body = self.fetch_body(stop_code).await?;
        parse_forecasts(stop_code, &body, Utc::now())
    }
}

/// Parse a forecast document into valid records, in document order
pub fn parse_forecasts(
    stop_code: &str,
    xml: &str,
    observed_at: DateTime<Utc>,
) -> Result<Vec<ForecastRecord>, FeedError> {
    let stop_info: StopInfo = quick_xml::de::from_str(xml).map_err(|e| {
        warn!(
            stop = %stop_code,
            error = %e,
            body_preview = %xml.chars().take(200).collect::<String>(),
            "Failed to parse forecast XML"
        );
        FeedError::Format(e.to_string())
    })?;

    let mut records = Vec::new();

    for direction_element in &stop_info.directions {
        let Some(direction) = Direction::parse(&direction_element.name) else {
            warn!(stop = %stop_code, direction = %direction_element.name, "Skipping unknown direction");
            continue;
        };

        for tram in &direction_element.trams {
            let destination = tram.destination.trim();
            if destination.is_empty() || destination == NO_TRAMS_PLACEHOLDER {
                continue;
            }

            let Some(forecast_minutes) = parse_due_minutes(&tram.due_mins) else {
                debug!(
                    stop = %stop_code,
                    due_mins = %tram.due_mins,
                    destination = %destination,
                    "Skipping tram with non-numeric due minutes"
                );
                continue;
            };

            records.push(ForecastRecord {
                stop_code: stop_code.to_string(),
                direction,
                destination: destination.to_string(),
                forecast_minutes,
                observed_at,
            });
        }
    }

    if records.is_empty() {
        debug!(stop = %stop_code, "No trams found in forecast");
    }

    Ok(records)
}

/// "DUE" means arriving now; anything else must be a whole number of minutes
fn parse_due_minutes(value: &str) -> Option<u32> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("DUE") {
        return Some(0);
    }
    value.parse().ok()
}
