//! Measurement delivery to the backend, with config updates piggy-backed on
//! the responses.

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::DeviceConfig;
use crate::error::ReportError;
use crate::types::Measurement;

const MEASUREMENTS_PATH: &str = "/api/v1/measurements";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
pub struct DeliveryOutcome {
    pub measurement_id: Option<i64>,
    pub config_received: bool,
}

#[derive(Debug, Deserialize)]
struct MeasurementResponse {
    #[serde(default)]
    measurement_id: Option<i64>,
    #[serde(default)]
    config: Option<Value>,
}

pub struct Reporter {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl Reporter {
    pub fn new(config: &DeviceConfig) -> Result<Self, ReportError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Reporter {
            client,
            base_url: config.backend_url.clone(),
            auth_token: config.auth_token.clone(),
        })
    }

    /// Delivers a live reading. Success is exactly HTTP 200 or 201; any
    /// other status or a transport failure is an error and the caller is
    /// expected to buffer the reading. A `config` object in the response is
    /// applied fire-and-forget, never affecting the delivery outcome.
    pub async fn send_live(
        &self,
        measurement: &Measurement,
        config: &mut DeviceConfig,
    ) -> Result<DeliveryOutcome, ReportError> {
        let url = format!("{}{}", self.base_url, MEASUREMENTS_PATH);
        let mut request = self.client.post(&url).json(measurement);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            return Err(ReportError::Rejected(status));
        }

        let mut outcome = DeliveryOutcome::default();
        match response.json::<MeasurementResponse>().await {
            Ok(body) => {
                outcome.measurement_id = body.measurement_id;
                if let Some(update) = body.config {
                    outcome.config_received = true;
                    if config.apply_update(&update) {
                        info!("applied config update from measurement response");
                    } else {
                        warn!("ignoring malformed config update from backend");
                    }
                }
            }
            Err(e) => warn!(error = %e, "could not parse measurement response body"),
        }
        Ok(outcome)
    }

    /// Re-delivers a payload stored by the queue, verbatim, flagged with
    /// `X-Buffered`. Transport failure is an error; a refusal status is just
    /// `false`. Config updates are never taken from buffered responses.
    pub async fn send_queued(&self, payload: &str) -> Result<bool, ReportError> {
        let url = format!("{}{}", self.base_url, MEASUREMENTS_PATH);
        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("X-Buffered", "true")
            .body(payload.to_string());
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let status = request.send().await?.status();
        Ok(status == StatusCode::OK || status == StatusCode::CREATED)
    }

    /// Pulls the device's configuration from the backend and applies it.
    /// Returns whether anything was applied.
    pub async fn fetch_config(&self, config: &mut DeviceConfig) -> Result<bool, ReportError> {
        let url = format!("{}/api/v1/devices/{}/config", self.base_url, config.device_id);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if response.status() != StatusCode::OK {
            return Ok(false);
        }

        match response.json::<Value>().await {
            Ok(body) => Ok(config.apply_update(&body)),
            Err(e) => {
                warn!(error = %e, "could not parse config response");
                Ok(false)
            }
        }
    }
}
