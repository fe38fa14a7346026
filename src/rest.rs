//! REST surface of the call backend
//!
//! Small side-channel next to the websocket: recording control and the
//! call configuration document (ICE servers and feature switches) live
//! behind plain authenticated HTTP endpoints.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CallConfig;
use crate::error::{CallError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on accepted response bodies
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Call configuration served by the backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendCallConfig {
    #[serde(default)]
    pub ice_servers: Vec<String>,
    #[serde(default)]
    pub recording_available: bool,
}

pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    channel: String,
    token: String,
}

impl RestClient {
    pub fn new(config: &CallConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CallError::Rest(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.rest_url(),
            channel: config.channel_id.clone(),
            token: config.token.clone(),
        })
    }

    /// Fetch the backend-side call configuration
    pub async fn fetch_call_config(&self) -> Result<BackendCallConfig> {
        let url = format!("{}/api/call/{}/config", self.base_url, self.channel);
        let body = self.get(&url).await?;
        serde_json::from_slice(&body)
            .map_err(|e| CallError::Rest(format!("malformed call config: {e}")))
    }

    pub async fn start_recording(&self) -> Result<()> {
        let url = format!("{}/api/call/{}/recording/start", self.base_url, self.channel);
        self.post(&url).await?;
        Ok(())
    }

    pub async fn stop_recording(&self) -> Result<()> {
        let url = format!("{}/api/call/{}/recording/stop", self.base_url, self.channel);
        self.post(&url).await?;
        Ok(())
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        debug!("GET {url}");
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| CallError::Rest(format!("request failed: {e}")))?;
        Self::read_body(response).await
    }

    async fn post(&self, url: &str) -> Result<Vec<u8>> {
        debug!("POST {url}");
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| CallError::Rest(format!("request failed: {e}")))?;
        Self::read_body(response).await
    }

    async fn read_body(response: reqwest::Response) -> Result<Vec<u8>> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(CallError::Rest(format!("{status}: {snippet}")));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CallError::Rest(format!("failed to read body: {e}")))?;
        if bytes.len() > MAX_BODY_BYTES {
            return Err(CallError::Rest(format!(
                "response body too large: {} bytes",
                bytes.len()
            )));
        }
        Ok(bytes.to_vec())
    }
}
