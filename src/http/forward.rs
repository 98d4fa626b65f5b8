//! Best-effort relay of client logs to an external collector.

use std::time::Duration;

use serde_json::Value;

use crate::error::{Result, TollboothError};

/// Upper bound on a single forward so a slow collector cannot stall callers.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

/// Header carrying the collector's API key.
pub const FORWARD_KEY_HEADER: &str = "x-api-key";

/// Posts log payloads as JSON to a configured URL.
#[derive(Debug, Clone)]
pub struct LogForwarder {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl LogForwarder {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FORWARD_TIMEOUT)
            .build()
            .map_err(|e| TollboothError::Config(format!("log forward client: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send one payload. Non-2xx replies count as failures.
    pub async fn forward(&self, payload: &Value) -> std::result::Result<(), reqwest::Error> {
        let mut request = self.client.post(&self.url).json(payload);
        if let Some(key) = &self.api_key {
            request = request.header(FORWARD_KEY_HEADER, key);
        }
        request.send().await?.error_for_status()?;
        Ok(())
    }
}
