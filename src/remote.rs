//! Client side of the remote feature boundary.
//!
//! A display or recording process that has no direct access to the board
//! polls the acquisition process over HTTP. Responses use a small status
//! envelope; every way a request can go wrong maps onto [`TransportError`]
//! so the poller can skip the tick and carry on.

use crate::core::BandPowers;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Response body of the feature endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FeatureEnvelope {
    /// Band powers (`/data`) or per-channel averages (`/raw`)
    Success { data: Vec<f64> },
    NoData {
        #[serde(default)]
        message: String,
    },
    Error {
        #[serde(default)]
        message: String,
    },
}

impl FeatureEnvelope {
    pub fn success(data: Vec<f64>) -> Self {
        FeatureEnvelope::Success { data }
    }

    pub fn no_data() -> Self {
        FeatureEnvelope::NoData {
            message: "No data available yet".to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        FeatureEnvelope::Error {
            message: message.into(),
        }
    }
}

/// Failures talking to a remote feature server.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    MalformedBody(String),
    #[error("server reported error: {0}")]
    ServerReported(String),
}

/// Decode a response body.
pub fn parse_envelope(body: &[u8]) -> Result<FeatureEnvelope, TransportError> {
    serde_json::from_slice(body).map_err(|e| TransportError::MalformedBody(e.to_string()))
}

/// Turn an envelope into band powers. `Ok(None)` means the server has no data yet.
pub fn interpret_envelope(envelope: FeatureEnvelope) -> Result<Option<BandPowers>, TransportError> {
    match envelope {
        FeatureEnvelope::Success { data } => BandPowers::from_vector(&data)
            .map(Some)
            .map_err(|e| TransportError::MalformedBody(e.to_string())),
        FeatureEnvelope::NoData { .. } => Ok(None),
        FeatureEnvelope::Error { message } => Err(TransportError::ServerReported(message)),
    }
}

/// Where the remote feature server lives.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    /// Per-request timeout
    pub timeout: Duration,
}

impl RemoteConfig {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    /// Base URL of the server.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Band-power endpoint.
    pub fn data_url(&self) -> String {
        format!("{}/data", self.url())
    }

    /// Per-channel average endpoint.
    pub fn raw_url(&self) -> String {
        format!("{}/raw", self.url())
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.url())
    }
}

/// Async client for a remote feature server.
#[cfg(feature = "remote")]
pub struct RemoteFeatureClient {
    config: RemoteConfig,
    client: reqwest::Client,
}

#[cfg(feature = "remote")]
impl RemoteFeatureClient {
    pub fn new(config: RemoteConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TransportError::Network(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Check that the server answers its health endpoint.
    pub async fn test_connection(&self) -> Result<bool, TransportError> {
        let response = self
            .client
            .get(self.config.health_url())
            .send()
            .await
            .map_err(map_reqwest_error)?;
        Ok(response.status().is_success())
    }

    /// Fetch the raw envelope from `url`.
    pub async fn fetch_envelope(&self, url: &str) -> Result<FeatureEnvelope, TransportError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await.map_err(map_reqwest_error)?;
        parse_envelope(&body)
    }

    /// Latest band powers, or `None` when the server has nothing yet.
    pub async fn fetch_band_powers(&self) -> Result<Option<BandPowers>, TransportError> {
        let envelope = self.fetch_envelope(&self.config.data_url()).await?;
        interpret_envelope(envelope)
    }

    /// Latest per-channel averages of the raw signal.
    pub async fn fetch_channel_means(&self) -> Result<Option<Vec<f64>>, TransportError> {
        match self.fetch_envelope(&self.config.raw_url()).await? {
            FeatureEnvelope::Success { data } => Ok(Some(data)),
            FeatureEnvelope::NoData { .. } => Ok(None),
            FeatureEnvelope::Error { message } => Err(TransportError::ServerReported(message)),
        }
    }
}

#[cfg(feature = "remote")]
fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_decode() || e.is_body() {
        TransportError::MalformedBody(e.to_string())
    } else {
        TransportError::Network(e.to_string())
    }
}

/// Blocking wrapper for use on the poller's worker thread.
///
/// Must not be created or dropped from inside an async context.
#[cfg(feature = "remote")]
pub struct BlockingRemoteClient {
    inner: RemoteFeatureClient,
    runtime: tokio::runtime::Runtime,
}

#[cfg(feature = "remote")]
impl BlockingRemoteClient {
    pub fn new(config: RemoteConfig) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| TransportError::Network(format!("cannot create runtime: {e}")))?;

        Ok(Self {
            inner: RemoteFeatureClient::new(config)?,
            runtime,
        })
    }

    pub fn config(&self) -> &RemoteConfig {
        self.inner.config()
    }

    pub fn test_connection(&self) -> Result<bool, TransportError> {
        self.runtime.block_on(self.inner.test_connection())
    }

    pub fn fetch_band_powers(&self) -> Result<Option<BandPowers>, TransportError> {
        self.runtime.block_on(self.inner.fetch_band_powers())
    }

    pub fn fetch_channel_means(&self) -> Result<Option<Vec<f64>>, TransportError> {
        self.runtime.block_on(self.inner.fetch_channel_means())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_config_urls() {
        let config = RemoteConfig::new("127.0.0.1", 5000, Duration::from_secs(1));
        assert_eq!(config.url(), "http://127.0.0.1:5000");
        assert_eq!(config.data_url(), "http://127.0.0.1:5000/data");
        assert_eq!(config.raw_url(), "http://127.0.0.1:5000/raw");
        assert_eq!(config.health_url(), "http://127.0.0.1:5000/health");
    }

    #[test]
    fn test_success_envelope() {
        let envelope =
            parse_envelope(br#"{"status": "success", "data": [1.0, 2.0, 3.0, 4.0, 5.0]}"#)
                .unwrap();
        let bands = interpret_envelope(envelope).unwrap().unwrap();
        assert_eq!(bands.as_array(), [1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_no_data_envelope_without_message() {
        let envelope = parse_envelope(br#"{"status": "no_data"}"#).unwrap();
        assert_eq!(interpret_envelope(envelope), Ok(None));
    }

    #[test]
    fn test_error_envelope() {
        let envelope = parse_envelope(br#"{"status": "error", "message": "timeout"}"#).unwrap();
        assert_eq!(
            interpret_envelope(envelope),
            Err(TransportError::ServerReported("timeout".to_string()))
        );
    }

    #[test]
    fn test_raw_variant_is_not_band_powers() {
        let envelope = FeatureEnvelope::success(vec![0.1; 8]);
        assert!(matches!(
            interpret_envelope(envelope),
            Err(TransportError::MalformedBody(_))
        ));
    }

    #[test]
    fn test_malformed_bodies() {
        assert!(matches!(
            parse_envelope(b"<html>502</html>"),
            Err(TransportError::MalformedBody(_))
        ));
        assert!(matches!(
            parse_envelope(br#"{"status": "maybe"}"#),
            Err(TransportError::MalformedBody(_))
        ));
    }

    #[test]
    fn test_envelope_serialization() {
        let json = serde_json::to_value(FeatureEnvelope::success(vec![1.0])).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["data"][0], 1.0);

        let json = serde_json::to_value(FeatureEnvelope::no_data()).unwrap();
        assert_eq!(json["status"], "no_data");
        assert!(json["message"].is_string());
    }
}
