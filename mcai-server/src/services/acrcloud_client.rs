//! ACRCloud file-scanning client
//!
//! Uploads audio into a file-scanning container and fetches the scan result
//! once the container has called back. Payload interpretation lives in
//! `normalize::acrcloud`; this client only builds requests and classifies
//! failures.

use crate::normalize::acrcloud::extract_file_id;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://api-v2.acrcloud.com";

const REQUEST_TIMEOUT_SECS: u64 = 60;

/// ACRCloud client errors
#[derive(Debug, Error)]
pub enum AcrCloudError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited by ACRCloud")]
    RateLimited,

    #[error("ACRCloud rejected credentials")]
    Unauthorized,

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("ACRCloud is not configured")]
    NotConfigured,
}

impl AcrCloudError {
    /// Worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        match self {
            AcrCloudError::Network(_) | AcrCloudError::Timeout | AcrCloudError::RateLimited => {
                true
            }
            AcrCloudError::Api { status, .. } => *status >= 500,
            AcrCloudError::Unauthorized | AcrCloudError::Parse(_) | AcrCloudError::NotConfigured => {
                false
            }
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AcrCloudError::Timeout
        } else {
            AcrCloudError::Network(err.to_string())
        }
    }
}

/// Fingerprinting backend used by the analysis pipeline
#[async_trait]
pub trait FingerprintService: Send + Sync {
    /// Upload audio; returns the service's file id
    async fn upload(&self, filename: &str, bytes: Vec<u8>) -> Result<String, AcrCloudError>;

    /// Fetch the raw scan result for a file id
    async fn fetch_result(&self, external_file_id: &str) -> Result<Value, AcrCloudError>;
}

/// Credentials and container for [`AcrCloudClient`]
#[derive(Debug, Clone)]
pub struct AcrCloudSettings {
    pub base_url: String,
    pub bearer_token: String,
    pub container_id: String,
}

pub struct AcrCloudClient {
    http_client: reqwest::Client,
    settings: AcrCloudSettings,
}

impl AcrCloudClient {
    pub fn new(settings: AcrCloudSettings) -> Result<Self, AcrCloudError> {
        if settings.bearer_token.is_empty() || settings.container_id.is_empty() {
            return Err(AcrCloudError::NotConfigured);
        }

        let http_client = reqwest::Client::builder()
            .user_agent(mcai_common::config::get_user_agent())
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| AcrCloudError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            settings,
        })
    }

    fn files_url(&self) -> String {
        format!(
            "{}/api/fs-containers/{}/files",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.container_id
        )
    }

    async fn read_json(response: reqwest::Response) -> Result<Value, AcrCloudError> {
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AcrCloudError::Unauthorized);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AcrCloudError::RateLimited);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AcrCloudError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| AcrCloudError::Parse(e.to_string()))
    }
}

#[async_trait]
impl FingerprintService for AcrCloudClient {
    async fn upload(&self, filename: &str, bytes: Vec<u8>) -> Result<String, AcrCloudError> {
        tracing::debug!(filename, size = bytes.len(), "Uploading file to ACRCloud");

        let form = Form::new()
            .text("data_type", "audio")
            .part("file", Part::bytes(bytes).file_name(filename.to_string()));

        let response = self
            .http_client
            .post(self.files_url())
            .bearer_auth(&self.settings.bearer_token)
            .multipart(form)
            .send()
            .await
            .map_err(AcrCloudError::from_reqwest)?;

        let body = Self::read_json(response).await?;
        let file_id = extract_file_id(&body)
            .ok_or_else(|| AcrCloudError::Parse("upload response has no file id".to_string()))?;

        tracing::info!(external_file_id = %file_id, "ACRCloud accepted upload");
        Ok(file_id)
    }

    async fn fetch_result(&self, external_file_id: &str) -> Result<Value, AcrCloudError> {
        let url = format!("{}/{}", self.files_url(), external_file_id);
        tracing::debug!(external_file_id, "Fetching ACRCloud file result");

        let response = self
            .http_client
            .get(url)
            .bearer_auth(&self.settings.bearer_token)
            .send()
            .await
            .map_err(AcrCloudError::from_reqwest)?;

        Self::read_json(response).await
    }
}

/// Stand-in used when no ACRCloud credentials are configured
///
/// Every call fails permanently, so uploads are accepted and end up
/// `failed` with a clear reason until credentials are supplied.
pub struct UnconfiguredFingerprint;

#[async_trait]
impl FingerprintService for UnconfiguredFingerprint {
    async fn upload(&self, _filename: &str, _bytes: Vec<u8>) -> Result<String, AcrCloudError> {
        Err(AcrCloudError::NotConfigured)
    }

    async fn fetch_result(&self, _external_file_id: &str) -> Result<Value, AcrCloudError> {
        Err(AcrCloudError::NotConfigured)
    }
}
