//! SoundCharts API client
//!
//! Thin wrapper: request construction, a token-bucket rate limiter shared by
//! every call, and error classification. Payloads are returned raw and
//! normalized by `normalize::soundcharts`.

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::StatusCode;
use serde_json::Value;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://customer.api.soundcharts.com";
pub const DEFAULT_REQUESTS_PER_SECOND: u32 = 10;

const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum SoundchartsError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited by SoundCharts")]
    RateLimited,

    #[error("SoundCharts rejected credentials")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Refusing to request path segment {0:?}")]
    InvalidSegment(String),

    #[error("SoundCharts is not configured")]
    NotConfigured,
}

impl SoundchartsError {
    pub fn is_transient(&self) -> bool {
        match self {
            SoundchartsError::Network(_)
            | SoundchartsError::Timeout
            | SoundchartsError::RateLimited => true,
            SoundchartsError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SoundchartsError::Timeout
        } else {
            SoundchartsError::Network(err.to_string())
        }
    }
}

/// Identifiers are pasted into request paths; anything outside
/// `[A-Za-z0-9_-]` could rewrite the path or query
fn segment(value: &str) -> Result<&str, SoundchartsError> {
    if crate::models::is_valid_slug(value) {
        Ok(value)
    } else {
        Err(SoundchartsError::InvalidSegment(value.to_string()))
    }
}

/// Source of chart, track, artist and audience data for the cascade
#[async_trait]
pub trait ChartDataSource: Send + Sync {
    async fn chart_ranking(
        &self,
        slug: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Value, SoundchartsError>;

    async fn song(&self, track_uuid: &str) -> Result<Value, SoundchartsError>;

    async fn artist(&self, artist_uuid: &str) -> Result<Value, SoundchartsError>;

    async fn audience(&self, artist_uuid: &str, platform: &str)
        -> Result<Value, SoundchartsError>;
}

#[derive(Debug, Clone)]
pub struct SoundchartsSettings {
    pub base_url: String,
    pub app_id: String,
    pub api_key: String,
    pub requests_per_second: u32,
}

pub struct SoundchartsClient {
    http_client: reqwest::Client,
    settings: SoundchartsSettings,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl SoundchartsClient {
    pub fn new(settings: SoundchartsSettings) -> Result<Self, SoundchartsError> {
        if settings.app_id.is_empty() || settings.api_key.is_empty() {
            return Err(SoundchartsError::NotConfigured);
        }

        let per_second = NonZeroU32::new(settings.requests_per_second)
            .unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_second(per_second));

        let http_client = reqwest::Client::builder()
            .user_agent(mcai_common::config::get_user_agent())
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| SoundchartsError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            settings,
            rate_limiter,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, SoundchartsError> {
        self.rate_limiter.until_ready().await;
        tracing::debug!(path, "SoundCharts request");

        let response = self
            .http_client
            .get(self.url(path))
            .header("x-app-id", &self.settings.app_id)
            .header("x-api-key", &self.settings.api_key)
            .query(query)
            .send()
            .await
            .map_err(SoundchartsError::from_reqwest)?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(SoundchartsError::Unauthorized)
            }
            StatusCode::TOO_MANY_REQUESTS => return Err(SoundchartsError::RateLimited),
            StatusCode::NOT_FOUND => return Err(SoundchartsError::NotFound(path.to_string())),
            s if !s.is_success() => {
                let message = response.text().await.unwrap_or_default();
                return Err(SoundchartsError::Api {
                    status: s.as_u16(),
                    message,
                });
            }
            _ => {}
        }

        response
            .json()
            .await
            .map_err(|e| SoundchartsError::Parse(e.to_string()))
    }
}

#[async_trait]
impl ChartDataSource for SoundchartsClient {
    async fn chart_ranking(
        &self,
        slug: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Value, SoundchartsError> {
        let path = format!("/api/v2.14/chart/song/{}/ranking/latest", segment(slug)?);
        self.get(
            &path,
            &[("offset", offset.to_string()), ("limit", limit.to_string())],
        )
        .await
    }

    async fn song(&self, track_uuid: &str) -> Result<Value, SoundchartsError> {
        self.get(&format!("/api/v2.25/song/{}", segment(track_uuid)?), &[])
            .await
    }

    async fn artist(&self, artist_uuid: &str) -> Result<Value, SoundchartsError> {
        self.get(&format!("/api/v2.9/artist/{}", segment(artist_uuid)?), &[])
            .await
    }

    async fn audience(
        &self,
        artist_uuid: &str,
        platform: &str,
    ) -> Result<Value, SoundchartsError> {
        let path = format!(
            "/api/v2/artist/{}/audience/{}",
            segment(artist_uuid)?,
            segment(platform)?
        );
        self.get(&path, &[]).await
    }
}

/// Stand-in used when no SoundCharts credentials are configured
pub struct UnconfiguredChartSource;

#[async_trait]
impl ChartDataSource for UnconfiguredChartSource {
    async fn chart_ranking(
        &self,
        _slug: &str,
        _offset: usize,
        _limit: usize,
    ) -> Result<Value, SoundchartsError> {
        Err(SoundchartsError::NotConfigured)
    }

    async fn song(&self, _track_uuid: &str) -> Result<Value, SoundchartsError> {
        Err(SoundchartsError::NotConfigured)
    }

    async fn artist(&self, _artist_uuid: &str) -> Result<Value, SoundchartsError> {
        Err(SoundchartsError::NotConfigured)
    }

    async fn audience(
        &self,
        _artist_uuid: &str,
        _platform: &str,
    ) -> Result<Value, SoundchartsError> {
        Err(SoundchartsError::NotConfigured)
    }
}
