//! Configuration resolution for mcai-server
//!
//! Tunables come from the TOML file over compiled defaults (command-line
//! overrides are applied in `main`). Credentials resolve with Database →
//! ENV → TOML priority.

use crate::db::settings::{
    get_credential, ACRCLOUD_BEARER_TOKEN, ACRCLOUD_CONTAINER_ID, SOUNDCHARTS_API_KEY,
    SOUNDCHARTS_APP_ID, WEBHOOK_TOKEN,
};
use crate::services::cascade::{CascadeSettings, DEFAULT_AUDIENCE_PLATFORM, DEFAULT_BATCH_SIZE};
use crate::services::job_queue::DEFAULT_QUEUE_CAPACITY;
use crate::services::pipeline::{PipelineSettings, DEFAULT_MATCH_SCORE_THRESHOLD};
use crate::services::{acrcloud_client, soundcharts_client};
use crate::utils::RetryPolicy;
use mcai_common::config::{CompiledDefaults, TomlConfig};
use mcai_common::Result;
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

pub const WEBHOOK_TOKEN_ENV: &str = "MCAI_WEBHOOK_TOKEN";
pub const ACRCLOUD_TOKEN_ENV: &str = "MCAI_ACRCLOUD_TOKEN";
pub const ACRCLOUD_CONTAINER_ENV: &str = "MCAI_ACRCLOUD_CONTAINER_ID";
pub const SOUNDCHARTS_APP_ID_ENV: &str = "MCAI_SOUNDCHARTS_APP_ID";
pub const SOUNDCHARTS_API_KEY_ENV: &str = "MCAI_SOUNDCHARTS_API_KEY";

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;
const DEFAULT_FETCH_ATTEMPTS: u32 = 5;
const DEFAULT_SUBMIT_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_MS: u64 = 2_000;
const DEFAULT_RETRY_MAX_MS: u64 = 60_000;

/// Validate a credential (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

/// Where a credential was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Database,
    Environment,
    Toml,
}

impl CredentialSource {
    fn label(&self) -> &'static str {
        match self {
            CredentialSource::Database => "database",
            CredentialSource::Environment => "environment",
            CredentialSource::Toml => "TOML",
        }
    }
}

/// Resolve one credential: Database → ENV → TOML
///
/// Warns when several sources define it; `None` when none does.
pub async fn resolve_credential(
    db: &SqlitePool,
    name: &str,
    setting_key: &str,
    env_var: &str,
    toml_value: Option<&str>,
) -> Result<Option<(String, CredentialSource)>> {
    let candidates = [
        (get_credential(db, setting_key).await?, CredentialSource::Database),
        (std::env::var(env_var).ok(), CredentialSource::Environment),
        (toml_value.map(str::to_string), CredentialSource::Toml),
    ];

    let found: Vec<(String, CredentialSource)> = candidates
        .into_iter()
        .filter_map(|(value, source)| {
            value
                .filter(|v| is_valid_key(v))
                .map(|v| (v.trim().to_string(), source))
        })
        .collect();

    if found.len() > 1 {
        let sources: Vec<&str> = found.iter().map(|(_, s)| s.label()).collect();
        warn!(
            "{} found in multiple sources: {}. Using {} (highest priority).",
            name,
            sources.join(", "),
            found[0].1.label()
        );
    }

    Ok(found.into_iter().next().inspect(|(_, source)| {
        info!("{} loaded from {}", name, source.label());
    }))
}

/// Third-party credentials and the webhook token
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub acrcloud_bearer_token: Option<String>,
    pub acrcloud_container_id: Option<String>,
    pub soundcharts_app_id: Option<String>,
    pub soundcharts_api_key: Option<String>,
    pub webhook_token: Option<String>,
}

pub async fn resolve_credentials(db: &SqlitePool, toml: &TomlConfig) -> Result<Credentials> {
    let value = |found: Option<(String, CredentialSource)>| found.map(|(v, _)| v);

    let credentials = Credentials {
        acrcloud_bearer_token: value(
            resolve_credential(
                db,
                "ACRCloud bearer token",
                ACRCLOUD_BEARER_TOKEN,
                ACRCLOUD_TOKEN_ENV,
                toml.acrcloud.bearer_token.as_deref(),
            )
            .await?,
        ),
        acrcloud_container_id: value(
            resolve_credential(
                db,
                "ACRCloud container id",
                ACRCLOUD_CONTAINER_ID,
                ACRCLOUD_CONTAINER_ENV,
                toml.acrcloud.container_id.as_deref(),
            )
            .await?,
        ),
        soundcharts_app_id: value(
            resolve_credential(
                db,
                "SoundCharts app id",
                SOUNDCHARTS_APP_ID,
                SOUNDCHARTS_APP_ID_ENV,
                toml.soundcharts.app_id.as_deref(),
            )
            .await?,
        ),
        soundcharts_api_key: value(
            resolve_credential(
                db,
                "SoundCharts API key",
                SOUNDCHARTS_API_KEY,
                SOUNDCHARTS_API_KEY_ENV,
                toml.soundcharts.api_key.as_deref(),
            )
            .await?,
        ),
        webhook_token: value(
            resolve_credential(
                db,
                "Webhook token",
                WEBHOOK_TOKEN,
                WEBHOOK_TOKEN_ENV,
                toml.server.webhook_token.as_deref(),
            )
            .await?,
        ),
    };

    if credentials.webhook_token.is_none() {
        warn!("No webhook token configured; every callback will be rejected");
    }
    Ok(credentials)
}

/// Resolved service tunables
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_address: String,
    pub port: u16,
    pub max_upload_bytes: usize,
    pub queue_capacity: usize,
    pub acrcloud_base_url: String,
    pub soundcharts_base_url: String,
    pub soundcharts_requests_per_second: u32,
    pub pipeline: PipelineSettings,
    pub cascade: CascadeSettings,
}

impl ServiceConfig {
    /// TOML values over compiled defaults
    pub fn from_toml(toml: &TomlConfig, uploads_dir: PathBuf) -> Self {
        let defaults = CompiledDefaults::for_current_platform();
        let p = &toml.pipeline;

        let base_delay = Duration::from_millis(p.retry_base_delay_ms.unwrap_or(DEFAULT_RETRY_BASE_MS));
        let max_delay = Duration::from_millis(p.retry_max_delay_ms.unwrap_or(DEFAULT_RETRY_MAX_MS))
            .max(base_delay);
        let fetch_retry = RetryPolicy {
            max_attempts: p.max_fetch_attempts.unwrap_or(DEFAULT_FETCH_ATTEMPTS).max(1),
            base_delay,
            max_delay,
        };
        let submit_retry = RetryPolicy {
            max_attempts: DEFAULT_SUBMIT_ATTEMPTS,
            ..fetch_retry
        };

        let threshold = match p.match_score_threshold {
            Some(t) if (0.0..=100.0).contains(&t) => t,
            Some(t) => {
                warn!(
                    "match_score_threshold {} outside 0-100, using {}",
                    t, DEFAULT_MATCH_SCORE_THRESHOLD
                );
                DEFAULT_MATCH_SCORE_THRESHOLD
            }
            None => DEFAULT_MATCH_SCORE_THRESHOLD,
        };

        let s = &toml.soundcharts;

        Self {
            bind_address: toml.server.bind_address.clone().unwrap_or(defaults.bind_address),
            port: toml.server.port.unwrap_or(defaults.port),
            max_upload_bytes: toml.server.max_upload_bytes.unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
            queue_capacity: p.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY).max(1),
            acrcloud_base_url: toml
                .acrcloud
                .base_url
                .clone()
                .unwrap_or_else(|| acrcloud_client::DEFAULT_BASE_URL.to_string()),
            soundcharts_base_url: s
                .base_url
                .clone()
                .unwrap_or_else(|| soundcharts_client::DEFAULT_BASE_URL.to_string()),
            soundcharts_requests_per_second: s
                .requests_per_second
                .filter(|r| *r > 0)
                .unwrap_or(soundcharts_client::DEFAULT_REQUESTS_PER_SECOND),
            pipeline: PipelineSettings {
                uploads_dir,
                fetch_retry,
                submit_retry,
                match_score_threshold: threshold,
            },
            cascade: CascadeSettings {
                batch_size: s.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1),
                audience_platform: s
                    .audience_platform
                    .clone()
                    .filter(|p| is_valid_key(p))
                    .unwrap_or_else(|| DEFAULT_AUDIENCE_PLATFORM.to_string()),
                retry: RetryPolicy {
                    max_attempts: DEFAULT_SUBMIT_ATTEMPTS,
                    base_delay: Duration::from_millis(500),
                    max_delay: Duration::from_secs(10),
                },
            },
        }
    }
}
