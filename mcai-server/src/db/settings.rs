//! Credential settings
//!
//! Third-party credentials may be stored in the settings table so they can
//! be rotated without editing config files. Database values take priority
//! over environment and TOML.

use mcai_common::db::{get_setting, set_setting};
use mcai_common::Result;
use sqlx::SqlitePool;

pub const ACRCLOUD_BEARER_TOKEN: &str = "acrcloud_bearer_token";
pub const ACRCLOUD_CONTAINER_ID: &str = "acrcloud_container_id";
pub const SOUNDCHARTS_APP_ID: &str = "soundcharts_app_id";
pub const SOUNDCHARTS_API_KEY: &str = "soundcharts_api_key";
pub const WEBHOOK_TOKEN: &str = "webhook_token";

/// Non-empty stored value
pub async fn get_credential(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    Ok(get_setting(pool, key)
        .await?
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty()))
}

pub async fn set_credential(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    set_setting(pool, key, value.trim()).await
}
