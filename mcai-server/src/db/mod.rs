//! Database access for mcai-server
//!
//! Runtime `sqlx` queries over the shared pool. Schema lives in
//! `mcai_common::db`; every write goes through `retry_on_lock`.

pub mod analyses;
pub mod analytics;
pub mod artists;
pub mod cascade_runs;
pub mod charts;
pub mod deliveries;
pub mod reports;
pub mod settings;
pub mod tracks;

use chrono::{DateTime, Utc};
use mcai_common::{Error, Result};
use uuid::Uuid;

pub(crate) fn parse_timestamp(value: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", column, e)))
}

pub(crate) fn parse_optional_timestamp(
    value: Option<String>,
    column: &str,
) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_timestamp(&v, column)).transpose()
}

pub(crate) fn parse_uuid(value: &str, column: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| Error::Internal(format!("Invalid UUID in {}: {}", column, e)))
}

/// Decode a JSON string list column, tolerating legacy garbage as empty
pub(crate) fn parse_string_list(value: &str) -> Vec<String> {
    serde_json::from_str(value).unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod test_support {
    use sqlx::SqlitePool;

    /// In-memory database with the full schema
    pub async fn memory_pool() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await.unwrap();
        mcai_common::db::create_schema(&pool).await.unwrap();
        pool
    }
}
