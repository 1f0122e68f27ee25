//! Database initialization
//!
//! Opens (or creates) the SQLite database, applies connection pragmas,
//! creates every table idempotently and seeds default settings.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::{info, warn};

/// Setting key: total time a write may spend retrying on lock contention
pub const SETTING_MAX_LOCK_WAIT_MS: &str = "database_max_lock_wait_ms";

/// Setting key: SQLite busy_timeout applied to every connection
pub const SETTING_LOCK_RETRY_MS: &str = "database_lock_retry_ms";

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                // Per-connection pragmas
                sqlx::query("PRAGMA foreign_keys = ON")
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("PRAGMA busy_timeout = 250")
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // WAL allows concurrent readers alongside the single job worker writer
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    create_schema(&pool).await?;
    init_default_settings(&pool).await?;

    Ok(pool)
}

/// Create every table (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_settings_table(pool).await?;
    create_analyses_table(pool).await?;
    create_analysis_reports_table(pool).await?;
    create_webhook_deliveries_table(pool).await?;

    create_charts_table(pool).await?;
    create_tracks_table(pool).await?;
    create_artists_table(pool).await?;
    create_chart_entries_table(pool).await?;
    create_track_artists_table(pool).await?;
    create_audience_snapshots_table(pool).await?;
    create_cascade_runs_table(pool).await?;

    Ok(())
}

/// Stores application configuration key-value pairs
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_analyses_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analyses (
            analysis_id TEXT PRIMARY KEY,
            original_filename TEXT NOT NULL,
            stored_path TEXT NOT NULL,
            content_sha256 TEXT NOT NULL,
            size_bytes INTEGER NOT NULL CHECK (size_bytes >= 0),
            state TEXT NOT NULL CHECK (state IN ('uploaded', 'submitted', 'processing', 'completed', 'failed')),
            external_file_id TEXT UNIQUE,
            result_ready INTEGER NOT NULL DEFAULT 0,
            fetch_attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_analyses_sha256 ON analyses(content_sha256)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_analyses_state ON analyses(state)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_analysis_reports_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analysis_reports (
            analysis_id TEXT PRIMARY KEY REFERENCES analyses(analysis_id) ON DELETE CASCADE,
            verdict TEXT NOT NULL,
            top_score REAL,
            music_match_count INTEGER NOT NULL DEFAULT 0,
            cover_match_count INTEGER NOT NULL DEFAULT 0,
            matches TEXT NOT NULL,
            raw_payload TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_webhook_deliveries_table(pool: &SqlitePool) -> Result<()> {
    // Every callback is recorded; 'pending' rows arrived before the
    // submission that assigns their file id was persisted
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS webhook_deliveries (
            delivery_id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_file_id TEXT NOT NULL,
            status TEXT NOT NULL,
            payload TEXT NOT NULL,
            outcome TEXT NOT NULL CHECK (outcome IN ('applied', 'ignored', 'rejected', 'pending', 'replayed')),
            received_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_file ON webhook_deliveries(external_file_id, outcome)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_charts_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS charts (
            chart_id TEXT PRIMARY KEY,
            slug TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            platform TEXT,
            country_code TEXT,
            created_at TEXT NOT NULL,
            last_fetched_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_tracks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tracks (
            track_uuid TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            isrc TEXT,
            release_date TEXT,
            duration_seconds INTEGER,
            genres TEXT NOT NULL DEFAULT '[]',
            image_url TEXT,
            metadata_fetched INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_artists_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artists (
            artist_uuid TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            country_code TEXT,
            genres TEXT NOT NULL DEFAULT '[]',
            image_url TEXT,
            metadata_fetched INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_chart_entries_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chart_entries (
            chart_id TEXT NOT NULL REFERENCES charts(chart_id) ON DELETE CASCADE,
            fetched_at TEXT NOT NULL,
            position INTEGER NOT NULL,
            previous_position INTEGER,
            position_change INTEGER,
            weeks_on_chart INTEGER,
            track_uuid TEXT NOT NULL REFERENCES tracks(track_uuid),
            PRIMARY KEY (chart_id, fetched_at, position)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chart_entries_track ON chart_entries(track_uuid)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_track_artists_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS track_artists (
            track_uuid TEXT NOT NULL REFERENCES tracks(track_uuid) ON DELETE CASCADE,
            artist_uuid TEXT NOT NULL REFERENCES artists(artist_uuid) ON DELETE CASCADE,
            credit_order INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (track_uuid, artist_uuid)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_audience_snapshots_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audience_snapshots (
            artist_uuid TEXT NOT NULL REFERENCES artists(artist_uuid) ON DELETE CASCADE,
            platform TEXT NOT NULL,
            snapshot_date TEXT NOT NULL,
            follower_count INTEGER,
            PRIMARY KEY (artist_uuid, platform, snapshot_date)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_cascade_runs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cascade_runs (
            run_id TEXT PRIMARY KEY,
            chart_id TEXT NOT NULL REFERENCES charts(chart_id) ON DELETE CASCADE,
            state TEXT NOT NULL CHECK (state IN ('running', 'completed', 'failed')),
            stop_after TEXT NOT NULL,
            counters TEXT NOT NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one running run per chart
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_cascade_runs_one_running
        ON cascade_runs(chart_id) WHERE state = 'running'
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Initialize or repair default settings
async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    ensure_setting(pool, SETTING_MAX_LOCK_WAIT_MS, "5000").await?;
    ensure_setting(pool, SETTING_LOCK_RETRY_MS, "250").await?;

    let timeout_ms: i64 = sqlx::query_scalar(
        "SELECT CAST(value AS INTEGER) FROM settings WHERE key = ?",
    )
    .bind(SETTING_LOCK_RETRY_MS)
    .fetch_optional(pool)
    .await?
    .unwrap_or(250);

    sqlx::query(&format!("PRAGMA busy_timeout = {}", timeout_ms))
        .execute(pool)
        .await?;

    info!("Default settings initialized (busy timeout {} ms)", timeout_ms);
    Ok(())
}

/// Ensure a setting exists with the specified default value
///
/// Missing settings are created; NULL values are reset to the default.
pub async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    let value: Option<Option<String>> =
        sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;

    match value {
        None => {
            // OR IGNORE: concurrent initializers may race past the lookup
            sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(default_value)
                .execute(pool)
                .await?;
            info!("Initialized setting '{}' with default value: {}", key, default_value);
        }
        Some(None) => {
            sqlx::query("UPDATE settings SET value = ? WHERE key = ?")
                .bind(default_value)
                .bind(key)
                .execute(pool)
                .await?;
            warn!("Setting '{}' was NULL, reset to default: {}", key, default_value);
        }
        Some(Some(_)) => {}
    }

    Ok(())
}

/// Read a setting value
pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value: Option<Option<String>> =
        sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;
    Ok(value.flatten())
}

/// Insert or replace a setting value
pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}
