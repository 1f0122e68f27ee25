//! Artist metadata and audience history

use super::parse_string_list;
use crate::models::{Artist, AudienceSnapshot};
use crate::utils::{db_retry::max_lock_wait_ms, retry_on_lock};
use chrono::{NaiveDate, Utc};
use mcai_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

pub async fn upsert_artist(pool: &SqlitePool, artist: &Artist) -> Result<()> {
    let genres = serde_json::to_string(&artist.genres)?;
    let updated_at = Utc::now().to_rfc3339();
    let max_wait_ms = max_lock_wait_ms(pool).await?;

    retry_on_lock("upsert_artist", max_wait_ms, || async {
        sqlx::query(
            r#"
            INSERT INTO artists (
                artist_uuid, name, country_code, genres, image_url, metadata_fetched, updated_at
            ) VALUES (?, ?, ?, ?, ?, 1, ?)
            ON CONFLICT(artist_uuid) DO UPDATE SET
                name = CASE WHEN excluded.name = '' THEN artists.name ELSE excluded.name END,
                country_code = excluded.country_code,
                genres = excluded.genres,
                image_url = excluded.image_url,
                metadata_fetched = 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&artist.artist_uuid)
        .bind(&artist.name)
        .bind(&artist.country_code)
        .bind(&genres)
        .bind(&artist.image_url)
        .bind(&updated_at)
        .execute(pool)
        .await?;
        Ok(())
    })
    .await
}

fn row_to_artist(row: &SqliteRow) -> Artist {
    let genres: String = row.get("genres");
    Artist {
        artist_uuid: row.get("artist_uuid"),
        name: row.get("name"),
        country_code: row.get("country_code"),
        genres: parse_string_list(&genres),
        image_url: row.get("image_url"),
    }
}

pub async fn get_artist(pool: &SqlitePool, artist_uuid: &str) -> Result<Option<Artist>> {
    let row = sqlx::query("SELECT * FROM artists WHERE artist_uuid = ?")
        .bind(artist_uuid)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(row_to_artist))
}

pub async fn list_artists(
    pool: &SqlitePool,
    search: Option<&str>,
    limit: u32,
    offset: u32,
) -> Result<Vec<Artist>> {
    let pattern = search.map(|s| format!("%{}%", s.trim()));
    let rows = sqlx::query(
        r#"
        SELECT * FROM artists
        WHERE ?1 IS NULL OR name LIKE ?1
        ORDER BY name
        LIMIT ?2 OFFSET ?3
        "#,
    )
    .bind(&pattern)
    .bind(limit as i64)
    .bind(offset as i64)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_artist).collect())
}

/// Upsert snapshots; returns how many were written
pub async fn save_audience(pool: &SqlitePool, snapshots: &[AudienceSnapshot]) -> Result<usize> {
    if snapshots.is_empty() {
        return Ok(0);
    }
    let max_wait_ms = max_lock_wait_ms(pool).await?;

    retry_on_lock("save_audience", max_wait_ms, || async {
        let mut tx = pool.begin().await?;
        for snapshot in snapshots {
            sqlx::query(
                r#"
                INSERT INTO audience_snapshots (artist_uuid, platform, snapshot_date, follower_count)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(artist_uuid, platform, snapshot_date) DO UPDATE SET
                    follower_count = excluded.follower_count
                "#,
            )
            .bind(&snapshot.artist_uuid)
            .bind(&snapshot.platform)
            .bind(snapshot.date.format("%Y-%m-%d").to_string())
            .bind(snapshot.follower_count)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(snapshots.len())
    })
    .await
}

/// Audience history, newest first
pub async fn audience_history(
    pool: &SqlitePool,
    artist_uuid: &str,
    platform: Option<&str>,
    limit: u32,
) -> Result<Vec<AudienceSnapshot>> {
    let rows = sqlx::query(
        r#"
        SELECT artist_uuid, platform, snapshot_date, follower_count
        FROM audience_snapshots
        WHERE artist_uuid = ?1 AND (?2 IS NULL OR platform = ?2)
        ORDER BY snapshot_date DESC
        LIMIT ?3
        "#,
    )
    .bind(artist_uuid)
    .bind(platform)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let date: String = row.get("snapshot_date");
            Ok(AudienceSnapshot {
                artist_uuid: row.get("artist_uuid"),
                platform: row.get("platform"),
                date: NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                    .map_err(|e| Error::Internal(format!("Failed to parse snapshot_date: {}", e)))?,
                follower_count: row.get("follower_count"),
            })
        })
        .collect()
}
