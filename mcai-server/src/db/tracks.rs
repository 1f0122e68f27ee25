//! Track metadata and artist credits

use super::parse_string_list;
use crate::models::{Track, TrackArtist};
use crate::utils::{db_retry::max_lock_wait_ms, retry_on_lock};
use chrono::Utc;
use mcai_common::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Store fetched metadata and replace the artist credits
///
/// Credited artists are stubbed so the artist stage can find them.
pub async fn upsert_track(pool: &SqlitePool, track: &Track) -> Result<()> {
    let genres = serde_json::to_string(&track.genres)?;
    let updated_at = Utc::now().to_rfc3339();
    let max_wait_ms = max_lock_wait_ms(pool).await?;

    retry_on_lock("upsert_track", max_wait_ms, || async {
        let mut tx = pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO tracks (
                track_uuid, name, isrc, release_date, duration_seconds,
                genres, image_url, metadata_fetched, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?)
            ON CONFLICT(track_uuid) DO UPDATE SET
                name = CASE WHEN excluded.name = '' THEN tracks.name ELSE excluded.name END,
                isrc = excluded.isrc,
                release_date = excluded.release_date,
                duration_seconds = excluded.duration_seconds,
                genres = excluded.genres,
                image_url = excluded.image_url,
                metadata_fetched = 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&track.track_uuid)
        .bind(&track.name)
        .bind(&track.isrc)
        .bind(&track.release_date)
        .bind(track.duration_seconds)
        .bind(&genres)
        .bind(&track.image_url)
        .bind(&updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM track_artists WHERE track_uuid = ?")
            .bind(&track.track_uuid)
            .execute(&mut *tx)
            .await?;

        for (order, artist) in track.artists.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO artists (artist_uuid, name, updated_at) VALUES (?, ?, ?)
                ON CONFLICT(artist_uuid) DO NOTHING
                "#,
            )
            .bind(&artist.artist_uuid)
            .bind(&artist.name)
            .bind(&updated_at)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT OR IGNORE INTO track_artists (track_uuid, artist_uuid, credit_order) VALUES (?, ?, ?)",
            )
            .bind(&track.track_uuid)
            .bind(&artist.artist_uuid)
            .bind(order as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    })
    .await
}

async fn credits(pool: &SqlitePool, track_uuid: &str) -> Result<Vec<TrackArtist>> {
    let rows = sqlx::query(
        r#"
        SELECT a.artist_uuid, a.name FROM track_artists ta
        JOIN artists a ON a.artist_uuid = ta.artist_uuid
        WHERE ta.track_uuid = ?
        ORDER BY ta.credit_order
        "#,
    )
    .bind(track_uuid)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| TrackArtist {
            artist_uuid: row.get("artist_uuid"),
            name: row.get("name"),
        })
        .collect())
}

fn row_to_track(row: &SqliteRow) -> Track {
    let genres: String = row.get("genres");
    Track {
        track_uuid: row.get("track_uuid"),
        name: row.get("name"),
        isrc: row.get("isrc"),
        release_date: row.get("release_date"),
        duration_seconds: row.get("duration_seconds"),
        genres: parse_string_list(&genres),
        image_url: row.get("image_url"),
        artists: Vec::new(),
    }
}

pub async fn get_track(pool: &SqlitePool, track_uuid: &str) -> Result<Option<Track>> {
    let row = sqlx::query("SELECT * FROM tracks WHERE track_uuid = ?")
        .bind(track_uuid)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let mut track = row_to_track(&row);
    track.artists = credits(pool, track_uuid).await?;
    Ok(Some(track))
}

/// Tracks by name (case-insensitive substring) or exact ISRC
pub async fn list_tracks(
    pool: &SqlitePool,
    search: Option<&str>,
    limit: u32,
    offset: u32,
) -> Result<Vec<Track>> {
    let pattern = search.map(|s| format!("%{}%", s.trim()));
    let rows = sqlx::query(
        r#"
        SELECT * FROM tracks
        WHERE ?1 IS NULL OR name LIKE ?1 OR isrc = ?2
        ORDER BY name
        LIMIT ?3 OFFSET ?4
        "#,
    )
    .bind(&pattern)
    .bind(search.map(str::trim))
    .bind(limit as i64)
    .bind(offset as i64)
    .fetch_all(pool)
    .await?;

    let mut tracks: Vec<Track> = rows.iter().map(row_to_track).collect();
    for track in &mut tracks {
        track.artists = credits(pool, &track.track_uuid).await?;
    }
    Ok(tracks)
}

/// Tracks in the chart's newest snapshot, in chart order
pub async fn latest_chart_track_uuids(pool: &SqlitePool, chart_id: Uuid) -> Result<Vec<String>> {
    let uuids = sqlx::query_scalar(
        r#"
        SELECT track_uuid FROM chart_entries
        WHERE chart_id = ?1
          AND fetched_at = (SELECT MAX(fetched_at) FROM chart_entries WHERE chart_id = ?1)
        ORDER BY position
        "#,
    )
    .bind(chart_id.to_string())
    .fetch_all(pool)
    .await?;
    Ok(uuids)
}

/// Distinct artists credited on the given tracks, first credit order wins
pub async fn artists_for_tracks(pool: &SqlitePool, track_uuids: &[String]) -> Result<Vec<String>> {
    let mut seen = std::collections::HashSet::new();
    let mut ordered = Vec::new();
    for track_uuid in track_uuids {
        for credit in credits(pool, track_uuid).await? {
            if seen.insert(credit.artist_uuid.clone()) {
                ordered.push(credit.artist_uuid);
            }
        }
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::memory_pool;

    fn track(uuid: &str, artists: &[(&str, &str)]) -> Track {
        Track {
            track_uuid: uuid.to_string(),
            name: format!("Song {}", uuid),
            isrc: Some(format!("ISRC{}", uuid)),
            release_date: Some("2020-01-01".to_string()),
            duration_seconds: Some(180),
            genres: vec!["pop".to_string()],
            image_url: None,
            artists: artists
                .iter()
                .map(|(id, name)| TrackArtist {
                    artist_uuid: id.to_string(),
                    name: name.to_string(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_credits() {
        let pool = memory_pool().await;
        upsert_track(&pool, &track("t1", &[("a1", "One"), ("a2", "Two")])).await.unwrap();
        upsert_track(&pool, &track("t1", &[("a2", "Two")])).await.unwrap();

        let loaded = get_track(&pool, "t1").await.unwrap().unwrap();
        assert_eq!(loaded.genres, vec!["pop"]);
        assert_eq!(loaded.artists.len(), 1);
        assert_eq!(loaded.artists[0].artist_uuid, "a2");
    }

    #[tokio::test]
    async fn test_search_by_name_and_isrc() {
        let pool = memory_pool().await;
        upsert_track(&pool, &track("x1", &[])).await.unwrap();
        upsert_track(&pool, &track("y2", &[])).await.unwrap();

        assert_eq!(list_tracks(&pool, None, 10, 0).await.unwrap().len(), 2);
        assert_eq!(list_tracks(&pool, Some("song x"), 10, 0).await.unwrap().len(), 1);
        assert_eq!(list_tracks(&pool, Some("ISRCy2"), 10, 0).await.unwrap().len(), 1);
        assert_eq!(list_tracks(&pool, None, 1, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_artists_for_tracks_distinct() {
        let pool = memory_pool().await;
        upsert_track(&pool, &track("t1", &[("a1", "One"), ("a2", "Two")])).await.unwrap();
        upsert_track(&pool, &track("t2", &[("a2", "Two"), ("a3", "Three")])).await.unwrap();

        let artists = artists_for_tracks(&pool, &["t1".into(), "t2".into()]).await.unwrap();
        assert_eq!(artists, vec!["a1", "a2", "a3"]);
    }
}
