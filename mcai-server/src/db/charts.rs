//! Charts and ranking snapshots

use super::{parse_optional_timestamp, parse_timestamp, parse_uuid};
use crate::models::{Chart, ChartEntry, NewChart};
use crate::normalize::soundcharts::RankingItem;
use crate::utils::{db_retry::max_lock_wait_ms, retry_on_lock};
use chrono::{DateTime, Utc};
use mcai_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

fn row_to_chart(row: &SqliteRow) -> Result<Chart> {
    let chart_id: String = row.get("chart_id");
    let created_at: String = row.get("created_at");
    Ok(Chart {
        chart_id: parse_uuid(&chart_id, "chart_id")?,
        slug: row.get("slug"),
        name: row.get("name"),
        platform: row.get("platform"),
        country_code: row.get("country_code"),
        created_at: parse_timestamp(&created_at, "created_at")?,
        last_fetched_at: parse_optional_timestamp(row.get("last_fetched_at"), "last_fetched_at")?,
    })
}

pub async fn insert_chart(pool: &SqlitePool, new_chart: &NewChart) -> Result<Chart> {
    let chart = Chart {
        chart_id: Uuid::new_v4(),
        slug: new_chart.slug.trim().to_string(),
        name: new_chart.name.trim().to_string(),
        platform: new_chart.platform.clone(),
        country_code: new_chart.country_code.as_ref().map(|c| c.to_ascii_uppercase()),
        created_at: Utc::now(),
        last_fetched_at: None,
    };
    let chart_id = chart.chart_id.to_string();
    let created_at = chart.created_at.to_rfc3339();
    let max_wait_ms = max_lock_wait_ms(pool).await?;

    retry_on_lock("insert_chart", max_wait_ms, || async {
        sqlx::query(
            r#"
            INSERT INTO charts (chart_id, slug, name, platform, country_code, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chart_id)
        .bind(&chart.slug)
        .bind(&chart.name)
        .bind(&chart.platform)
        .bind(&chart.country_code)
        .bind(&created_at)
        .execute(pool)
        .await?;
        Ok(())
    })
    .await
    .map_err(|e| {
        if e.is_unique_violation() {
            Error::Conflict(format!("Chart '{}' is already tracked", chart.slug))
        } else {
            e
        }
    })?;

    Ok(chart)
}

pub async fn get_chart(pool: &SqlitePool, chart_id: Uuid) -> Result<Option<Chart>> {
    let row = sqlx::query("SELECT * FROM charts WHERE chart_id = ?")
        .bind(chart_id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_chart).transpose()
}

pub async fn list_charts(pool: &SqlitePool) -> Result<Vec<Chart>> {
    let rows = sqlx::query("SELECT * FROM charts ORDER BY name")
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_chart).collect()
}

/// Delete a chart with its entries and runs; false if it did not exist
pub async fn delete_chart(pool: &SqlitePool, chart_id: Uuid) -> Result<bool> {
    let chart_id = chart_id.to_string();
    let max_wait_ms = max_lock_wait_ms(pool).await?;

    let rows = retry_on_lock("delete_chart", max_wait_ms, || async {
        let result = sqlx::query("DELETE FROM charts WHERE chart_id = ?")
            .bind(&chart_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    })
    .await?;

    Ok(rows > 0)
}

/// Persist one ranking snapshot
///
/// Tracks not seen before are stored as stubs (name only) so entries can
/// reference them before the track stage fills in metadata.
pub async fn save_ranking(
    pool: &SqlitePool,
    chart_id: Uuid,
    fetched_at: DateTime<Utc>,
    items: &[RankingItem],
) -> Result<()> {
    let chart_id = chart_id.to_string();
    let fetched_at = fetched_at.to_rfc3339();
    let max_wait_ms = max_lock_wait_ms(pool).await?;

    retry_on_lock("save_ranking", max_wait_ms, || async {
        let mut tx = pool.begin().await?;

        for item in items {
            sqlx::query(
                r#"
                INSERT INTO tracks (track_uuid, name, updated_at) VALUES (?, ?, ?)
                ON CONFLICT(track_uuid) DO UPDATE SET
                    name = CASE WHEN tracks.name = '' THEN excluded.name ELSE tracks.name END
                "#,
            )
            .bind(&item.track_uuid)
            .bind(item.track_name.as_deref().unwrap_or(""))
            .bind(&fetched_at)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT OR REPLACE INTO chart_entries (
                    chart_id, fetched_at, position, previous_position,
                    position_change, weeks_on_chart, track_uuid
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chart_id)
            .bind(&fetched_at)
            .bind(item.position)
            .bind(item.previous_position)
            .bind(item.position_change)
            .bind(item.weeks_on_chart)
            .bind(&item.track_uuid)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE charts SET last_fetched_at = ? WHERE chart_id = ?")
            .bind(&fetched_at)
            .bind(&chart_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    })
    .await
}

/// Entries of the most recent snapshot, by position
pub async fn latest_entries(pool: &SqlitePool, chart_id: Uuid) -> Result<Vec<ChartEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT e.chart_id, e.fetched_at, e.position, e.previous_position,
               e.position_change, e.weeks_on_chart, e.track_uuid, t.name AS track_name
        FROM chart_entries e
        JOIN tracks t ON t.track_uuid = e.track_uuid
        WHERE e.chart_id = ?
          AND e.fetched_at = (SELECT MAX(fetched_at) FROM chart_entries WHERE chart_id = e.chart_id)
        ORDER BY e.position
        "#,
    )
    .bind(chart_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let chart_id: String = row.get("chart_id");
            let fetched_at: String = row.get("fetched_at");
            let track_name: String = row.get("track_name");
            Ok(ChartEntry {
                chart_id: parse_uuid(&chart_id, "chart_id")?,
                fetched_at: parse_timestamp(&fetched_at, "fetched_at")?,
                position: row.get("position"),
                previous_position: row.get("previous_position"),
                position_change: row.get("position_change"),
                weeks_on_chart: row.get("weeks_on_chart"),
                track_uuid: row.get("track_uuid"),
                track_name: (!track_name.is_empty()).then_some(track_name),
            })
        })
        .collect()
}
