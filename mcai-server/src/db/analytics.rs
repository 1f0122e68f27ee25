//! Aggregations behind the report endpoints

use super::parse_timestamp;
use chrono::{DateTime, Utc};
use mcai_common::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Mover {
    pub track_uuid: String,
    pub track_name: Option<String>,
    pub position: i64,
    pub previous_position: Option<i64>,
    pub position_change: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChartMovers {
    pub chart_id: Uuid,
    /// Snapshot the movers were computed from
    pub fetched_at: Option<DateTime<Utc>>,
    pub gainers: Vec<Mover>,
    pub losers: Vec<Mover>,
}

/// Largest climbs and drops in the newest snapshot
///
/// Entries with no known previous position (new entries) are excluded.
pub async fn chart_movers(pool: &SqlitePool, chart_id: Uuid, limit: u32) -> Result<ChartMovers> {
    let rows = sqlx::query(
        r#"
        SELECT e.fetched_at, e.track_uuid, t.name AS track_name, e.position,
               e.previous_position,
               COALESCE(e.position_change, e.previous_position - e.position) AS change
        FROM chart_entries e
        JOIN tracks t ON t.track_uuid = e.track_uuid
        WHERE e.chart_id = ?1
          AND e.fetched_at = (SELECT MAX(fetched_at) FROM chart_entries WHERE chart_id = ?1)
        "#,
    )
    .bind(chart_id.to_string())
    .fetch_all(pool)
    .await?;

    let mut fetched_at = None;
    let mut movers = Vec::new();
    for row in &rows {
        if fetched_at.is_none() {
            let ts: String = row.get("fetched_at");
            fetched_at = Some(parse_timestamp(&ts, "fetched_at")?);
        }
        let Some(change) = row.get::<Option<i64>, _>("change") else {
            continue;
        };
        let name: String = row.get("track_name");
        movers.push(Mover {
            track_uuid: row.get("track_uuid"),
            track_name: (!name.is_empty()).then_some(name),
            position: row.get("position"),
            previous_position: row.get("previous_position"),
            position_change: change,
        });
    }

    let limit = limit as usize;
    let mut gainers: Vec<Mover> = movers.iter().filter(|m| m.position_change > 0).cloned().collect();
    gainers.sort_by(|a, b| b.position_change.cmp(&a.position_change).then(a.position.cmp(&b.position)));
    gainers.truncate(limit);

    let mut losers: Vec<Mover> = movers.into_iter().filter(|m| m.position_change < 0).collect();
    losers.sort_by(|a, b| a.position_change.cmp(&b.position_change).then(a.position.cmp(&b.position)));
    losers.truncate(limit);

    Ok(ChartMovers {
        chart_id,
        fetched_at,
        gainers,
        losers,
    })
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TopArtist {
    pub artist_uuid: String,
    pub name: String,
    /// Chart entries across all snapshots crediting this artist
    pub appearances: i64,
    pub latest_follower_count: Option<i64>,
    pub latest_snapshot_date: Option<String>,
}

/// Artists ranked by chart appearances
pub async fn top_artists(pool: &SqlitePool, platform: Option<&str>, limit: u32) -> Result<Vec<TopArtist>> {
    let rows = sqlx::query(
        r#"
        SELECT a.artist_uuid, a.name, COUNT(*) AS appearances,
               (SELECT s.follower_count FROM audience_snapshots s
                 WHERE s.artist_uuid = a.artist_uuid AND (?1 IS NULL OR s.platform = ?1)
                 ORDER BY s.snapshot_date DESC LIMIT 1) AS latest_follower_count,
               (SELECT s.snapshot_date FROM audience_snapshots s
                 WHERE s.artist_uuid = a.artist_uuid AND (?1 IS NULL OR s.platform = ?1)
                 ORDER BY s.snapshot_date DESC LIMIT 1) AS latest_snapshot_date
        FROM chart_entries e
        JOIN track_artists ta ON ta.track_uuid = e.track_uuid
        JOIN artists a ON a.artist_uuid = ta.artist_uuid
        GROUP BY a.artist_uuid
        ORDER BY appearances DESC, a.name
        LIMIT ?2
        "#,
    )
    .bind(platform)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| TopArtist {
            artist_uuid: row.get("artist_uuid"),
            name: row.get("name"),
            appearances: row.get("appearances"),
            latest_follower_count: row.get("latest_follower_count"),
            latest_snapshot_date: row.get("latest_snapshot_date"),
        })
        .collect())
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct AnalysesSummary {
    pub total: i64,
    pub by_state: BTreeMap<String, i64>,
    pub by_verdict: BTreeMap<String, i64>,
}

pub async fn analyses_summary(pool: &SqlitePool) -> Result<AnalysesSummary> {
    let mut summary = AnalysesSummary::default();

    let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM analyses GROUP BY state")
        .fetch_all(pool)
        .await?;
    for row in &rows {
        let n: i64 = row.get("n");
        summary.total += n;
        summary.by_state.insert(row.get("state"), n);
    }

    let rows = sqlx::query(
        r#"
        SELECT r.verdict AS verdict, COUNT(*) AS n
        FROM analysis_reports r
        JOIN analyses a ON a.analysis_id = r.analysis_id
        WHERE a.state = 'completed'
        GROUP BY r.verdict
        "#,
    )
    .fetch_all(pool)
    .await?;
    for row in &rows {
        summary.by_verdict.insert(row.get("verdict"), row.get("n"));
    }

    Ok(summary)
}
