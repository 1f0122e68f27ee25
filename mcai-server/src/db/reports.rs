//! Analysis report persistence

use crate::models::{AnalysisReport, Verdict};
use crate::utils::{db_retry::max_lock_wait_ms, retry_on_lock};
use chrono::Utc;
use mcai_common::{Error, Result};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Store (or replace) the report for an analysis, keeping the raw payload
pub async fn save_report(
    pool: &SqlitePool,
    analysis_id: Uuid,
    report: &AnalysisReport,
    raw_payload: &Value,
) -> Result<()> {
    let analysis_id = analysis_id.to_string();
    let matches = serde_json::to_string(&report.matches)?;
    let raw_payload = raw_payload.to_string();
    let created_at = Utc::now().to_rfc3339();
    let max_wait_ms = max_lock_wait_ms(pool).await?;

    retry_on_lock("save_report", max_wait_ms, || async {
        sqlx::query(
            r#"
            INSERT INTO analysis_reports (
                analysis_id, verdict, top_score, music_match_count, cover_match_count,
                matches, raw_payload, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(analysis_id) DO UPDATE SET
                verdict = excluded.verdict,
                top_score = excluded.top_score,
                music_match_count = excluded.music_match_count,
                cover_match_count = excluded.cover_match_count,
                matches = excluded.matches,
                raw_payload = excluded.raw_payload,
                created_at = excluded.created_at
            "#,
        )
        .bind(&analysis_id)
        .bind(report.verdict.as_str())
        .bind(report.top_score)
        .bind(report.music_match_count as i64)
        .bind(report.cover_match_count as i64)
        .bind(&matches)
        .bind(&raw_payload)
        .bind(&created_at)
        .execute(pool)
        .await?;
        Ok(())
    })
    .await
}

pub async fn load_report(pool: &SqlitePool, analysis_id: Uuid) -> Result<Option<AnalysisReport>> {
    let row = sqlx::query(
        r#"
        SELECT verdict, top_score, music_match_count, cover_match_count, matches
        FROM analysis_reports WHERE analysis_id = ?
        "#,
    )
    .bind(analysis_id.to_string())
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let verdict: String = row.get("verdict");
    let matches: String = row.get("matches");

    Ok(Some(AnalysisReport {
        verdict: Verdict::parse(&verdict)
            .ok_or_else(|| Error::Internal(format!("Unknown verdict in database: {}", verdict)))?,
        top_score: row.get("top_score"),
        music_match_count: row.get::<i64, _>("music_match_count").max(0) as usize,
        cover_match_count: row.get::<i64, _>("cover_match_count").max(0) as usize,
        matches: serde_json::from_str(&matches)?,
    }))
}
