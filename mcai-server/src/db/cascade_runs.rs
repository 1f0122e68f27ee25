//! Cascade run bookkeeping

use super::{parse_optional_timestamp, parse_timestamp, parse_uuid};
use crate::models::{CascadeCounters, CascadeRun};
use crate::utils::{db_retry::max_lock_wait_ms, retry_on_lock};
use chrono::Utc;
use mcai_common::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

fn row_to_run(row: &SqliteRow) -> Result<CascadeRun> {
    let run_id: String = row.get("run_id");
    let chart_id: String = row.get("chart_id");
    let state: String = row.get("state");
    let stop_after: String = row.get("stop_after");
    let counters: String = row.get("counters");
    let started_at: String = row.get("started_at");

    Ok(CascadeRun {
        run_id: parse_uuid(&run_id, "run_id")?,
        chart_id: parse_uuid(&chart_id, "chart_id")?,
        state: state.parse()?,
        stop_after: stop_after.parse()?,
        counters: serde_json::from_str::<CascadeCounters>(&counters)?,
        started_at: parse_timestamp(&started_at, "started_at")?,
        ended_at: parse_optional_timestamp(row.get("ended_at"), "ended_at")?,
        error: row.get("error"),
    })
}

/// Insert or update a run
pub async fn save_run(pool: &SqlitePool, run: &CascadeRun) -> Result<()> {
    let run_id = run.run_id.to_string();
    let chart_id = run.chart_id.to_string();
    let counters = serde_json::to_string(&run.counters)?;
    let started_at = run.started_at.to_rfc3339();
    let ended_at = run.ended_at.map(|dt| dt.to_rfc3339());
    let max_wait_ms = max_lock_wait_ms(pool).await?;

    retry_on_lock("save_cascade_run", max_wait_ms, || async {
        sqlx::query(
            r#"
            INSERT INTO cascade_runs (
                run_id, chart_id, state, stop_after, counters, started_at, ended_at, error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(run_id) DO UPDATE SET
                state = excluded.state,
                counters = excluded.counters,
                ended_at = excluded.ended_at,
                error = excluded.error
            "#,
        )
        .bind(&run_id)
        .bind(&chart_id)
        .bind(run.state.as_str())
        .bind(run.stop_after.as_str())
        .bind(&counters)
        .bind(&started_at)
        .bind(&ended_at)
        .bind(&run.error)
        .execute(pool)
        .await?;
        Ok(())
    })
    .await
}

pub async fn load_run(pool: &SqlitePool, run_id: Uuid) -> Result<Option<CascadeRun>> {
    let row = sqlx::query("SELECT * FROM cascade_runs WHERE run_id = ?")
        .bind(run_id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_run).transpose()
}

/// Runs for a chart, newest first
pub async fn list_runs_for_chart(pool: &SqlitePool, chart_id: Uuid, limit: u32) -> Result<Vec<CascadeRun>> {
    let rows = sqlx::query(
        "SELECT * FROM cascade_runs WHERE chart_id = ? ORDER BY started_at DESC LIMIT ?",
    )
    .bind(chart_id.to_string())
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_run).collect()
}

/// Whether a run for this chart is still in flight
pub async fn has_running_run(pool: &SqlitePool, chart_id: Uuid) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM cascade_runs WHERE chart_id = ? AND state = 'running'",
    )
    .bind(chart_id.to_string())
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

/// Fail every run still marked running; returns how many were touched
pub async fn fail_interrupted_runs(pool: &SqlitePool, reason: &str) -> Result<u64> {
    let ended_at = Utc::now().to_rfc3339();
    let max_wait_ms = max_lock_wait_ms(pool).await?;

    retry_on_lock("fail_interrupted_runs", max_wait_ms, || async {
        let result = sqlx::query(
            "UPDATE cascade_runs SET state = 'failed', ended_at = ?, error = ? WHERE state = 'running'",
        )
        .bind(&ended_at)
        .bind(reason)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    })
    .await
}
