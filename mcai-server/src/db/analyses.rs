//! Analysis persistence
//!
//! State changes are compare-and-set on `(state, result_ready)` so two
//! deliveries racing on the same analysis cannot both apply.

use super::{parse_optional_timestamp, parse_timestamp, parse_uuid};
use crate::models::Analysis;
use crate::utils::{db_retry::max_lock_wait_ms, retry_on_lock};
use chrono::Utc;
use mcai_common::events::AnalysisState;
use mcai_common::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

const COLUMNS: &str = r#"
    analysis_id, original_filename, stored_path, content_sha256, size_bytes,
    state, external_file_id, result_ready, fetch_attempts, last_error,
    created_at, updated_at, completed_at
"#;

fn row_to_analysis(row: &SqliteRow) -> Result<Analysis> {
    let analysis_id: String = row.get("analysis_id");
    let state: String = row.get("state");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Analysis {
        analysis_id: parse_uuid(&analysis_id, "analysis_id")?,
        original_filename: row.get("original_filename"),
        stored_path: row.get("stored_path"),
        content_sha256: row.get("content_sha256"),
        size_bytes: row.get("size_bytes"),
        state: state.parse()?,
        external_file_id: row.get("external_file_id"),
        result_ready: row.get::<i64, _>("result_ready") != 0,
        fetch_attempts: row.get::<i64, _>("fetch_attempts").max(0) as u32,
        last_error: row.get("last_error"),
        created_at: parse_timestamp(&created_at, "created_at")?,
        updated_at: parse_timestamp(&updated_at, "updated_at")?,
        completed_at: parse_optional_timestamp(row.get("completed_at"), "completed_at")?,
    })
}

pub async fn insert_analysis(pool: &SqlitePool, analysis: &Analysis) -> Result<()> {
    let analysis_id = analysis.analysis_id.to_string();
    let created_at = analysis.created_at.to_rfc3339();
    let updated_at = analysis.updated_at.to_rfc3339();
    let max_wait_ms = max_lock_wait_ms(pool).await?;

    retry_on_lock("insert_analysis", max_wait_ms, || async {
        sqlx::query(
            r#"
            INSERT INTO analyses (
                analysis_id, original_filename, stored_path, content_sha256, size_bytes,
                state, external_file_id, result_ready, fetch_attempts, last_error,
                created_at, updated_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            "#,
        )
        .bind(&analysis_id)
        .bind(&analysis.original_filename)
        .bind(&analysis.stored_path)
        .bind(&analysis.content_sha256)
        .bind(analysis.size_bytes)
        .bind(analysis.state.as_str())
        .bind(&analysis.external_file_id)
        .bind(analysis.result_ready as i64)
        .bind(analysis.fetch_attempts as i64)
        .bind(&analysis.last_error)
        .bind(&created_at)
        .bind(&updated_at)
        .execute(pool)
        .await?;
        Ok(())
    })
    .await
}

pub async fn load_analysis(pool: &SqlitePool, analysis_id: Uuid) -> Result<Option<Analysis>> {
    let row = sqlx::query(&format!("SELECT {} FROM analyses WHERE analysis_id = ?", COLUMNS))
        .bind(analysis_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_analysis).transpose()
}

pub async fn find_by_external_id(
    pool: &SqlitePool,
    external_file_id: &str,
) -> Result<Option<Analysis>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM analyses WHERE external_file_id = ?",
        COLUMNS
    ))
    .bind(external_file_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_analysis).transpose()
}

/// Most recent completed analysis with identical content
pub async fn find_completed_by_sha256(
    pool: &SqlitePool,
    content_sha256: &str,
) -> Result<Option<Analysis>> {
    let row = sqlx::query(&format!(
        r#"
        SELECT {} FROM analyses
        WHERE content_sha256 = ? AND state = 'completed'
        ORDER BY completed_at DESC
        LIMIT 1
        "#,
        COLUMNS
    ))
    .bind(content_sha256)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_analysis).transpose()
}

/// Newest first, optionally filtered by state
pub async fn list_analyses(
    pool: &SqlitePool,
    state: Option<AnalysisState>,
    limit: u32,
) -> Result<Vec<Analysis>> {
    let rows = match state {
        Some(state) => {
            sqlx::query(&format!(
                "SELECT {} FROM analyses WHERE state = ? ORDER BY created_at DESC LIMIT ?",
                COLUMNS
            ))
            .bind(state.as_str())
            .bind(limit as i64)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(&format!(
                "SELECT {} FROM analyses ORDER BY created_at DESC LIMIT ?",
                COLUMNS
            ))
            .bind(limit as i64)
            .fetch_all(pool)
            .await?
        }
    };

    rows.iter().map(row_to_analysis).collect()
}

/// Analyses a restarted process must pick back up
///
/// `Uploaded` rows were never submitted; `Processing` rows with a ready
/// result were waiting on a fetch job that died with the process.
pub async fn list_recoverable(pool: &SqlitePool) -> Result<Vec<Analysis>> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {} FROM analyses
        WHERE state = 'uploaded' OR (state = 'processing' AND result_ready = 1)
        ORDER BY created_at
        "#,
        COLUMNS
    ))
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_analysis).collect()
}

/// Write `updated` only if the row still matches `previous`
///
/// Returns false when another writer got there first.
pub async fn compare_and_set(
    pool: &SqlitePool,
    previous: &Analysis,
    updated: &Analysis,
) -> Result<bool> {
    let analysis_id = previous.analysis_id.to_string();
    let updated_at = Utc::now().to_rfc3339();
    let completed_at = updated.completed_at.map(|dt| dt.to_rfc3339());
    let max_wait_ms = max_lock_wait_ms(pool).await?;

    let rows = retry_on_lock("compare_and_set_analysis", max_wait_ms, || async {
        let result = sqlx::query(
            r#"
            UPDATE analyses SET
                state = ?,
                external_file_id = ?,
                result_ready = ?,
                fetch_attempts = ?,
                last_error = ?,
                updated_at = ?,
                completed_at = ?
            WHERE analysis_id = ? AND state = ? AND result_ready = ?
            "#,
        )
        .bind(updated.state.as_str())
        .bind(&updated.external_file_id)
        .bind(updated.result_ready as i64)
        .bind(updated.fetch_attempts as i64)
        .bind(&updated.last_error)
        .bind(&updated_at)
        .bind(&completed_at)
        .bind(&analysis_id)
        .bind(previous.state.as_str())
        .bind(previous.result_ready as i64)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    })
    .await?;

    Ok(rows == 1)
}

/// Count one fetch attempt; returns the new total
pub async fn record_fetch_attempt(pool: &SqlitePool, analysis_id: Uuid) -> Result<u32> {
    let analysis_id = analysis_id.to_string();
    let updated_at = Utc::now().to_rfc3339();
    let max_wait_ms = max_lock_wait_ms(pool).await?;

    let attempts: i64 = retry_on_lock("record_fetch_attempt", max_wait_ms, || async {
        let attempts = sqlx::query_scalar(
            r#"
            UPDATE analyses SET fetch_attempts = fetch_attempts + 1, updated_at = ?
            WHERE analysis_id = ?
            RETURNING fetch_attempts
            "#,
        )
        .bind(&updated_at)
        .bind(&analysis_id)
        .fetch_one(pool)
        .await?;
        Ok(attempts)
    })
    .await?;

    Ok(attempts.max(0) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::memory_pool;

    fn sample(sha: &str) -> Analysis {
        Analysis::new("clip.mp3".into(), "/tmp/clip.mp3".into(), sha.into(), 1024)
    }

    #[tokio::test]
    async fn test_insert_and_load() {
        let pool = memory_pool().await;
        let analysis = sample("abc");
        insert_analysis(&pool, &analysis).await.unwrap();

        let loaded = load_analysis(&pool, analysis.analysis_id).await.unwrap().unwrap();
        assert_eq!(loaded.state, AnalysisState::Uploaded);
        assert_eq!(loaded.original_filename, "clip.mp3");
        assert!(!loaded.result_ready);
        assert!(load_analysis(&pool, Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compare_and_set_rejects_stale_writer() {
        let pool = memory_pool().await;
        let analysis = sample("abc");
        insert_analysis(&pool, &analysis).await.unwrap();

        let mut submitted = analysis.clone();
        submitted.state = AnalysisState::Submitted;
        submitted.external_file_id = Some("ext-1".into());
        assert!(compare_and_set(&pool, &analysis, &submitted).await.unwrap());

        // Second writer still holds the Uploaded snapshot
        let mut failed = analysis.clone();
        failed.state = AnalysisState::Failed;
        assert!(!compare_and_set(&pool, &analysis, &failed).await.unwrap());

        let found = find_by_external_id(&pool, "ext-1").await.unwrap().unwrap();
        assert_eq!(found.state, AnalysisState::Submitted);
    }

    #[tokio::test]
    async fn test_find_completed_by_sha() {
        let pool = memory_pool().await;
        let analysis = sample("same");
        insert_analysis(&pool, &analysis).await.unwrap();
        assert!(find_completed_by_sha256(&pool, "same").await.unwrap().is_none());

        let mut done = analysis.clone();
        done.state = AnalysisState::Completed;
        done.completed_at = Some(Utc::now());
        compare_and_set(&pool, &analysis, &done).await.unwrap();

        let found = find_completed_by_sha256(&pool, "same").await.unwrap().unwrap();
        assert_eq!(found.analysis_id, analysis.analysis_id);
        assert!(found.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_list_and_recoverable() {
        let pool = memory_pool().await;
        let uploaded = sample("a");
        let ready = sample("b");
        insert_analysis(&pool, &uploaded).await.unwrap();
        insert_analysis(&pool, &ready).await.unwrap();

        let mut processing = ready.clone();
        processing.state = AnalysisState::Processing;
        processing.result_ready = true;
        compare_and_set(&pool, &ready, &processing).await.unwrap();

        assert_eq!(list_analyses(&pool, None, 10).await.unwrap().len(), 2);
        assert_eq!(
            list_analyses(&pool, Some(AnalysisState::Processing), 10).await.unwrap().len(),
            1
        );
        assert_eq!(list_analyses(&pool, None, 1).await.unwrap().len(), 1);
        assert_eq!(list_recoverable(&pool).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_record_fetch_attempt_increments() {
        let pool = memory_pool().await;
        let analysis = sample("a");
        insert_analysis(&pool, &analysis).await.unwrap();
        assert_eq!(record_fetch_attempt(&pool, analysis.analysis_id).await.unwrap(), 1);
        assert_eq!(record_fetch_attempt(&pool, analysis.analysis_id).await.unwrap(), 2);
    }
}
