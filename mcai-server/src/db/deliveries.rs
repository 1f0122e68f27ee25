//! Webhook delivery log
//!
//! Every authenticated callback is recorded with what became of it. A
//! callback can overtake the upload response that assigns its file id; such
//! deliveries are stored as `pending` and replayed once the submission is
//! persisted.

use crate::utils::{db_retry::max_lock_wait_ms, retry_on_lock};
use chrono::{DateTime, Utc};
use mcai_common::Result;
use serde::Serialize;
use serde_json::Value;
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryOutcome {
    Applied,
    Ignored,
    Rejected,
    /// File id not yet known
    Pending,
    /// Pending delivery applied after submission
    Replayed,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Applied => "applied",
            DeliveryOutcome::Ignored => "ignored",
            DeliveryOutcome::Rejected => "rejected",
            DeliveryOutcome::Pending => "pending",
            DeliveryOutcome::Replayed => "replayed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub delivery_id: i64,
    pub payload: Value,
}

pub async fn record_delivery(
    pool: &SqlitePool,
    external_file_id: &str,
    status: &str,
    payload: &Value,
    outcome: DeliveryOutcome,
) -> Result<i64> {
    let payload = payload.to_string();
    let received_at = Utc::now().to_rfc3339();
    let max_wait_ms = max_lock_wait_ms(pool).await?;

    retry_on_lock("record_delivery", max_wait_ms, || async {
        let result = sqlx::query(
            r#"
            INSERT INTO webhook_deliveries (external_file_id, status, payload, outcome, received_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(external_file_id)
        .bind(status)
        .bind(&payload)
        .bind(outcome.as_str())
        .bind(&received_at)
        .execute(pool)
        .await?;
        Ok(result.last_insert_rowid())
    })
    .await
}

/// Pending deliveries for a file id, oldest first
pub async fn pending_for(pool: &SqlitePool, external_file_id: &str) -> Result<Vec<PendingDelivery>> {
    let rows = sqlx::query(
        r#"
        SELECT delivery_id, payload FROM webhook_deliveries
        WHERE external_file_id = ? AND outcome = 'pending'
        ORDER BY delivery_id
        "#,
    )
    .bind(external_file_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let payload: String = row.get("payload");
            Ok(PendingDelivery {
                delivery_id: row.get("delivery_id"),
                payload: serde_json::from_str(&payload)?,
            })
        })
        .collect()
}

/// Take ownership of a pending delivery for replay
///
/// Only one caller wins; the rest see false.
pub async fn claim_pending(pool: &SqlitePool, delivery_id: i64) -> Result<bool> {
    let max_wait_ms = max_lock_wait_ms(pool).await?;

    let rows = retry_on_lock("claim_pending_delivery", max_wait_ms, || async {
        let result = sqlx::query(
            "UPDATE webhook_deliveries SET outcome = 'replayed' WHERE delivery_id = ? AND outcome = 'pending'",
        )
        .bind(delivery_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    })
    .await?;

    Ok(rows == 1)
}

/// Drop pending deliveries received before `cutoff`; returns rows removed
///
/// A file id that has not matched an analysis by then never will.
pub async fn prune_pending(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64> {
    let cutoff = cutoff.to_rfc3339();
    let max_wait_ms = max_lock_wait_ms(pool).await?;

    retry_on_lock("prune_pending_deliveries", max_wait_ms, || async {
        let result = sqlx::query(
            "DELETE FROM webhook_deliveries WHERE outcome = 'pending' AND received_at < ?",
        )
        .bind(&cutoff)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    })
    .await
}
