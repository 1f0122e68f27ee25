//! Webhook-driven analysis pipeline
//!
//! upload → submit job → (callback) → fetch job → report. Every state change
//! goes through [`AnalysisPipeline::apply`], which evaluates the transition
//! table against the stored record and writes with compare-and-set, so
//! duplicate, late and concurrent deliveries settle on one outcome.

use crate::db::{analyses, deliveries, reports};
use crate::db::deliveries::DeliveryOutcome;
use crate::models::{apply_event, Analysis, AnalysisReport, Effect, PipelineEvent, Transition};
use crate::normalize::acrcloud::{parse_callback, parse_file_result, CallbackStatus};
use crate::normalize::NormalizeError;
use crate::services::acrcloud_client::{AcrCloudError, FingerprintService};
use crate::services::job_queue::{Job, JobQueue};
use crate::utils::{RetryError, RetryPolicy};
use chrono::Utc;
use mcai_common::events::{AnalysisState, EventBus, McaiEvent};
use mcai_common::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_MATCH_SCORE_THRESHOLD: f64 = 80.0;

/// Concurrent writers can make a CAS miss; re-evaluate this many times
const MAX_CAS_ATTEMPTS: u32 = 5;

/// Pending deliveries older than this are dropped
const PENDING_DELIVERY_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub uploads_dir: PathBuf,
    pub fetch_retry: RetryPolicy,
    pub submit_retry: RetryPolicy,
    pub match_score_threshold: f64,
}

/// Result of accepting an upload
#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub analysis: Analysis,
    /// Identical content was already analyzed; no new submission
    pub deduplicated: bool,
}

/// What became of a webhook delivery
#[derive(Debug, Clone, Serialize)]
pub struct WebhookAck {
    pub external_file_id: String,
    pub outcome: DeliveryOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<AnalysisState>,
}

pub struct AnalysisPipeline {
    db: SqlitePool,
    fingerprint: Arc<dyn FingerprintService>,
    jobs: JobQueue,
    event_bus: EventBus,
    settings: PipelineSettings,
}

fn callback_event(status: &CallbackStatus) -> PipelineEvent {
    match status {
        CallbackStatus::Processing => PipelineEvent::CallbackProcessing,
        // No result is still a result: fetched and reported as no match
        CallbackStatus::Ready | CallbackStatus::NoResult => PipelineEvent::CallbackReady,
        CallbackStatus::Failed(reason) => PipelineEvent::CallbackFailed {
            reason: reason.clone(),
        },
    }
}

/// Record after an applied transition
fn updated_record(previous: &Analysis, event: &PipelineEvent, to: AnalysisState, ready: bool) -> Analysis {
    let mut updated = previous.clone();
    updated.state = to;
    updated.result_ready = ready;

    match event {
        PipelineEvent::SubmitSucceeded { external_file_id } => {
            updated.external_file_id = Some(external_file_id.clone());
            updated.last_error = None;
        }
        PipelineEvent::RetryRequested => {
            updated.fetch_attempts = 0;
            updated.last_error = None;
            updated.completed_at = None;
        }
        other => {
            if let Some(reason) = other.failure_reason() {
                updated.last_error = Some(reason.to_string());
            }
        }
    }

    if to == AnalysisState::Completed {
        updated.completed_at = Some(Utc::now());
    }
    updated
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

impl AnalysisPipeline {
    pub fn new(
        db: SqlitePool,
        fingerprint: Arc<dyn FingerprintService>,
        jobs: JobQueue,
        event_bus: EventBus,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            db,
            fingerprint,
            jobs,
            event_bus,
            settings,
        }
    }

    /// Accept an uploaded file
    ///
    /// Content must sniff as audio. Content identical to a completed
    /// analysis returns that analysis instead of resubmitting.
    pub async fn upload(&self, original_filename: &str, bytes: Vec<u8>) -> Result<UploadOutcome> {
        if bytes.is_empty() {
            return Err(Error::InvalidInput("uploaded file is empty".to_string()));
        }

        let kind = infer::get(&bytes)
            .filter(|k| k.matcher_type() == infer::MatcherType::Audio)
            .ok_or_else(|| {
                Error::InvalidInput(format!("{} is not a recognized audio file", original_filename))
            })?;

        let sha = sha256_hex(&bytes);
        if let Some(existing) = analyses::find_completed_by_sha256(&self.db, &sha).await? {
            info!(
                analysis_id = %existing.analysis_id,
                sha256 = %sha,
                "Upload matches a completed analysis, reusing it"
            );
            return Ok(UploadOutcome {
                analysis: existing,
                deduplicated: true,
            });
        }

        let analysis_id = Uuid::new_v4();
        tokio::fs::create_dir_all(&self.settings.uploads_dir).await?;
        let stored_path = self
            .settings
            .uploads_dir
            .join(format!("{}.{}", analysis_id, kind.extension()));
        tokio::fs::write(&stored_path, &bytes).await?;

        let mut analysis = Analysis::new(
            original_filename.to_string(),
            stored_path.display().to_string(),
            sha,
            bytes.len() as i64,
        );
        analysis.analysis_id = analysis_id;

        if let Err(e) = analyses::insert_analysis(&self.db, &analysis).await {
            let _ = tokio::fs::remove_file(&stored_path).await;
            return Err(e);
        }

        info!(
            analysis_id = %analysis.analysis_id,
            filename = %analysis.original_filename,
            mime = kind.mime_type(),
            size_bytes = analysis.size_bytes,
            "Upload accepted"
        );
        self.event_bus.emit_lossy(McaiEvent::AnalysisCreated {
            analysis_id: analysis.analysis_id,
            original_filename: analysis.original_filename.clone(),
            timestamp: Utc::now(),
        });
        self.enqueue(Job::SubmitAnalysis(analysis.analysis_id)).await;

        Ok(UploadOutcome {
            analysis,
            deduplicated: false,
        })
    }

    async fn enqueue(&self, job: Job) {
        // Work left behind here is picked up by startup recovery
        if let Err(e) = self.jobs.enqueue(job).await {
            warn!(job = job.name(), target = %job.target(), error = %e, "Failed to enqueue job");
        }
    }

    /// Apply an event to an analysis
    ///
    /// A successful submission also replays callbacks that arrived before
    /// the file id was stored.
    pub async fn apply(&self, analysis_id: Uuid, event: PipelineEvent) -> Result<Transition> {
        let transition = self.apply_once(analysis_id, &event).await?;

        if let (PipelineEvent::SubmitSucceeded { external_file_id }, true) =
            (&event, transition.is_applied())
        {
            self.replay_pending(external_file_id).await?;
        }
        Ok(transition)
    }

    async fn apply_once(&self, analysis_id: Uuid, event: &PipelineEvent) -> Result<Transition> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = analyses::load_analysis(&self.db, analysis_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("analysis {}", analysis_id)))?;

            let transition = apply_event(&current, event);
            let Transition::Applied {
                from,
                to,
                result_ready,
                effect,
            } = transition
            else {
                debug!(
                    analysis_id = %analysis_id,
                    event = event.name(),
                    transition = ?transition,
                    "Event not applied"
                );
                return Ok(transition);
            };

            let updated = updated_record(&current, event, to, result_ready);
            if !analyses::compare_and_set(&self.db, &current, &updated).await? {
                debug!(analysis_id = %analysis_id, event = event.name(), "State moved underneath, re-evaluating");
                continue;
            }

            info!(
                analysis_id = %analysis_id,
                event = event.name(),
                from = %from,
                to = %to,
                result_ready,
                "Analysis transition applied"
            );
            if to == AnalysisState::Failed {
                warn!(analysis_id = %analysis_id, error = ?updated.last_error, "Analysis failed");
            }

            self.event_bus.emit_lossy(McaiEvent::AnalysisStateChanged {
                analysis_id,
                old_state: from,
                new_state: to,
                error: updated.last_error.clone().filter(|_| to == AnalysisState::Failed),
                timestamp: Utc::now(),
            });

            match effect {
                Some(Effect::EnqueueSubmit) => self.enqueue(Job::SubmitAnalysis(analysis_id)).await,
                Some(Effect::EnqueueFetch) => {
                    self.enqueue(Job::FetchAnalysisResult(analysis_id)).await
                }
                None => {}
            }
            return Ok(transition);
        }

        Err(Error::Internal(format!(
            "analysis {} changed {} times while applying {}",
            analysis_id,
            MAX_CAS_ATTEMPTS,
            event.name()
        )))
    }

    /// Handle an authenticated callback
    pub async fn handle_webhook(&self, payload: &Value) -> Result<WebhookAck> {
        let notice = parse_callback(payload).map_err(|e: NormalizeError| {
            Error::InvalidInput(format!("callback payload rejected: {}", e))
        })?;
        let status = notice.status.as_str();
        let external_file_id = notice.external_file_id.clone();

        let Some(analysis) = analyses::find_by_external_id(&self.db, &external_file_id).await? else {
            let delivery_id = deliveries::record_delivery(
                &self.db,
                &external_file_id,
                status,
                payload,
                DeliveryOutcome::Pending,
            )
            .await?;
            info!(external_file_id = %external_file_id, status, "Callback for unknown file id held as pending");
            if let Err(e) = self.prune_stale_deliveries().await {
                warn!(error = %e, "Failed to prune stale pending deliveries");
            }

            // The submission may have landed between the lookup and the insert
            if analyses::find_by_external_id(&self.db, &external_file_id).await?.is_some() {
                self.replay_one(delivery_id, payload).await?;
            }
            return Ok(WebhookAck {
                external_file_id,
                outcome: DeliveryOutcome::Pending,
                analysis_id: None,
                state: None,
            });
        };

        let transition = self.apply_once(analysis.analysis_id, &callback_event(&notice.status)).await?;
        let (outcome, state) = match &transition {
            Transition::Applied { to, .. } => (DeliveryOutcome::Applied, *to),
            Transition::Ignored { state, .. } => (DeliveryOutcome::Ignored, *state),
            Transition::Rejected { state, .. } => (DeliveryOutcome::Rejected, *state),
        };
        deliveries::record_delivery(&self.db, &external_file_id, status, payload, outcome).await?;

        Ok(WebhookAck {
            external_file_id,
            outcome,
            analysis_id: Some(analysis.analysis_id),
            state: Some(state),
        })
    }

    async fn replay_pending(&self, external_file_id: &str) -> Result<()> {
        for pending in deliveries::pending_for(&self.db, external_file_id).await? {
            self.replay_one(pending.delivery_id, &pending.payload).await?;
        }
        Ok(())
    }

    async fn replay_one(&self, delivery_id: i64, payload: &Value) -> Result<()> {
        if !deliveries::claim_pending(&self.db, delivery_id).await? {
            return Ok(());
        }

        let notice = match parse_callback(payload) {
            Ok(notice) => notice,
            Err(e) => {
                warn!(delivery_id, error = %e, "Stored callback no longer parses");
                return Ok(());
            }
        };
        let Some(analysis) = analyses::find_by_external_id(&self.db, &notice.external_file_id).await?
        else {
            return Ok(());
        };

        let transition = self
            .apply_once(analysis.analysis_id, &callback_event(&notice.status))
            .await?;
        info!(
            delivery_id,
            analysis_id = %analysis.analysis_id,
            transition = ?transition,
            "Replayed early callback"
        );
        Ok(())
    }

    /// Submit job
    pub async fn submit(&self, analysis_id: Uuid, cancel: &CancellationToken) {
        if let Err(e) = self.try_submit(analysis_id, cancel).await {
            error!(analysis_id = %analysis_id, error = %e, "Submit job failed");
            self.fail_quietly(analysis_id, PipelineEvent::SubmitFailed { reason: e.to_string() })
                .await;
        }
    }

    async fn try_submit(&self, analysis_id: Uuid, cancel: &CancellationToken) -> Result<()> {
        let Some(analysis) = analyses::load_analysis(&self.db, analysis_id).await? else {
            warn!(analysis_id = %analysis_id, "Submit job for unknown analysis");
            return Ok(());
        };
        if analysis.state != AnalysisState::Uploaded {
            debug!(analysis_id = %analysis_id, state = %analysis.state, "Already submitted, skipping");
            return Ok(());
        }

        let bytes = match tokio::fs::read(&analysis.stored_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let reason = format!("stored upload unreadable: {}", e);
                self.apply(analysis_id, PipelineEvent::SubmitFailed { reason }).await?;
                return Ok(());
            }
        };

        let result = self
            .settings
            .submit_retry
            .run("acrcloud_upload", cancel, AcrCloudError::is_transient, |_| {
                self.fingerprint
                    .upload(&analysis.original_filename, bytes.clone())
            })
            .await;

        let event = match result {
            Ok(external_file_id) => PipelineEvent::SubmitSucceeded { external_file_id },
            Err(RetryError::Cancelled { .. }) => {
                info!(analysis_id = %analysis_id, "Submit interrupted by shutdown");
                return Ok(());
            }
            Err(e) => PipelineEvent::SubmitFailed { reason: e.describe() },
        };
        self.apply(analysis_id, event).await?;
        Ok(())
    }

    /// Fetch job
    pub async fn fetch_result(&self, analysis_id: Uuid, cancel: &CancellationToken) {
        if let Err(e) = self.try_fetch_result(analysis_id, cancel).await {
            error!(analysis_id = %analysis_id, error = %e, "Fetch job failed");
            self.fail_quietly(analysis_id, PipelineEvent::FetchFailed { reason: e.to_string() })
                .await;
        }
    }

    async fn try_fetch_result(&self, analysis_id: Uuid, cancel: &CancellationToken) -> Result<()> {
        let Some(analysis) = analyses::load_analysis(&self.db, analysis_id).await? else {
            warn!(analysis_id = %analysis_id, "Fetch job for unknown analysis");
            return Ok(());
        };
        if analysis.state != AnalysisState::Processing || !analysis.result_ready {
            debug!(
                analysis_id = %analysis_id,
                state = %analysis.state,
                result_ready = analysis.result_ready,
                "Result not fetchable, skipping"
            );
            return Ok(());
        }
        let Some(external_file_id) = analysis.external_file_id.clone() else {
            let reason = "analysis has no external file id".to_string();
            self.apply(analysis_id, PipelineEvent::FetchFailed { reason }).await?;
            return Ok(());
        };

        let result = self
            .settings
            .fetch_retry
            .run("acrcloud_fetch", cancel, AcrCloudError::is_transient, |attempt| {
                let external_file_id = external_file_id.clone();
                async move {
                    if let Err(e) = analyses::record_fetch_attempt(&self.db, analysis_id).await {
                        warn!(analysis_id = %analysis_id, attempt, error = %e, "Failed to count fetch attempt");
                    }
                    self.fingerprint.fetch_result(&external_file_id).await
                }
            })
            .await;

        let body = match result {
            Ok(body) => body,
            Err(RetryError::Cancelled { .. }) => {
                info!(analysis_id = %analysis_id, "Fetch interrupted by shutdown");
                return Ok(());
            }
            Err(e) => {
                self.apply(analysis_id, PipelineEvent::FetchFailed { reason: e.describe() })
                    .await?;
                return Ok(());
            }
        };

        let matches = match parse_file_result(&body) {
            Ok(matches) => matches,
            Err(e) => {
                let reason = format!("unusable result payload: {}", e);
                self.apply(analysis_id, PipelineEvent::FetchFailed { reason }).await?;
                return Ok(());
            }
        };

        let report = AnalysisReport::from_matches(matches, self.settings.match_score_threshold);
        reports::save_report(&self.db, analysis_id, &report, &body).await?;
        info!(
            analysis_id = %analysis_id,
            verdict = report.verdict.as_str(),
            matches = report.matches.len(),
            top_score = ?report.top_score,
            "Report stored"
        );

        self.apply(analysis_id, PipelineEvent::FetchSucceeded).await?;
        Ok(())
    }

    /// Last resort when a job hit an internal error
    async fn fail_quietly(&self, analysis_id: Uuid, event: PipelineEvent) {
        if let Err(e) = self.apply(analysis_id, event).await {
            error!(analysis_id = %analysis_id, error = %e, "Could not record failure");
        }
    }

    /// Manual retry of a failed analysis
    pub async fn retry(&self, analysis_id: Uuid) -> Result<Transition> {
        self.apply(analysis_id, PipelineEvent::RetryRequested).await
    }

    /// Forget pending deliveries that never matched a submission
    pub async fn prune_stale_deliveries(&self) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(PENDING_DELIVERY_RETENTION_DAYS);
        let removed = deliveries::prune_pending(&self.db, cutoff).await?;
        if removed > 0 {
            info!(removed, "Pruned stale pending deliveries");
        }
        Ok(removed)
    }

    /// Re-enqueue work interrupted by a restart; returns jobs enqueued
    pub async fn recover(&self) -> Result<usize> {
        let recoverable = analyses::list_recoverable(&self.db).await?;
        for analysis in &recoverable {
            let job = if analysis.state == AnalysisState::Uploaded {
                Job::SubmitAnalysis(analysis.analysis_id)
            } else {
                Job::FetchAnalysisResult(analysis.analysis_id)
            };
            self.enqueue(job).await;
        }
        if !recoverable.is_empty() {
            info!(count = recoverable.len(), "Re-enqueued interrupted analyses");
        }
        Ok(recoverable.len())
    }
}
