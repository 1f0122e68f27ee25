//! Cascade fetch: chart → tracks → artists → audience
//!
//! Stages run sequentially; within a stage, entities are fetched in batches
//! through the rate-limited [`ChartDataSource`]. Losing one track or artist
//! is counted and logged, losing the ranking itself fails the run. Counters
//! are persisted after every batch so `/cascade/{run_id}` shows progress.

use crate::db::{artists, cascade_runs, charts, tracks};
use crate::models::{CascadeRun, Chart};
use crate::normalize::soundcharts::{parse_artist, parse_audience, parse_ranking_page, parse_song};
use crate::services::job_queue::{Job, JobQueue};
use crate::services::soundcharts_client::{ChartDataSource, SoundchartsError};
use crate::utils::{RetryError, RetryPolicy};
use chrono::Utc;
use mcai_common::events::{CascadeRunState, CascadeStage, EventBus, McaiEvent};
use mcai_common::{Error, Result};
use serde_json::Value;
use sqlx::SqlitePool;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_AUDIENCE_PLATFORM: &str = "spotify";
pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const RANKING_PAGE_SIZE: usize = 100;
/// Upper bound on entries read from one ranking
pub const MAX_RANKING_ENTRIES: usize = 1000;

#[derive(Debug, Clone)]
pub struct CascadeSettings {
    pub batch_size: usize,
    pub audience_platform: String,
    pub retry: RetryPolicy,
}

/// Why a run stopped early
#[derive(Debug)]
enum Abort {
    Cancelled,
    Failed(String),
}

impl From<Error> for Abort {
    fn from(err: Error) -> Self {
        Abort::Failed(err.to_string())
    }
}

pub struct CascadeFetcher {
    db: SqlitePool,
    source: Arc<dyn ChartDataSource>,
    jobs: JobQueue,
    event_bus: EventBus,
    settings: CascadeSettings,
}

impl CascadeFetcher {
    pub fn new(
        db: SqlitePool,
        source: Arc<dyn ChartDataSource>,
        jobs: JobQueue,
        event_bus: EventBus,
        settings: CascadeSettings,
    ) -> Self {
        Self {
            db,
            source,
            jobs,
            event_bus,
            settings,
        }
    }

    /// Record a new run and queue it
    pub async fn start(&self, chart_id: Uuid, stop_after: CascadeStage) -> Result<CascadeRun> {
        let mut run = CascadeRun::new(chart_id, stop_after);
        cascade_runs::save_run(&self.db, &run).await.map_err(|e| {
            if e.is_unique_violation() {
                Error::Conflict(format!(
                    "A cascade run is already in progress for chart {}",
                    chart_id
                ))
            } else {
                e
            }
        })?;

        if let Err(e) = self.jobs.enqueue(Job::RunCascade(run.run_id)).await {
            run.state = CascadeRunState::Failed;
            run.ended_at = Some(Utc::now());
            run.error = Some(e.to_string());
            cascade_runs::save_run(&self.db, &run).await?;
            return Err(Error::Internal(format!("cascade run not queued: {}", e)));
        }

        info!(run_id = %run.run_id, chart_id = %chart_id, stop_after = stop_after.as_str(), "Cascade run queued");
        Ok(run)
    }

    /// Runs left `running` by a previous process can never finish
    pub async fn fail_interrupted(&self) -> Result<u64> {
        let count = cascade_runs::fail_interrupted_runs(&self.db, "interrupted by service restart").await?;
        if count > 0 {
            warn!(count, "Marked interrupted cascade runs as failed");
        }
        Ok(count)
    }

    /// Job entry point
    pub async fn run(&self, run_id: Uuid, cancel: &CancellationToken) {
        let mut run = match cascade_runs::load_run(&self.db, run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                warn!(run_id = %run_id, "Cascade job for unknown run");
                return;
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Failed to load cascade run");
                return;
            }
        };
        if run.state != CascadeRunState::Running {
            debug!(run_id = %run_id, state = run.state.as_str(), "Cascade run already finished");
            return;
        }

        let outcome = match charts::get_chart(&self.db, run.chart_id).await {
            Ok(Some(chart)) => self.execute(&mut run, &chart, cancel).await,
            Ok(None) => Err(Abort::Failed("chart no longer exists".to_string())),
            Err(e) => Err(Abort::from(e)),
        };

        match outcome {
            Ok(()) => run.state = CascadeRunState::Completed,
            Err(Abort::Cancelled) => {
                run.state = CascadeRunState::Failed;
                run.error = Some("cancelled by shutdown".to_string());
            }
            Err(Abort::Failed(reason)) => {
                run.state = CascadeRunState::Failed;
                run.error = Some(reason);
            }
        }
        run.ended_at = Some(Utc::now());

        if let Err(e) = cascade_runs::save_run(&self.db, &run).await {
            error!(run_id = %run.run_id, error = %e, "Failed to persist cascade outcome");
        }

        match run.state {
            CascadeRunState::Completed => info!(
                run_id = %run.run_id,
                counters = ?run.counters,
                "Cascade run completed"
            ),
            _ => warn!(run_id = %run.run_id, error = ?run.error, counters = ?run.counters, "Cascade run failed"),
        }

        self.event_bus.emit_lossy(McaiEvent::CascadeFinished {
            run_id: run.run_id,
            chart_id: run.chart_id,
            state: run.state,
            error: run.error.clone(),
            timestamp: Utc::now(),
        });
    }

    async fn execute(
        &self,
        run: &mut CascadeRun,
        chart: &Chart,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Abort> {
        info!(run_id = %run.run_id, slug = %chart.slug, "Cascade: fetching ranking");
        self.fetch_ranking(run, chart, cancel).await?;
        if !run.includes(CascadeStage::Tracks) {
            return Ok(());
        }

        let track_uuids = tracks::latest_chart_track_uuids(&self.db, chart.chart_id).await?;
        info!(run_id = %run.run_id, tracks = track_uuids.len(), "Cascade: fetching tracks");
        self.fetch_tracks(run, &track_uuids, cancel).await?;
        if !run.includes(CascadeStage::Artists) {
            return Ok(());
        }

        let artist_uuids = tracks::artists_for_tracks(&self.db, &track_uuids).await?;
        info!(run_id = %run.run_id, artists = artist_uuids.len(), "Cascade: fetching artists");
        self.fetch_artists(run, &artist_uuids, cancel).await?;
        if !run.includes(CascadeStage::Audience) {
            return Ok(());
        }

        info!(
            run_id = %run.run_id,
            platform = %self.settings.audience_platform,
            "Cascade: fetching audience"
        );
        self.fetch_audience(run, &artist_uuids, cancel).await
    }

    /// One upstream call under the retry policy
    ///
    /// `Ok(None)` means the entity is lost (already logged).
    async fn call<F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> std::result::Result<Option<Value>, Abort>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<Value, SoundchartsError>>,
    {
        match self
            .settings
            .retry
            .run(what, cancel, SoundchartsError::is_transient, operation)
            .await
        {
            Ok(value) => Ok(Some(value)),
            Err(RetryError::Cancelled { .. }) => Err(Abort::Cancelled),
            Err(e) => {
                warn!(operation = what, error = %e.describe(), "Upstream call failed");
                Ok(None)
            }
        }
    }

    async fn fetch_ranking(
        &self,
        run: &mut CascadeRun,
        chart: &Chart,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Abort> {
        let mut items = Vec::new();
        let mut offset = 0;

        loop {
            let body = self
                .call("soundcharts_ranking", cancel, |_| {
                    self.source.chart_ranking(&chart.slug, offset, RANKING_PAGE_SIZE)
                })
                .await?
                .ok_or_else(|| Abort::Failed(format!("ranking for {} unavailable", chart.slug)))?;

            let page = parse_ranking_page(&body, offset);
            items.extend(page.entries);

            match page.next_offset {
                Some(next) if next > offset && items.len() < MAX_RANKING_ENTRIES => offset = next,
                _ => break,
            }
        }

        // Positions repeat across malformed pages; keep the first
        let mut seen = std::collections::HashSet::new();
        items.retain(|item| seen.insert(item.position));

        charts::save_ranking(&self.db, chart.chart_id, Utc::now(), &items).await?;
        run.counters.entries = items.len();
        self.progress(run, CascadeStage::Chart, items.len(), items.len()).await;
        Ok(())
    }

    async fn fetch_tracks(
        &self,
        run: &mut CascadeRun,
        track_uuids: &[String],
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Abort> {
        let mut done = 0;
        for batch in track_uuids.chunks(self.settings.batch_size.max(1)) {
            for track_uuid in batch {
                let body = self
                    .call("soundcharts_song", cancel, |_| self.source.song(track_uuid))
                    .await?;
                let stored = match body.map(|b| parse_song(&b)) {
                    Some(Ok(track)) => match tracks::upsert_track(&self.db, &track).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(track_uuid = %track_uuid, error = %e, "Failed to store track");
                            false
                        }
                    },
                    Some(Err(e)) => {
                        warn!(track_uuid = %track_uuid, error = %e, "Unusable song payload");
                        false
                    }
                    None => false,
                };
                if stored {
                    run.counters.tracks_fetched += 1;
                } else {
                    run.counters.tracks_failed += 1;
                }
            }
            done += batch.len();
            self.progress(run, CascadeStage::Tracks, done, track_uuids.len()).await;
        }
        Ok(())
    }

    async fn fetch_artists(
        &self,
        run: &mut CascadeRun,
        artist_uuids: &[String],
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Abort> {
        let mut done = 0;
        for batch in artist_uuids.chunks(self.settings.batch_size.max(1)) {
            for artist_uuid in batch {
                let body = self
                    .call("soundcharts_artist", cancel, |_| self.source.artist(artist_uuid))
                    .await?;
                let stored = match body.map(|b| parse_artist(&b)) {
                    Some(Ok(artist)) => match artists::upsert_artist(&self.db, &artist).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(artist_uuid = %artist_uuid, error = %e, "Failed to store artist");
                            false
                        }
                    },
                    Some(Err(e)) => {
                        warn!(artist_uuid = %artist_uuid, error = %e, "Unusable artist payload");
                        false
                    }
                    None => false,
                };
                if stored {
                    run.counters.artists_fetched += 1;
                } else {
                    run.counters.artists_failed += 1;
                }
            }
            done += batch.len();
            self.progress(run, CascadeStage::Artists, done, artist_uuids.len()).await;
        }
        Ok(())
    }

    async fn fetch_audience(
        &self,
        run: &mut CascadeRun,
        artist_uuids: &[String],
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Abort> {
        let platform = self.settings.audience_platform.as_str();
        let mut done = 0;
        for batch in artist_uuids.chunks(self.settings.batch_size.max(1)) {
            for artist_uuid in batch {
                let body = self
                    .call("soundcharts_audience", cancel, |_| {
                        self.source.audience(artist_uuid, platform)
                    })
                    .await?;
                let Some(body) = body else {
                    run.counters.audience_failed += 1;
                    continue;
                };
                let snapshots = parse_audience(&body, artist_uuid, platform);
                match artists::save_audience(&self.db, &snapshots).await {
                    Ok(written) => run.counters.audience_snapshots += written,
                    Err(e) => {
                        warn!(artist_uuid = %artist_uuid, error = %e, "Failed to store audience");
                        run.counters.audience_failed += 1;
                    }
                }
            }
            done += batch.len();
            self.progress(run, CascadeStage::Audience, done, artist_uuids.len()).await;
        }
        Ok(())
    }

    /// Persist counters and announce progress
    async fn progress(&self, run: &CascadeRun, stage: CascadeStage, current: usize, total: usize) {
        if let Err(e) = cascade_runs::save_run(&self.db, run).await {
            warn!(run_id = %run.run_id, error = %e, "Failed to persist cascade progress");
        }
        self.event_bus.emit_lossy(McaiEvent::CascadeProgress {
            run_id: run.run_id,
            chart_id: run.chart_id,
            stage,
            current,
            total,
            timestamp: Utc::now(),
        });
    }
}
