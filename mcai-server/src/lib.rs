//! mcai-server library interface
//!
//! Exposes the router, shared state and service assembly so integration
//! tests can drive the HTTP surface with stubbed third parties.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod normalize;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use crate::config::ServiceConfig;
use crate::services::{
    AnalysisPipeline, CascadeFetcher, ChartDataSource, FingerprintService, JobDispatcher,
    JobQueue, JobWorker,
};
use axum::extract::DefaultBodyLimit;
use axum::Router;
use chrono::{DateTime, Utc};
use mcai_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub event_bus: EventBus,
    pub pipeline: Arc<AnalysisPipeline>,
    pub cascade: Arc<CascadeFetcher>,
    pub jobs: JobQueue,
    /// Token the fingerprinting service must present on callbacks
    pub webhook_token: Option<String>,
    pub max_upload_bytes: usize,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last error for diagnostic purposes
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub async fn record_error(&self, message: impl Into<String>) {
        *self.last_error.write().await = Some(message.into());
    }
}

/// State plus the worker that must be spawned to process jobs
pub struct Assembled {
    pub state: AppState,
    pub worker: JobWorker,
}

/// Wire pipeline, cascade fetcher, job queue and worker together
pub fn assemble(
    db: SqlitePool,
    event_bus: EventBus,
    fingerprint: Arc<dyn FingerprintService>,
    chart_source: Arc<dyn ChartDataSource>,
    config: &ServiceConfig,
    webhook_token: Option<String>,
    cancel: CancellationToken,
) -> Assembled {
    let (jobs, receiver) = JobQueue::bounded(config.queue_capacity);

    let pipeline = Arc::new(AnalysisPipeline::new(
        db.clone(),
        fingerprint,
        jobs.clone(),
        event_bus.clone(),
        config.pipeline.clone(),
    ));
    let cascade = Arc::new(CascadeFetcher::new(
        db.clone(),
        chart_source,
        jobs.clone(),
        event_bus.clone(),
        config.cascade.clone(),
    ));

    let dispatcher = Arc::new(JobDispatcher::new(pipeline.clone(), cascade.clone()));
    let worker = JobWorker::new(receiver, dispatcher, cancel);

    Assembled {
        state: AppState {
            db,
            event_bus,
            pipeline,
            cascade,
            jobs,
            webhook_token,
            max_upload_bytes: config.max_upload_bytes,
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        },
        worker,
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    let upload_limit = state.max_upload_bytes;

    Router::new()
        .merge(api::health_routes())
        .merge(api::event_routes())
        .merge(
            api::analysis_routes()
                .layer(DefaultBodyLimit::disable())
                .layer(RequestBodyLimitLayer::new(upload_limit)),
        )
        .merge(api::webhook_routes())
        .merge(api::chart_routes())
        .merge(api::catalog_routes())
        .merge(api::report_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
