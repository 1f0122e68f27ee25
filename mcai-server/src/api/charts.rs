//! Tracked charts and cascade fetches

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use mcai_common::events::CascadeStage;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::db::{cascade_runs, charts};
use crate::error::{ApiError, ApiResult};
use crate::models::{is_valid_slug, CascadeRun, Chart, ChartEntry, NewChart};
use crate::AppState;

const RECENT_RUNS: u32 = 20;

#[derive(Debug, Deserialize)]
pub struct FetchQuery {
    /// Last stage to run; defaults to the full cascade
    pub stop_after: Option<CascadeStage>,
}

#[derive(Debug, Serialize)]
pub struct ChartEntriesResponse {
    pub chart: Chart,
    pub entries: Vec<ChartEntry>,
}

async fn require_chart(state: &AppState, chart_id: Uuid) -> ApiResult<Chart> {
    charts::get_chart(&state.db, chart_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Chart {} not found", chart_id)))
}

/// GET /charts
pub async fn list_charts(State(state): State<AppState>) -> ApiResult<Json<Vec<Chart>>> {
    Ok(Json(charts::list_charts(&state.db).await?))
}

/// POST /charts
pub async fn create_chart(
    State(state): State<AppState>,
    Json(request): Json<NewChart>,
) -> ApiResult<(StatusCode, Json<Chart>)> {
    let slug = request.slug.trim();
    if slug.is_empty() {
        return Err(ApiError::BadRequest("Chart slug must not be empty".to_string()));
    }
    if !is_valid_slug(slug) {
        return Err(ApiError::BadRequest(format!(
            "Chart slug '{}' may only contain letters, digits, '-' and '_'",
            slug
        )));
    }
    if request.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Chart name must not be empty".to_string()));
    }

    // Duplicate slugs come back from the insert as a conflict
    let chart = charts::insert_chart(&state.db, &request).await?;
    info!(chart_id = %chart.chart_id, slug = %chart.slug, "Chart added");
    Ok((StatusCode::CREATED, Json(chart)))
}

/// GET /charts/:chart_id
pub async fn get_chart(
    State(state): State<AppState>,
    Path(chart_id): Path<Uuid>,
) -> ApiResult<Json<Chart>> {
    Ok(Json(require_chart(&state, chart_id).await?))
}

/// DELETE /charts/:chart_id
pub async fn delete_chart(
    State(state): State<AppState>,
    Path(chart_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if cascade_runs::has_running_run(&state.db, chart_id).await? {
        return Err(ApiError::Conflict(format!(
            "Chart {} has a cascade run in progress",
            chart_id
        )));
    }
    if !charts::delete_chart(&state.db, chart_id).await? {
        return Err(ApiError::NotFound(format!("Chart {} not found", chart_id)));
    }
    info!(chart_id = %chart_id, "Chart removed");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /charts/:chart_id/entries
///
/// Entries of the most recent ranking snapshot, by position.
pub async fn get_entries(
    State(state): State<AppState>,
    Path(chart_id): Path<Uuid>,
) -> ApiResult<Json<ChartEntriesResponse>> {
    let chart = require_chart(&state, chart_id).await?;
    let entries = charts::latest_entries(&state.db, chart_id).await?;
    Ok(Json(ChartEntriesResponse { chart, entries }))
}

/// POST /charts/:chart_id/fetch?stop_after=
///
/// Starts a cascade run in the background; poll `/cascade/:run_id`.
pub async fn start_fetch(
    State(state): State<AppState>,
    Path(chart_id): Path<Uuid>,
    Query(query): Query<FetchQuery>,
) -> ApiResult<(StatusCode, Json<CascadeRun>)> {
    require_chart(&state, chart_id).await?;

    // A second running run for the chart is refused by the database
    let stop_after = query.stop_after.unwrap_or(CascadeStage::Audience);
    let run = state.cascade.start(chart_id, stop_after).await?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}

/// GET /charts/:chart_id/runs
pub async fn list_runs(
    State(state): State<AppState>,
    Path(chart_id): Path<Uuid>,
) -> ApiResult<Json<Vec<CascadeRun>>> {
    require_chart(&state, chart_id).await?;
    Ok(Json(
        cascade_runs::list_runs_for_chart(&state.db, chart_id, RECENT_RUNS).await?,
    ))
}

/// GET /cascade/:run_id
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<CascadeRun>> {
    let run = cascade_runs::load_run(&state.db, run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Cascade run {} not found", run_id)))?;
    Ok(Json(run))
}

pub fn chart_routes() -> Router<AppState> {
    Router::new()
        .route("/charts", get(list_charts).post(create_chart))
        .route("/charts/:chart_id", get(get_chart).delete(delete_chart))
        .route("/charts/:chart_id/entries", get(get_entries))
        .route("/charts/:chart_id/fetch", post(start_fetch))
        .route("/charts/:chart_id/runs", get(list_runs))
        .route("/cascade/:run_id", get(get_run))
}
