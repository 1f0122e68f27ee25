//! Aggregate reports over stored charts, artists and analyses

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::db::analytics::{self, AnalysesSummary, ChartMovers, TopArtist};
use crate::db::charts;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

const DEFAULT_MOVERS: u32 = 10;
const DEFAULT_TOP_ARTISTS: u32 = 20;
const MAX_REPORT_ROWS: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct TopArtistsQuery {
    pub limit: Option<u32>,
    pub platform: Option<String>,
}

/// GET /reports/charts/:chart_id/movers?limit=
pub async fn chart_movers(
    State(state): State<AppState>,
    Path(chart_id): Path<Uuid>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<ChartMovers>> {
    if charts::get_chart(&state.db, chart_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Chart {} not found", chart_id)));
    }
    let limit = query.limit.unwrap_or(DEFAULT_MOVERS).clamp(1, MAX_REPORT_ROWS);
    Ok(Json(analytics::chart_movers(&state.db, chart_id, limit).await?))
}

/// GET /reports/artists/top?limit=&platform=
pub async fn top_artists(
    State(state): State<AppState>,
    Query(query): Query<TopArtistsQuery>,
) -> ApiResult<Json<Vec<TopArtist>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_TOP_ARTISTS)
        .clamp(1, MAX_REPORT_ROWS);
    Ok(Json(
        analytics::top_artists(&state.db, query.platform.as_deref(), limit).await?,
    ))
}

/// GET /reports/analyses/summary
pub async fn analyses_summary(State(state): State<AppState>) -> ApiResult<Json<AnalysesSummary>> {
    Ok(Json(analytics::analyses_summary(&state.db).await?))
}

pub fn report_routes() -> Router<AppState> {
    Router::new()
        .route("/reports/charts/:chart_id/movers", get(chart_movers))
        .route("/reports/artists/top", get(top_artists))
        .route("/reports/analyses/summary", get(analyses_summary))
}
