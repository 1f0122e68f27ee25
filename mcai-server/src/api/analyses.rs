//! Analysis endpoints: upload, inspect, report, retry

use axum::{
    extract::{multipart::MultipartError, Multipart, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use mcai_common::events::AnalysisState;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::db::{analyses, reports};
use crate::error::{ApiError, ApiResult};
use crate::models::{Analysis, AnalysisReport, Transition};
use crate::AppState;

/// Multipart field carrying the audio file
const FILE_FIELD: &str = "file";

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub analysis_id: Uuid,
    pub state: AnalysisState,
    pub deduplicated: bool,
    pub analysis: Analysis,
}

#[derive(Debug, Deserialize)]
pub struct ListAnalysesQuery {
    pub state: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ReportResponse {
    pub analysis_id: Uuid,
    pub original_filename: String,
    pub report: AnalysisReport,
}

fn multipart_error(context: &str, err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(format!("{}: {}", context, err.body_text()))
    } else {
        ApiError::BadRequest(format!("{}: {}", context, err.body_text()))
    }
}

/// POST /analyses
///
/// Accepts `multipart/form-data` with a `file` field. New uploads answer
/// 202; content matching a completed analysis answers 200 with that one.
pub async fn upload_analysis(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<UploadResponse>)> {
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error("Malformed multipart body", e))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| "upload".to_string());
        let bytes = field
            .bytes()
            .await
            .map_err(|e| multipart_error("Failed to read upload", e))?;
        upload = Some((filename, bytes.to_vec()));
        break;
    }

    let Some((filename, bytes)) = upload else {
        return Err(ApiError::BadRequest(format!(
            "Missing multipart field '{}'",
            FILE_FIELD
        )));
    };

    let outcome = state.pipeline.upload(&filename, bytes).await?;
    let status = if outcome.deduplicated {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };

    Ok((
        status,
        Json(UploadResponse {
            analysis_id: outcome.analysis.analysis_id,
            state: outcome.analysis.state,
            deduplicated: outcome.deduplicated,
            analysis: outcome.analysis,
        }),
    ))
}

/// GET /analyses?state=&limit=
pub async fn list_analyses(
    State(state): State<AppState>,
    Query(query): Query<ListAnalysesQuery>,
) -> ApiResult<Json<Vec<Analysis>>> {
    let filter = query
        .state
        .as_deref()
        .map(str::parse::<AnalysisState>)
        .transpose()?;
    let limit = super::page_limit(query.limit);
    Ok(Json(analyses::list_analyses(&state.db, filter, limit).await?))
}

/// GET /analyses/:analysis_id
pub async fn get_analysis(
    State(state): State<AppState>,
    Path(analysis_id): Path<Uuid>,
) -> ApiResult<Json<Analysis>> {
    let analysis = analyses::load_analysis(&state.db, analysis_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Analysis {} not found", analysis_id)))?;
    Ok(Json(analysis))
}

/// GET /analyses/:analysis_id/report
pub async fn get_report(
    State(state): State<AppState>,
    Path(analysis_id): Path<Uuid>,
) -> ApiResult<Json<ReportResponse>> {
    let analysis = analyses::load_analysis(&state.db, analysis_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Analysis {} not found", analysis_id)))?;

    // A report row can outlive a later failure; only completed analyses serve it
    let report = match analysis.state {
        AnalysisState::Completed => reports::load_report(&state.db, analysis_id).await?,
        _ => None,
    }
    .ok_or_else(|| {
        ApiError::Conflict(format!(
            "Analysis {} has no report yet (state: {})",
            analysis_id, analysis.state
        ))
    })?;

    Ok(Json(ReportResponse {
        analysis_id,
        original_filename: analysis.original_filename,
        report,
    }))
}

/// POST /analyses/:analysis_id/retry
///
/// Only failed analyses can be retried.
pub async fn retry_analysis(
    State(state): State<AppState>,
    Path(analysis_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<Analysis>)> {
    match state.pipeline.retry(analysis_id).await? {
        Transition::Applied { .. } => {}
        Transition::Ignored { state, reason } | Transition::Rejected { state, reason } => {
            return Err(ApiError::Conflict(format!(
                "Analysis {} cannot be retried in state {}: {}",
                analysis_id, state, reason
            )));
        }
    }

    info!(analysis_id = %analysis_id, "Analysis retry requested");
    let analysis = analyses::load_analysis(&state.db, analysis_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Analysis {} not found", analysis_id)))?;
    Ok((StatusCode::ACCEPTED, Json(analysis)))
}

pub fn analysis_routes() -> Router<AppState> {
    Router::new()
        .route("/analyses", post(upload_analysis).get(list_analyses))
        .route("/analyses/:analysis_id", get(get_analysis))
        .route("/analyses/:analysis_id/report", get(get_report))
        .route("/analyses/:analysis_id/retry", post(retry_analysis))
}
