//! Read-only views of fetched tracks and artists

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::page_limit;
use crate::db::{artists, tracks};
use crate::error::{ApiError, ApiResult};
use crate::models::{Artist, AudienceSnapshot, Track};
use crate::AppState;

const AUDIENCE_HISTORY_LIMIT: u32 = 90;

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    /// Substring of the name (tracks also match on exact ISRC)
    pub q: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct AudienceQuery {
    pub platform: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ArtistDetail {
    #[serde(flatten)]
    pub artist: Artist,
    /// Most recent first
    pub audience: Vec<AudienceSnapshot>,
}

fn search_term(query: &SearchQuery) -> Option<&str> {
    query.q.as_deref().map(str::trim).filter(|q| !q.is_empty())
}

/// GET /tracks?q=&limit=&offset=
pub async fn list_tracks(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Vec<Track>>> {
    let found = tracks::list_tracks(
        &state.db,
        search_term(&query),
        page_limit(query.limit),
        query.offset.unwrap_or(0),
    )
    .await?;
    Ok(Json(found))
}

/// GET /tracks/:track_uuid
pub async fn get_track(
    State(state): State<AppState>,
    Path(track_uuid): Path<String>,
) -> ApiResult<Json<Track>> {
    let track = tracks::get_track(&state.db, &track_uuid)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Track {} not found", track_uuid)))?;
    Ok(Json(track))
}

/// GET /artists?q=&limit=&offset=
pub async fn list_artists(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Vec<Artist>>> {
    let found = artists::list_artists(
        &state.db,
        search_term(&query),
        page_limit(query.limit),
        query.offset.unwrap_or(0),
    )
    .await?;
    Ok(Json(found))
}

/// GET /artists/:artist_uuid?platform=
pub async fn get_artist(
    State(state): State<AppState>,
    Path(artist_uuid): Path<String>,
    Query(query): Query<AudienceQuery>,
) -> ApiResult<Json<ArtistDetail>> {
    let artist = artists::get_artist(&state.db, &artist_uuid)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Artist {} not found", artist_uuid)))?;
    let audience = artists::audience_history(
        &state.db,
        &artist_uuid,
        query.platform.as_deref(),
        AUDIENCE_HISTORY_LIMIT,
    )
    .await?;

    Ok(Json(ArtistDetail { artist, audience }))
}

pub fn catalog_routes() -> Router<AppState> {
    Router::new()
        .route("/tracks", get(list_tracks))
        .route("/tracks/:track_uuid", get(get_track))
        .route("/artists", get(list_artists))
        .route("/artists/:artist_uuid", get(get_artist))
}
