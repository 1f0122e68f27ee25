//! Chart, track, artist and audience records populated by the cascade fetch

use chrono::{DateTime, NaiveDate, Utc};
use mcai_common::events::{CascadeRunState, CascadeStage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A chart followed by the service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chart {
    pub chart_id: Uuid,
    /// SoundCharts chart slug (e.g. "global-28")
    pub slug: String,
    pub name: String,
    pub platform: Option<String>,
    pub country_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_fetched_at: Option<DateTime<Utc>>,
}

/// Payload for creating a chart
#[derive(Debug, Clone, Deserialize)]
pub struct NewChart {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub country_code: Option<String>,
}

/// Chart slugs become a path segment of upstream requests, so only
/// `[A-Za-z0-9_-]` is accepted
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// One position in one ranking snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartEntry {
    pub chart_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    pub position: i64,
    pub previous_position: Option<i64>,
    /// Positive when the track climbed
    pub position_change: Option<i64>,
    pub weeks_on_chart: Option<i64>,
    pub track_uuid: String,
    /// Joined from tracks when listing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub track_uuid: String,
    pub name: String,
    pub isrc: Option<String>,
    pub release_date: Option<String>,
    pub duration_seconds: Option<i64>,
    pub genres: Vec<String>,
    pub image_url: Option<String>,
    /// Credited artists, in credit order
    pub artists: Vec<TrackArtist>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackArtist {
    pub artist_uuid: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artist {
    pub artist_uuid: String,
    pub name: String,
    pub country_code: Option<String>,
    pub genres: Vec<String>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudienceSnapshot {
    pub artist_uuid: String,
    pub platform: String,
    pub date: NaiveDate,
    pub follower_count: Option<i64>,
}

/// Per-stage tallies of a cascade run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeCounters {
    pub entries: usize,
    pub tracks_fetched: usize,
    pub tracks_failed: usize,
    pub artists_fetched: usize,
    pub artists_failed: usize,
    pub audience_snapshots: usize,
    pub audience_failed: usize,
}

/// One execution of the chart → track → artist → audience cascade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeRun {
    pub run_id: Uuid,
    pub chart_id: Uuid,
    pub state: CascadeRunState,
    /// Last stage to execute
    pub stop_after: CascadeStage,
    pub counters: CascadeCounters,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl CascadeRun {
    pub fn new(chart_id: Uuid, stop_after: CascadeStage) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            chart_id,
            state: CascadeRunState::Running,
            stop_after,
            counters: CascadeCounters::default(),
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        }
    }

    /// Whether `stage` is within this run's scope
    pub fn includes(&self, stage: CascadeStage) -> bool {
        stage <= self.stop_after
    }
}
