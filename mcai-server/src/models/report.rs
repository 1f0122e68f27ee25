//! Canonical fraud-detection report
//!
//! Built from normalized fingerprint matches; the raw third-party payload is
//! stored alongside for auditing but never read back by the service.

use serde::{Deserialize, Serialize};

/// Which fingerprint engine produced a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    /// Same recording
    Music,
    /// Different recording of the same composition
    Cover,
}

/// One recognized recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackMatch {
    pub kind: MatchKind,
    pub title: Option<String>,
    pub artists: Vec<String>,
    pub album: Option<String>,
    pub isrc: Option<String>,
    /// 0-100
    pub score: f64,
    pub offset_seconds: Option<f64>,
    pub played_duration_seconds: Option<f64>,
    pub acrid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spotify_track_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deezer_track_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub youtube_video_id: Option<String>,
}

/// Overall judgement on an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Matches an existing recording above threshold
    KnownRecording,
    /// Matches a composition above threshold but not the recording
    PotentialCover,
    /// Nothing above threshold
    NoMatch,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::KnownRecording => "known_recording",
            Verdict::PotentialCover => "potential_cover",
            Verdict::NoMatch => "no_match",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "known_recording" => Some(Verdict::KnownRecording),
            "potential_cover" => Some(Verdict::PotentialCover),
            "no_match" => Some(Verdict::NoMatch),
            _ => None,
        }
    }
}

/// Report persisted when an analysis completes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub verdict: Verdict,
    pub top_score: Option<f64>,
    pub music_match_count: usize,
    pub cover_match_count: usize,
    /// Ordered by descending score
    pub matches: Vec<TrackMatch>,
}

impl AnalysisReport {
    /// Summarize matches against the verdict threshold
    pub fn from_matches(mut matches: Vec<TrackMatch>, score_threshold: f64) -> Self {
        matches.sort_by(|a, b| b.score.total_cmp(&a.score));

        let music_match_count = matches.iter().filter(|m| m.kind == MatchKind::Music).count();
        let cover_match_count = matches.len() - music_match_count;
        let top_score = matches.first().map(|m| m.score);

        let above = |kind: MatchKind| {
            matches
                .iter()
                .any(|m| m.kind == kind && m.score >= score_threshold)
        };

        let verdict = if above(MatchKind::Music) {
            Verdict::KnownRecording
        } else if above(MatchKind::Cover) {
            Verdict::PotentialCover
        } else {
            Verdict::NoMatch
        };

        Self {
            verdict,
            top_score,
            music_match_count,
            cover_match_count,
            matches,
        }
    }
}
