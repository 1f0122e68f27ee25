//! Domain models

pub mod analysis;
pub mod chart;
pub mod report;

pub use analysis::{apply_event, Analysis, Effect, PipelineEvent, Transition};
pub use chart::{
    is_valid_slug, Artist, AudienceSnapshot, CascadeCounters, CascadeRun, Chart, ChartEntry,
    NewChart, Track, TrackArtist,
};
pub use report::{AnalysisReport, MatchKind, TrackMatch, Verdict};
