//! State enums shared by the analysis pipeline and the cascade fetch

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of an uploaded audio analysis
///
/// uploaded → submitted → processing → completed, with failed reachable
/// from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisState {
    /// File stored locally, not yet sent to the fingerprinting service
    Uploaded,
    /// Accepted by the fingerprinting service, waiting for its callback
    Submitted,
    /// Service reported progress or readiness; result fetch pending
    Processing,
    /// Report persisted
    Completed,
    /// Gave up; manual retry required
    Failed,
}

impl AnalysisState {
    pub const ALL: [AnalysisState; 5] = [
        AnalysisState::Uploaded,
        AnalysisState::Submitted,
        AnalysisState::Processing,
        AnalysisState::Completed,
        AnalysisState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisState::Uploaded => "uploaded",
            AnalysisState::Submitted => "submitted",
            AnalysisState::Processing => "processing",
            AnalysisState::Completed => "completed",
            AnalysisState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalysisState::Completed | AnalysisState::Failed)
    }

    /// Position along the forward path, used to detect stale events
    pub fn rank(&self) -> u8 {
        match self {
            AnalysisState::Uploaded => 0,
            AnalysisState::Submitted => 1,
            AnalysisState::Processing => 2,
            AnalysisState::Completed | AnalysisState::Failed => 3,
        }
    }
}

impl fmt::Display for AnalysisState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(AnalysisState::Uploaded),
            "submitted" => Ok(AnalysisState::Submitted),
            "processing" => Ok(AnalysisState::Processing),
            "completed" => Ok(AnalysisState::Completed),
            "failed" => Ok(AnalysisState::Failed),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown analysis state: {}",
                other
            ))),
        }
    }
}

/// Steps of the chart → track → artist → audience cascade
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CascadeStage {
    Chart,
    Tracks,
    Artists,
    Audience,
}

impl CascadeStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CascadeStage::Chart => "chart",
            CascadeStage::Tracks => "tracks",
            CascadeStage::Artists => "artists",
            CascadeStage::Audience => "audience",
        }
    }
}

impl FromStr for CascadeStage {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chart" => Ok(CascadeStage::Chart),
            "tracks" => Ok(CascadeStage::Tracks),
            "artists" => Ok(CascadeStage::Artists),
            "audience" => Ok(CascadeStage::Audience),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown cascade stage: {}",
                other
            ))),
        }
    }
}

/// Status of a cascade run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CascadeRunState {
    Running,
    Completed,
    Failed,
}

impl CascadeRunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CascadeRunState::Running => "running",
            CascadeRunState::Completed => "completed",
            CascadeRunState::Failed => "failed",
        }
    }
}

impl FromStr for CascadeRunState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(CascadeRunState::Running),
            "completed" => Ok(CascadeRunState::Completed),
            "failed" => Ok(CascadeRunState::Failed),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown cascade run state: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analysis_state_round_trips_through_str() {
        for state in AnalysisState::ALL {
            assert_eq!(state.as_str().parse::<AnalysisState>().unwrap(), state);
        }
        assert!("queued".parse::<AnalysisState>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(AnalysisState::Completed.is_terminal());
        assert!(AnalysisState::Failed.is_terminal());
        assert!(!AnalysisState::Processing.is_terminal());
    }

    #[test]
    fn test_serde_uses_lowercase() {
        let json = serde_json::to_string(&AnalysisState::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
    }

    #[test]
    fn test_cascade_stage_ordering() {
        assert!(CascadeStage::Chart < CascadeStage::Tracks);
        assert!(CascadeStage::Artists < CascadeStage::Audience);
    }
}
