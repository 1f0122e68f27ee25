//! Analysis pipeline state machine
//!
//! An analysis moves uploaded → submitted → processing → completed, or to
//! failed from any non-terminal state. Transitions are pure functions of the
//! current record and an incoming [`PipelineEvent`]; persistence applies them
//! with a compare-and-set on the previous state so duplicate or concurrent
//! deliveries resolve to a single applied transition.

use chrono::{DateTime, Utc};
use mcai_common::events::AnalysisState;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One uploaded file and its progress through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub analysis_id: Uuid,
    pub original_filename: String,
    /// Location of the stored upload
    pub stored_path: String,
    pub content_sha256: String,
    pub size_bytes: i64,
    pub state: AnalysisState,
    /// File id assigned by the fingerprinting service on submission
    pub external_file_id: Option<String>,
    /// Service signalled that results can be fetched
    pub result_ready: bool,
    pub fetch_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Analysis {
    pub fn new(
        original_filename: String,
        stored_path: String,
        content_sha256: String,
        size_bytes: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            analysis_id: Uuid::new_v4(),
            original_filename,
            stored_path,
            content_sha256,
            size_bytes,
            state: AnalysisState::Uploaded,
            external_file_id: None,
            result_ready: false,
            fetch_attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Inputs that may move an analysis between states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    SubmitSucceeded { external_file_id: String },
    SubmitFailed { reason: String },
    CallbackProcessing,
    CallbackReady,
    CallbackFailed { reason: String },
    FetchSucceeded,
    FetchFailed { reason: String },
    RetryRequested,
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::SubmitSucceeded { .. } => "submit_succeeded",
            PipelineEvent::SubmitFailed { .. } => "submit_failed",
            PipelineEvent::CallbackProcessing => "callback_processing",
            PipelineEvent::CallbackReady => "callback_ready",
            PipelineEvent::CallbackFailed { .. } => "callback_failed",
            PipelineEvent::FetchSucceeded => "fetch_succeeded",
            PipelineEvent::FetchFailed { .. } => "fetch_failed",
            PipelineEvent::RetryRequested => "retry_requested",
        }
    }

    /// Failure reason carried by the event, if any
    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            PipelineEvent::SubmitFailed { reason }
            | PipelineEvent::CallbackFailed { reason }
            | PipelineEvent::FetchFailed { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Follow-up work a transition schedules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    EnqueueSubmit,
    EnqueueFetch,
}

/// Outcome of applying an event to an analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Transition {
    /// State (or readiness) changed
    Applied {
        from: AnalysisState,
        to: AnalysisState,
        /// Readiness flag after the transition
        result_ready: bool,
        effect: Option<Effect>,
    },
    /// Duplicate or stale event; nothing changes
    Ignored {
        state: AnalysisState,
        reason: &'static str,
    },
    /// Event is not valid for the current state
    Rejected {
        state: AnalysisState,
        reason: &'static str,
    },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }

    pub fn effect(&self) -> Option<Effect> {
        match self {
            Transition::Applied { effect, .. } => *effect,
            _ => None,
        }
    }
}

fn applied(
    from: AnalysisState,
    to: AnalysisState,
    result_ready: bool,
    effect: Option<Effect>,
) -> Transition {
    Transition::Applied {
        from,
        to,
        result_ready,
        effect,
    }
}

/// Decide how `event` affects `analysis`
pub fn apply_event(analysis: &Analysis, event: &PipelineEvent) -> Transition {
    use AnalysisState::*;
    use PipelineEvent::*;

    let state = analysis.state;
    let ready = analysis.result_ready;

    match (state, event) {
        (Completed, RetryRequested) => Transition::Rejected {
            state,
            reason: "completed analyses cannot be retried",
        },
        (Completed, _) => Transition::Ignored {
            state,
            reason: "analysis already completed",
        },

        (Failed, RetryRequested) => {
            if analysis.external_file_id.is_some() {
                applied(Failed, Processing, true, Some(Effect::EnqueueFetch))
            } else {
                applied(Failed, Uploaded, false, Some(Effect::EnqueueSubmit))
            }
        }
        (Failed, _) => Transition::Ignored {
            state,
            reason: "analysis failed; only a manual retry applies",
        },

        (_, RetryRequested) => Transition::Rejected {
            state,
            reason: "only failed analyses can be retried",
        },

        (Uploaded, SubmitSucceeded { .. }) => applied(Uploaded, Submitted, false, None),
        (Uploaded, SubmitFailed { .. }) => applied(Uploaded, Failed, false, None),
        (Uploaded, _) => Transition::Rejected {
            state,
            reason: "analysis has not been submitted",
        },

        (Submitted | Processing, SubmitSucceeded { .. }) => Transition::Ignored {
            state,
            reason: "submission already recorded",
        },
        (Submitted | Processing, SubmitFailed { .. }) => Transition::Rejected {
            state,
            reason: "submission already succeeded",
        },

        (Submitted, CallbackProcessing) => applied(Submitted, Processing, false, None),
        (Processing, CallbackProcessing) => Transition::Ignored {
            state,
            reason: "already processing",
        },

        (Submitted, CallbackReady) => {
            applied(Submitted, Processing, true, Some(Effect::EnqueueFetch))
        }
        (Processing, CallbackReady) if !ready => {
            applied(Processing, Processing, true, Some(Effect::EnqueueFetch))
        }
        (Processing, CallbackReady) => Transition::Ignored {
            state,
            reason: "result fetch already scheduled",
        },

        (Submitted | Processing, CallbackFailed { .. }) => applied(state, Failed, ready, None),

        (Processing, FetchSucceeded) if ready => applied(Processing, Completed, true, None),
        (Processing, FetchFailed { .. }) => applied(Processing, Failed, ready, None),
        (Submitted | Processing, FetchSucceeded | FetchFailed { .. }) => Transition::Rejected {
            state,
            reason: "result is not ready to fetch",
        },
    }
}
