//! Event types for the MusicChartsAI event system
//!
//! Provides the shared event enum and the broadcast EventBus used to feed
//! SSE clients.

mod pipeline_types;

pub use pipeline_types::{AnalysisState, CascadeRunState, CascadeStage};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Service event types
///
/// Events are broadcast via EventBus and serialized for SSE transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum McaiEvent {
    /// A new upload was accepted
    AnalysisCreated {
        analysis_id: Uuid,
        original_filename: String,
        timestamp: DateTime<Utc>,
    },

    /// An analysis moved between pipeline states
    AnalysisStateChanged {
        analysis_id: Uuid,
        old_state: AnalysisState,
        new_state: AnalysisState,
        /// Failure reason when `new_state` is failed
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A cascade run finished a batch
    CascadeProgress {
        run_id: Uuid,
        chart_id: Uuid,
        stage: CascadeStage,
        current: usize,
        total: usize,
        timestamp: DateTime<Utc>,
    },

    /// A cascade run reached a terminal state
    CascadeFinished {
        run_id: Uuid,
        chart_id: Uuid,
        state: CascadeRunState,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl McaiEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &str {
        match self {
            McaiEvent::AnalysisCreated { .. } => "AnalysisCreated",
            McaiEvent::AnalysisStateChanged { .. } => "AnalysisStateChanged",
            McaiEvent::CascadeProgress { .. } => "CascadeProgress",
            McaiEvent::CascadeFinished { .. } => "CascadeFinished",
        }
    }
}

/// Broadcast channel for service events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<McaiEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<McaiEvent> {
        self.tx.subscribe()
    }

    /// Emit an event
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: McaiEvent,
    ) -> Result<usize, broadcast::error::SendError<McaiEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: McaiEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_emitted_event() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();
        let analysis_id = Uuid::new_v4();

        bus.emit(McaiEvent::AnalysisStateChanged {
            analysis_id,
            old_state: AnalysisState::Submitted,
            new_state: AnalysisState::Processing,
            error: None,
            timestamp: Utc::now(),
        })
        .unwrap();

        match rx.recv().await.unwrap() {
            McaiEvent::AnalysisStateChanged { analysis_id: id, new_state, .. } => {
                assert_eq!(id, analysis_id);
                assert_eq!(new_state, AnalysisState::Processing);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_fails_but_lossy_does_not() {
        let bus = EventBus::new(4);
        let event = McaiEvent::AnalysisCreated {
            analysis_id: Uuid::new_v4(),
            original_filename: "a.mp3".to_string(),
            timestamp: Utc::now(),
        };
        assert!(bus.emit(event.clone()).is_err());
        bus.emit_lossy(event);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_serialized_event_is_tagged() {
        let event = McaiEvent::CascadeFinished {
            run_id: Uuid::nil(),
            chart_id: Uuid::nil(),
            state: CascadeRunState::Completed,
            error: None,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "CascadeFinished");
        assert_eq!(json["state"], "completed");
        assert!(json.get("error").is_none());
    }
}
