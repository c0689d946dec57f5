//! Structured control events
//!
//! Every state transition and error in the control plane produces one of
//! these, carrying the analysis or policy id as correlation id. Consumers
//! subscribe through the broadcast bus; slow consumers lag rather than
//! block the producers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Kinds of control events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    Heartbeat,
    ViolationsDetected { count: usize },
    AnalysisCompleted,
    PolicySelected,
    PolicyPendingApproval,
    PolicyApproved,
    PolicyRejected,
    PolicySuperseded,
    ExecutionStarted,
    ExecutionFinished { status: String },
    RollbackPerformed,
    OutcomeRecorded { class: String },
    OrchestratorDegraded,
    OrchestratorCleared,
    RoundOpened { round_id: u64 },
    RoundPublished { round_id: u64, version: u64 },
    RoundAborted { round_id: u64 },
    DpBudgetExhausted,
    ComponentError { category: String },
}

/// One structured control event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlEvent {
    pub event_id: Uuid,
    pub kind: EventKind,
    /// Analysis id or policy id, when one applies
    pub correlation_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub detail: String,
}

impl ControlEvent {
    pub fn new(kind: EventKind, correlation_id: Option<Uuid>, detail: impl Into<String>) -> Self {
        ControlEvent {
            event_id: Uuid::new_v4(),
            kind,
            correlation_id,
            timestamp: Utc::now(),
            detail: detail.into(),
        }
    }
}

/// Broadcast bus for control events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ControlEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        EventBus { sender }
    }

    /// Publish an event. Events with no subscriber are dropped silently.
    pub fn publish(&self, event: ControlEvent) {
        let _ = self.sender.send(event);
    }

    pub fn emit(&self, kind: EventKind, correlation_id: Option<Uuid>, detail: impl Into<String>) {
        self.publish(ControlEvent::new(kind, correlation_id, detail));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
