use serde::Serialize;

use crate::act::ActStatus;
use crate::generation::GenerationStatus;
use crate::types::{ActId, GenerationId, NodeId, WorkspaceId};

/// Progress notifications emitted while an act runs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ActEvent {
    /// Act record created and its driver started.
    ActStarted {
        act_id: ActId,
        workspace_id: WorkspaceId,
        steps: usize,
    },
    /// A step became eligible and its generation was created.
    GenerationQueued {
        act_id: ActId,
        generation_id: GenerationId,
        node_id: NodeId,
    },
    /// Context resolved and work dispatched.
    GenerationStarted {
        act_id: ActId,
        generation_id: GenerationId,
        node_id: NodeId,
    },
    /// A transient failure is being retried.
    GenerationRetrying {
        act_id: ActId,
        generation_id: GenerationId,
        node_id: NodeId,
        attempt: u32,
        error: String,
    },
    /// Generation reached a terminal state.
    GenerationFinished {
        act_id: ActId,
        generation_id: GenerationId,
        node_id: NodeId,
        status: GenerationStatus,
        duration_ms: u64,
    },
    /// Act reached a terminal state.
    ActFinished {
        act_id: ActId,
        status: ActStatus,
        agent_time_ms: u64,
    },
}

impl ActEvent {
    pub fn act_id(&self) -> &ActId {
        match self {
            Self::ActStarted { act_id, .. }
            | Self::GenerationQueued { act_id, .. }
            | Self::GenerationStarted { act_id, .. }
            | Self::GenerationRetrying { act_id, .. }
            | Self::GenerationFinished { act_id, .. }
            | Self::ActFinished { act_id, .. } => act_id,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<ActEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: ActEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ActEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::default();
        bus.publish(ActEvent::ActFinished {
            act_id: ActId::from("act-1"),
            status: ActStatus::Completed,
            agent_time_ms: 0,
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(ActEvent::ActStarted {
            act_id: ActId::from("act-1"),
            workspace_id: WorkspaceId::from("wrks-1"),
            steps: 2,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.act_id().as_str(), "act-1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "act_started");
        assert_eq!(json["steps"], 2);
    }
}
