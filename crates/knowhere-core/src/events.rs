//! Pipeline event types, envelope schema, and in-process event bus.
//!
//! Stage handlers publish after their transaction commits. Publication is
//! best effort: consumers must tolerate seeing an event before, or instead
//! of, reading the new state from the store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::Stage;
use crate::traits::EventPublisher;

/// Topic for all events about items of one space.
pub fn knowledge_topic(space_id: Uuid) -> String {
    format!("knowledge:{}", space_id)
}

// ============================================================================
// Pipeline Event (domain payloads)
// ============================================================================

/// Notifications emitted by the knowledge pipeline.
///
/// Serialized with a `type` tag, e.g.
/// `{"type":"StageChanged","knowledge_id":"...","from":"summarize","to":"embedding"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    /// A stage transition committed.
    StageChanged {
        knowledge_id: Uuid,
        space_id: Uuid,
        from: Stage,
        to: Stage,
    },
    /// A stage attempt failed and was retry-counted.
    ProcessingFailed {
        knowledge_id: Uuid,
        space_id: Uuid,
        stage: Stage,
        retry_times: i32,
        error: String,
    },
    /// Retries exhausted; the item moved to `Failed`.
    DeadLettered {
        knowledge_id: Uuid,
        space_id: Uuid,
        stage: Stage,
        retry_times: i32,
    },
}

impl PipelineEvent {
    /// Dot-namespaced event type used on the wire.
    pub fn namespaced_event_type(&self) -> &'static str {
        match self {
            PipelineEvent::StageChanged { .. } => "knowledge.stage_changed",
            PipelineEvent::ProcessingFailed { .. } => "knowledge.processing_failed",
            PipelineEvent::DeadLettered { .. } => "knowledge.dead_lettered",
        }
    }

    pub fn knowledge_id(&self) -> Uuid {
        match self {
            PipelineEvent::StageChanged { knowledge_id, .. }
            | PipelineEvent::ProcessingFailed { knowledge_id, .. }
            | PipelineEvent::DeadLettered { knowledge_id, .. } => *knowledge_id,
        }
    }
}

// ============================================================================
// Event Envelope
// ============================================================================

/// Versioned wrapper around a [`PipelineEvent`].
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// Unique event identifier (UUIDv7 for temporal ordering).
    pub event_id: Uuid,
    /// Topic the event was published on.
    pub topic: String,
    /// Namespaced event type (e.g. `"knowledge.stage_changed"`).
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub entity_id: String,
    /// Payload schema version.
    pub payload_version: u32,
    pub payload: PipelineEvent,
}

impl EventEnvelope {
    pub fn new(topic: &str, event: PipelineEvent) -> Self {
        Self {
            event_id: crate::uuid_utils::new_v7(),
            topic: topic.to_string(),
            event_type: event.namespaced_event_type().to_string(),
            occurred_at: Utc::now(),
            entity_id: event.knowledge_id().to_string(),
            payload_version: 1,
            payload: event,
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Broadcast-backed event bus. Each subscriber gets an independent stream;
/// with no subscribers, events are silently dropped.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    ///
    /// Recommended: 256 for production, 32 for tests.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to receive enveloped events.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventPublisher for EventBus {
    fn publish(&self, topic: &str, event: PipelineEvent) {
        let envelope = EventEnvelope::new(topic, event);
        tracing::debug!(
            topic,
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            subscriber_count = self.tx.receiver_count(),
            "EventBus publish"
        );
        let _ = self.tx.send(envelope);
    }
}

// ============================================================================
// Tests
// ============================================================================
