//! Per-object event recording.
//!
//! Every phase transition emits an event on the owning resource: Normal for
//! progress, Warning for failures. The recorder keeps a bounded ring per
//! object so operators can inspect recent history without an external
//! pipeline.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{info, warn};

use virtrigaud_api::ObjectKey;

/// Events kept per object.
const EVENT_RING_CAPACITY: usize = 32;

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// One recorded event.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Process-wide event recorder, cheap to clone.
#[derive(Clone, Default)]
pub struct Recorder {
    rings: Arc<RwLock<HashMap<String, VecDeque<Event>>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn ring_key(kind: &str, key: &ObjectKey) -> String {
        format!("{}/{}", kind, key)
    }

    /// Record an event against an object.
    pub async fn record(
        &self,
        kind: &str,
        key: &ObjectKey,
        event_type: EventType,
        reason: &str,
        message: impl Into<String>,
    ) {
        let message = message.into();
        match event_type {
            EventType::Normal => {
                info!(kind, object = %key, reason, message = %message, "event")
            }
            EventType::Warning => {
                warn!(kind, object = %key, reason, message = %message, "event")
            }
        }

        let mut rings = self.rings.write().await;
        let ring = rings.entry(Self::ring_key(kind, key)).or_default();
        if ring.len() == EVENT_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(Event {
            event_type,
            reason: reason.to_string(),
            message,
            timestamp: Utc::now(),
        });
    }

    /// Recent events for an object, oldest first.
    pub async fn events_for(&self, kind: &str, key: &ObjectKey) -> Vec<Event> {
        let rings = self.rings.read().await;
        rings
            .get(&Self::ring_key(kind, key))
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_and_read_back() {
        let recorder = Recorder::new();
        let key = ObjectKey::new("default", "m1");
        recorder
            .record("VMMigration", &key, EventType::Normal, "PhaseTransition", "Pending -> Validating")
            .await;

        let events = recorder.events_for("VMMigration", &key).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, "PhaseTransition");
    }

    #[tokio::test]
    async fn test_ring_is_bounded() {
        let recorder = Recorder::new();
        let key = ObjectKey::new("default", "m1");
        for i in 0..(EVENT_RING_CAPACITY + 8) {
            recorder
                .record("VMMigration", &key, EventType::Normal, "Tick", format!("{i}"))
                .await;
        }
        let events = recorder.events_for("VMMigration", &key).await;
        assert_eq!(events.len(), EVENT_RING_CAPACITY);
        assert_eq!(events[0].message, "8");
    }
}
