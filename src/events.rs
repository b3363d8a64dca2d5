//! Outbound event publishing.
//!
//! The write path emits events through the `EventPublisher` trait. Delivery to
//! a broker lives outside this crate; the default publisher records events in
//! the trace log.

use std::fmt;
use std::sync::Mutex;

use serde_json::Value;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("event publisher unavailable: {0}")]
    Unavailable(String),
}

/// Routing keys for the events the write path emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// A scored observation set was created.
    ObservationSetCreated,
    /// An encounter gained a new observation set.
    EncounterUpdated,
    AuditMessage,
}

impl Topic {
    pub fn routing_key(&self) -> &'static str {
        match self {
            Topic::ObservationSetCreated => "dhos.DM000004",
            Topic::EncounterUpdated => "dhos.DM000007",
            Topic::AuditMessage => "dhos.34837004",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.routing_key())
    }
}

pub trait EventPublisher: Send + Sync {
    fn publish(&self, topic: Topic, payload: Value) -> Result<(), PublishError>;
}

/// Writes every event to the trace log.
#[derive(Debug, Default)]
pub struct LoggingPublisher;

impl EventPublisher for LoggingPublisher {
    fn publish(&self, topic: Topic, payload: Value) -> Result<(), PublishError> {
        info!(routing_key = %topic, %payload, "publishing event");
        Ok(())
    }
}

/// Keeps published events in memory, in order.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    events: Mutex<Vec<(Topic, Value)>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(Topic, Value)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.events().into_iter().map(|(topic, _)| topic).collect()
    }
}

impl EventPublisher for MemoryPublisher {
    fn publish(&self, topic: Topic, payload: Value) -> Result<(), PublishError> {
        self.events
            .lock()
            .map_err(|_| PublishError::Unavailable("event buffer poisoned".to_string()))?
            .push((topic, payload));
        Ok(())
    }
}
