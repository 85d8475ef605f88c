//! Tracked Entities
//!
//! The change set a unit of work carries to its save boundary. Entities are
//! persistence-agnostic JSON documents; the enlisted feature decides how to
//! write them.

use serde::{Deserialize, Serialize};

use crate::context::EventEnvelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityState {
    Added,
    Modified,
    Deleted,
    /// No pending change. A pre-save hook returning this drops the entity
    /// from the change set.
    Unchanged,
}

impl EntityState {
    pub fn is_pending(&self) -> bool {
        !matches!(self, EntityState::Unchanged)
    }
}

impl std::fmt::Display for EntityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityState::Added => write!(f, "ADDED"),
            EntityState::Modified => write!(f, "MODIFIED"),
            EntityState::Deleted => write!(f, "DELETED"),
            EntityState::Unchanged => write!(f, "UNCHANGED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedEntity {
    /// Entity type, e.g. "Order"
    pub entity_type: String,
    pub entity_id: String,
    pub state: EntityState,
    pub data: serde_json::Value,
    /// Dispatched in-process before persistence
    #[serde(default)]
    pub domain_events: Vec<EventEnvelope>,
    /// Published after persistence, best-effort
    #[serde(default)]
    pub integration_events: Vec<EventEnvelope>,
}

impl TrackedEntity {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        state: EntityState,
        data: serde_json::Value,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            state,
            data,
            domain_events: Vec::new(),
            integration_events: Vec::new(),
        }
    }

    pub fn added(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self::new(entity_type, entity_id, EntityState::Added, data)
    }

    pub fn modified(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self::new(entity_type, entity_id, EntityState::Modified, data)
    }

    pub fn deleted(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::new(
            entity_type,
            entity_id,
            EntityState::Deleted,
            serde_json::Value::Object(Default::default()),
        )
    }

    pub fn with_domain_event(mut self, event: EventEnvelope) -> Self {
        self.domain_events.push(event);
        self
    }

    pub fn with_integration_event(mut self, event: EventEnvelope) -> Self {
        self.integration_events.push(event);
        self
    }

    pub fn is_pending(&self) -> bool {
        self.state.is_pending()
    }

    /// "Type#id", used in logs and error messages
    pub fn label(&self) -> String {
        format!("{}#{}", self.entity_type, self.entity_id)
    }

    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.data.get(name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some_and(|v| !v.is_null())
    }

    /// Set a top-level field. Non-object payloads are replaced by an object.
    pub fn set_field(&mut self, name: &str, value: impl Into<serde_json::Value>) {
        if !self.data.is_object() {
            self.data = serde_json::Value::Object(Default::default());
        }
        if let Some(map) = self.data.as_object_mut() {
            map.insert(name.to_string(), value.into());
        }
    }
}
