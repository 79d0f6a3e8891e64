//! Lightweight events: identifier-only signals for reactive coordination.
//!
//! An [`Event`] carries identities and scalar metadata, never entity
//! payloads. Parent/root linkage is applied from the scoped
//! [`context::EventContext`] at emission; delivery happens on the
//! [`bus::EventBus`].

pub mod bus;
pub mod context;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{EcsId, LineageId};

pub use bus::{EventBus, Handler, Matcher, SubscriptionHandle};
pub use context::{EventContext, ScopeEntry, with_scope, with_scope_async};

/// Unique identity of one emitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Allocate a fresh event identity.
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    Modified,
    StateTransition,
    Processing,
    Processed,
    Failed,
    /// Consumer-defined kind, matched by its literal name.
    Custom(String),
}

impl EventKind {
    /// The phase this kind implies when none is given explicitly.
    pub fn default_phase(&self) -> Phase {
        match self {
            EventKind::Processing => Phase::Opening,
            EventKind::Processed | EventKind::Failed => Phase::Closing,
            _ => Phase::Instant,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Created => write!(f, "created"),
            EventKind::Modified => write!(f, "modified"),
            EventKind::StateTransition => write!(f, "state-transition"),
            EventKind::Processing => write!(f, "processing"),
            EventKind::Processed => write!(f, "processed"),
            EventKind::Failed => write!(f, "failed"),
            EventKind::Custom(name) => write!(f, "{name}"),
        }
    }
}

/// Whether an event opens a scope, closes one, or stands alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Instant,
    Opening,
    Closing,
}

/// Scalar-only metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// An immutable signal carrying only identifiers and scalar metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub kind: EventKind,
    pub phase: Phase,
    /// Kind of the subject entity (or a logical subject name).
    pub subject_kind: String,
    /// Version identity of the subject entity, when there is one.
    pub subject_id: Option<EcsId>,
    /// Entity acting on the subject, when distinct from it.
    pub actor_id: Option<EcsId>,
    /// Additional entities involved in the operation.
    pub context_ids: Vec<EcsId>,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: u64,
    /// Lineage of the subject entity, when there is one.
    pub lineage_id: Option<LineageId>,
    /// Direct parent event (set from the context stack at emission).
    pub parent_id: Option<EventId>,
    /// Root of the event family (self when emitted without a parent).
    pub root_id: Option<EventId>,
    /// Small scalar-only key/value map.
    pub metadata: BTreeMap<String, MetadataValue>,
    /// Wall-clock duration, for closing events.
    pub duration_ms: Option<u64>,
}

impl Event {
    /// Build an event of the given kind about a subject kind; the phase
    /// defaults from the kind.
    pub fn new(kind: EventKind, subject_kind: impl Into<String>) -> Self {
        let phase = kind.default_phase();
        Self {
            id: EventId::fresh(),
            kind,
            phase,
            subject_kind: subject_kind.into(),
            subject_id: None,
            actor_id: None,
            context_ids: Vec::new(),
            timestamp: crate::entity::now_ms(),
            lineage_id: None,
            parent_id: None,
            root_id: None,
            metadata: BTreeMap::new(),
            duration_ms: None,
        }
    }

    /// Attach the subject entity's identities.
    pub fn with_subject(mut self, subject_id: EcsId, lineage_id: LineageId) -> Self {
        self.subject_id = Some(subject_id);
        self.lineage_id = Some(lineage_id);
        self
    }

    /// Attach an actor identity.
    pub fn with_actor(mut self, actor_id: EcsId) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    /// Attach additional involved entities.
    pub fn with_context_ids(mut self, ids: Vec<EcsId>) -> Self {
        self.context_ids = ids;
        self
    }

    /// Add one metadata entry.
    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<MetadataValue>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Record a duration on a closing event.
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Override the implied phase.
    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_renders_spec_names() {
        assert_eq!(EventKind::Created.to_string(), "created");
        assert_eq!(EventKind::StateTransition.to_string(), "state-transition");
        assert_eq!(EventKind::Custom("student.enrolled".into()).to_string(), "student.enrolled");
    }

    #[test]
    fn phase_defaults_from_kind() {
        assert_eq!(EventKind::Processing.default_phase(), Phase::Opening);
        assert_eq!(EventKind::Processed.default_phase(), Phase::Closing);
        assert_eq!(EventKind::Failed.default_phase(), Phase::Closing);
        assert_eq!(EventKind::Created.default_phase(), Phase::Instant);
    }

    #[test]
    fn builder_populates_fields() {
        let subject = EcsId::fresh();
        let lineage = LineageId::fresh();
        let e = Event::new(EventKind::Processing, "Student")
            .with_subject(subject, lineage)
            .with_metadata("function", "update")
            .with_duration_ms(12);

        assert_eq!(e.subject_id, Some(subject));
        assert_eq!(e.lineage_id, Some(lineage));
        assert_eq!(e.metadata["function"], MetadataValue::Str("update".into()));
        assert_eq!(e.duration_ms, Some(12));
        assert!(e.parent_id.is_none());
    }

    #[test]
    fn events_serialize_to_json() {
        let e = Event::new(EventKind::Created, "Student").with_metadata("n", 3i64);
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"subject_kind\":\"Student\""));
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
