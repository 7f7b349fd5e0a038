//! Event metadata: who caused an event and how it relates to other events.
//!
//! The actor identity is carried for audit purposes only; nothing in the
//! engine makes authorization decisions from it.

use crate::types::EventId;
use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A correlation identifier that links related events across command boundaries.
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Creates a new correlation ID.
    pub fn new() -> Self {
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7() should always return a valid v7 UUID")
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

/// Links an event to the event that directly caused it.
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct CausationId(Uuid);

impl From<EventId> for CausationId {
    fn from(event_id: EventId) -> Self {
        // EventId is guaranteed to be v7
        Self::try_new(*event_id.as_ref())
            .expect("EventId should always be a valid v7 UUID for CausationId")
    }
}

/// Identifies the user or system actor that produced an event.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ActorId(String);

/// The actor attached to an event.
///
/// `ActorIdentity::default()` is the anonymous identity: no id, no name,
/// no roles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorIdentity {
    /// Stable identifier of the actor, if known.
    pub actor_id: Option<ActorId>,
    /// Human-readable name, if known.
    pub display_name: Option<String>,
    /// Roles the actor held when the event was produced.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl ActorIdentity {
    /// The anonymous identity.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// An identified actor.
    pub const fn identified(actor_id: ActorId) -> Self {
        Self {
            actor_id: Some(actor_id),
            display_name: None,
            roles: Vec::new(),
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Adds a role.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    /// Whether this is the anonymous identity.
    pub const fn is_anonymous(&self) -> bool {
        self.actor_id.is_none() && self.display_name.is_none()
    }
}

/// Contextual information stored with every event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// The actor that produced the event.
    #[serde(default)]
    pub actor: ActorIdentity,
    /// Links events in the same logical workflow.
    pub correlation_id: Option<CorrelationId>,
    /// Links this event to the event that caused it.
    pub causation_id: Option<CausationId>,
    /// Additional custom metadata.
    #[serde(default)]
    pub custom: HashMap<String, serde_json::Value>,
}

impl EventMetadata {
    /// Metadata for an anonymous actor with no correlation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the actor.
    #[must_use]
    pub fn with_actor(mut self, actor: ActorIdentity) -> Self {
        self.actor = actor;
        self
    }

    /// Sets the correlation ID.
    #[must_use]
    pub const fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Records the event that caused this one.
    #[must_use]
    pub fn caused_by(mut self, event_id: EventId) -> Self {
        self.causation_id = Some(CausationId::from(event_id));
        self
    }

    /// Adds custom metadata.
    #[must_use]
    pub fn with_custom(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.custom.insert(key.into(), value);
        self
    }
}
