// Event model.
//
// An `Event` is an immutable record produced by a validated write. Ten
// payload variants exist (§3); each is associated with exactly one of the
// ten buffer queues in `crate::buffer`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod validator;

/// Globally unique 128-bit event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        EventId(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two mutation kinds every variant supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Add,
    Remove,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Add => write!(f, "Add"),
            Action::Remove => write!(f, "Remove"),
        }
    }
}

/// 32-bit signed hash code derived from an element's primary key, used for
/// hash-range partitioning across shard groups.
pub type HashCode = i32;

/// Opaque primary key. The core never compares keys except by `event_id`
/// (per the design notes: deep generic parameterization over key types
/// collapses into an opaque-key payload abstraction).
pub type Key = String;

/// One of the ten payload variants an event may carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    User { user: Key },
    Group { group: Key },
    UserToGroupMapping { user: Key, group: Key },
    GroupToGroupMapping { from_group: Key, to_group: Key },
    UserToComponentAccess { user: Key, component: Key, access_level: Key },
    GroupToComponentAccess { group: Key, component: Key, access_level: Key },
    EntityType { entity_type: Key },
    Entity { entity_type: Key, entity: Key },
    UserToEntityMapping { user: Key, entity_type: Key, entity: Key },
    GroupToEntityMapping { group: Key, entity_type: Key, entity: Key },
}

/// Identifies which of the ten buffer queues / lock objects a payload
/// belongs to, independent of Add vs. Remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variant {
    User,
    Group,
    UserToGroupMapping,
    GroupToGroupMapping,
    UserToComponentAccess,
    GroupToComponentAccess,
    EntityType,
    Entity,
    UserToEntityMapping,
    GroupToEntityMapping,
}

impl Variant {
    pub const ALL: [Variant; 10] = [
        Variant::User,
        Variant::Group,
        Variant::UserToGroupMapping,
        Variant::GroupToGroupMapping,
        Variant::UserToComponentAccess,
        Variant::GroupToComponentAccess,
        Variant::EntityType,
        Variant::Entity,
        Variant::UserToEntityMapping,
        Variant::GroupToEntityMapping,
    ];
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Variant::User => "User",
            Variant::Group => "Group",
            Variant::UserToGroupMapping => "UserToGroupMapping",
            Variant::GroupToGroupMapping => "GroupToGroupMapping",
            Variant::UserToComponentAccess => "UserToComponentAccess",
            Variant::GroupToComponentAccess => "GroupToComponentAccess",
            Variant::EntityType => "EntityType",
            Variant::Entity => "Entity",
            Variant::UserToEntityMapping => "UserToEntityMapping",
            Variant::GroupToEntityMapping => "GroupToEntityMapping",
        };
        write!(f, "{s}")
    }
}

impl Payload {
    pub fn variant(&self) -> Variant {
        match self {
            Payload::User { .. } => Variant::User,
            Payload::Group { .. } => Variant::Group,
            Payload::UserToGroupMapping { .. } => Variant::UserToGroupMapping,
            Payload::GroupToGroupMapping { .. } => Variant::GroupToGroupMapping,
            Payload::UserToComponentAccess { .. } => Variant::UserToComponentAccess,
            Payload::GroupToComponentAccess { .. } => Variant::GroupToComponentAccess,
            Payload::EntityType { .. } => Variant::EntityType,
            Payload::Entity { .. } => Variant::Entity,
            Payload::UserToEntityMapping { .. } => Variant::UserToEntityMapping,
            Payload::GroupToEntityMapping { .. } => Variant::GroupToEntityMapping,
        }
    }
}

/// An immutable event record (§3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub action: Action,
    pub occurred_at: DateTime<Utc>,
    pub hash_code: HashCode,
    pub payload: Payload,
}

impl Event {
    pub fn new(action: Action, occurred_at: DateTime<Utc>, hash_code: HashCode, payload: Payload) -> Self {
        Self {
            event_id: EventId::new(),
            action,
            occurred_at,
            hash_code,
            payload,
        }
    }

    pub fn variant(&self) -> Variant {
        self.payload.variant()
    }
}

/// A buffered entry: the event plus the sequence number it was assigned
/// under the sequence lock (I1, I2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferEntry {
    pub event: Event,
    pub seq: u64,
}

impl PartialOrd for BufferEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BufferEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.seq.cmp(&other.seq)
    }
}
