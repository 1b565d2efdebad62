// Event validator contract (§4.1).
//
// A validator runs synchronously, under the caller's already-acquired
// buffer lock(s), and decides whether a pending write may be enqueued. It
// communicates that decision by invoking (or not invoking) a deferred
// "buffering action" exactly once, rather than returning a bool, so that
// the actual enqueue ordering stays entirely inside the validator's
// control — this matters for dependency-free variants that must buffer a
// derived prerequisite event *before* the event that required it.

use super::{Action, HashCode, Key, Payload};
use crate::error::{AccessError, Result};

/// A not-yet-sequenced, not-yet-buffered event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEvent {
    pub action: Action,
    pub hash_code: HashCode,
    pub payload: Payload,
}

/// Deferred callback that performs the actual enqueue (sequence
/// allocation + queue push) for the event under validation. Must be
/// invoked at most once.
pub type BufferingAction<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

/// Capability handed to a validator so it can buffer *additional* events
/// that a dependency-free variant implies, recursively, under the locks
/// the caller already holds (see `lock::LockManager::is_held_by_current`).
pub trait DerivedEventSink: Send + Sync {
    /// Ensures an `EntityType` exists, buffering an `Add(EntityType)`
    /// event first if it is not already known to this shard's in-memory
    /// state. A no-op if the type is already present.
    fn ensure_entity_type(&self, entity_type: &Key, hash_code: HashCode) -> Result<()>;
}

/// Pluggable validation contract.
///
/// On success, `validate` invokes `buffer_action` exactly once and
/// returns `Ok(())`. On failure, it must not invoke `buffer_action` and
/// returns the originating failure reason.
pub trait EventValidator: Send + Sync {
    fn validate(
        &self,
        pending: &PendingEvent,
        buffer_action: BufferingAction<'_>,
        derived: &dyn DerivedEventSink,
    ) -> Result<()>;
}

/// The validator used when no domain-specific rules are supplied: checks
/// that opaque keys are non-empty, and implements the one dependency-free
/// rule the spec names explicitly — adding an `Entity` virtually ensures
/// its `EntityType`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEventValidator;

impl DefaultEventValidator {
    fn check_key(key: &str, field: &str) -> Result<()> {
        if key.trim().is_empty() {
            return Err(AccessError::Validation(format!("'{field}' must not be empty")));
        }
        Ok(())
    }

    fn check_payload(payload: &Payload) -> Result<()> {
        match payload {
            Payload::User { user } => Self::check_key(user, "user"),
            Payload::Group { group } => Self::check_key(group, "group"),
            Payload::UserToGroupMapping { user, group } => {
                Self::check_key(user, "user")?;
                Self::check_key(group, "group")
            }
            Payload::GroupToGroupMapping { from_group, to_group } => {
                if from_group == to_group {
                    return Err(AccessError::Validation(
                        "a group cannot map to itself".to_string(),
                    ));
                }
                Self::check_key(from_group, "from_group")?;
                Self::check_key(to_group, "to_group")
            }
            Payload::UserToComponentAccess { user, component, access_level } => {
                Self::check_key(user, "user")?;
                Self::check_key(component, "component")?;
                Self::check_key(access_level, "access_level")
            }
            Payload::GroupToComponentAccess { group, component, access_level } => {
                Self::check_key(group, "group")?;
                Self::check_key(component, "component")?;
                Self::check_key(access_level, "access_level")
            }
            Payload::EntityType { entity_type } => Self::check_key(entity_type, "entity_type"),
            Payload::Entity { entity_type, entity } => {
                Self::check_key(entity_type, "entity_type")?;
                Self::check_key(entity, "entity")
            }
            Payload::UserToEntityMapping { user, entity_type, entity } => {
                Self::check_key(user, "user")?;
                Self::check_key(entity_type, "entity_type")?;
                Self::check_key(entity, "entity")
            }
            Payload::GroupToEntityMapping { group, entity_type, entity } => {
                Self::check_key(group, "group")?;
                Self::check_key(entity_type, "entity_type")?;
                Self::check_key(entity, "entity")
            }
        }
    }
}

impl EventValidator for DefaultEventValidator {
    fn validate(
        &self,
        pending: &PendingEvent,
        buffer_action: BufferingAction<'_>,
        derived: &dyn DerivedEventSink,
    ) -> Result<()> {
        Self::check_payload(&pending.payload)?;

        if pending.action == Action::Add {
            if let Payload::Entity { entity_type, .. } = &pending.payload {
                derived.ensure_entity_type(entity_type, pending.hash_code)?;
            }
        }

        buffer_action()
    }
}
