// Persister adapter (§4.5).
//
// Dispatches an `Event` to one of the twenty typed calls on an
// `EventPersister`, wrapping any failure in the uniform envelope the
// spec names: "Failed to persist '<action> <variant>' event.".

use super::{EventMeta, EventPersister};
use crate::error::{AccessError, Result};
use crate::event::{Action, Event, Payload};

/// Object-safe dispatch surface so the flush engine can hold a
/// `Arc<dyn PersisterDispatch>` without knowing the concrete sink type.
pub trait PersisterDispatch: Send + Sync {
    fn dispatch(&self, event: &Event) -> Result<()>;
}

pub struct PersisterAdapter<P: EventPersister> {
    sink: P,
}

impl<P: EventPersister> PersisterAdapter<P> {
    pub fn new(sink: P) -> Self {
        Self { sink }
    }

    fn dispatch_inner(&self, event: &Event) -> Result<()> {
        let meta = EventMeta::from(event);
        match (&event.payload, event.action) {
            (Payload::User { user }, Action::Add) => self.sink.add_user(user, meta),
            (Payload::User { user }, Action::Remove) => self.sink.remove_user(user, meta),
            (Payload::Group { group }, Action::Add) => self.sink.add_group(group, meta),
            (Payload::Group { group }, Action::Remove) => self.sink.remove_group(group, meta),
            (Payload::UserToGroupMapping { user, group }, Action::Add) => {
                self.sink.add_user_to_group_mapping(user, group, meta)
            }
            (Payload::UserToGroupMapping { user, group }, Action::Remove) => {
                self.sink.remove_user_to_group_mapping(user, group, meta)
            }
            (Payload::GroupToGroupMapping { from_group, to_group }, Action::Add) => {
                self.sink.add_group_to_group_mapping(from_group, to_group, meta)
            }
            (Payload::GroupToGroupMapping { from_group, to_group }, Action::Remove) => {
                self.sink.remove_group_to_group_mapping(from_group, to_group, meta)
            }
            (Payload::UserToComponentAccess { user, component, access_level }, Action::Add) => self
                .sink
                .add_user_to_component_access(user, component, access_level, meta),
            (Payload::UserToComponentAccess { user, component, access_level }, Action::Remove) => self
                .sink
                .remove_user_to_component_access(user, component, access_level, meta),
            (Payload::GroupToComponentAccess { group, component, access_level }, Action::Add) => self
                .sink
                .add_group_to_component_access(group, component, access_level, meta),
            (Payload::GroupToComponentAccess { group, component, access_level }, Action::Remove) => self
                .sink
                .remove_group_to_component_access(group, component, access_level, meta),
            (Payload::EntityType { entity_type }, Action::Add) => self.sink.add_entity_type(entity_type, meta),
            (Payload::EntityType { entity_type }, Action::Remove) => {
                self.sink.remove_entity_type(entity_type, meta)
            }
            (Payload::Entity { entity_type, entity }, Action::Add) => {
                self.sink.add_entity(entity_type, entity, meta)
            }
            (Payload::Entity { entity_type, entity }, Action::Remove) => {
                self.sink.remove_entity(entity_type, entity, meta)
            }
            (Payload::UserToEntityMapping { user, entity_type, entity }, Action::Add) => {
                self.sink.add_user_to_entity_mapping(user, entity_type, entity, meta)
            }
            (Payload::UserToEntityMapping { user, entity_type, entity }, Action::Remove) => {
                self.sink.remove_user_to_entity_mapping(user, entity_type, entity, meta)
            }
            (Payload::GroupToEntityMapping { group, entity_type, entity }, Action::Add) => {
                self.sink.add_group_to_entity_mapping(group, entity_type, entity, meta)
            }
            (Payload::GroupToEntityMapping { group, entity_type, entity }, Action::Remove) => {
                self.sink.remove_group_to_entity_mapping(group, entity_type, entity, meta)
            }
        }
    }
}

impl<P: EventPersister> PersisterDispatch for PersisterAdapter<P> {
    fn dispatch(&self, event: &Event) -> Result<()> {
        self.dispatch_inner(event).map_err(|e| {
            AccessError::Persistence(format!(
                "Failed to persist '{} {}' event: {}",
                event.action,
                event.variant(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventId;
    use chrono::Utc;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<String>>,
    }

    impl EventPersister for RecordingSink {
        fn add_user(&self, user: &str, _meta: EventMeta) -> Result<()> {
            self.calls.lock().push(format!("add_user({user})"));
            Ok(())
        }
        fn remove_user(&self, user: &str, _meta: EventMeta) -> Result<()> {
            self.calls.lock().push(format!("remove_user({user})"));
            Ok(())
        }
        fn add_group(&self, _group: &str, _meta: EventMeta) -> Result<()> {
            Ok(())
        }
        fn remove_group(&self, _group: &str, _meta: EventMeta) -> Result<()> {
            Ok(())
        }
        fn add_user_to_group_mapping(&self, _user: &str, _group: &str, _meta: EventMeta) -> Result<()> {
            Ok(())
        }
        fn remove_user_to_group_mapping(&self, _user: &str, _group: &str, _meta: EventMeta) -> Result<()> {
            Ok(())
        }
        fn add_group_to_group_mapping(&self, _from_group: &str, _to_group: &str, _meta: EventMeta) -> Result<()> {
            Ok(())
        }
        fn remove_group_to_group_mapping(&self, _from_group: &str, _to_group: &str, _meta: EventMeta) -> Result<()> {
            Ok(())
        }
        fn add_user_to_component_access(&self, _u: &str, _c: &str, _a: &str, _meta: EventMeta) -> Result<()> {
            Ok(())
        }
        fn remove_user_to_component_access(&self, _u: &str, _c: &str, _a: &str, _meta: EventMeta) -> Result<()> {
            Ok(())
        }
        fn add_group_to_component_access(&self, _g: &str, _c: &str, _a: &str, _meta: EventMeta) -> Result<()> {
            Ok(())
        }
        fn remove_group_to_component_access(&self, _g: &str, _c: &str, _a: &str, _meta: EventMeta) -> Result<()> {
            Ok(())
        }
        fn add_entity_type(&self, _entity_type: &str, _meta: EventMeta) -> Result<()> {
            Err(AccessError::Persistence("disk full".to_string()))
        }
        fn remove_entity_type(&self, _entity_type: &str, _meta: EventMeta) -> Result<()> {
            Ok(())
        }
        fn add_entity(&self, _entity_type: &str, _entity: &str, _meta: EventMeta) -> Result<()> {
            Ok(())
        }
        fn remove_entity(&self, _entity_type: &str, _entity: &str, _meta: EventMeta) -> Result<()> {
            Ok(())
        }
        fn add_user_to_entity_mapping(&self, _u: &str, _et: &str, _e: &str, _meta: EventMeta) -> Result<()> {
            Ok(())
        }
        fn remove_user_to_entity_mapping(&self, _u: &str, _et: &str, _e: &str, _meta: EventMeta) -> Result<()> {
            Ok(())
        }
        fn add_group_to_entity_mapping(&self, _g: &str, _et: &str, _e: &str, _meta: EventMeta) -> Result<()> {
            Ok(())
        }
        fn remove_group_to_entity_mapping(&self, _g: &str, _et: &str, _e: &str, _meta: EventMeta) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn dispatch_routes_to_the_matching_typed_call() {
        let adapter = PersisterAdapter::new(RecordingSink::default());
        let event = Event::new(Action::Add, Utc::now(), 1, Payload::User { user: "alice".into() });
        adapter.dispatch(&event).unwrap();
        assert_eq!(adapter.sink.calls.lock().as_slice(), &["add_user(alice)".to_string()]);
    }

    #[test]
    fn dispatch_wraps_failure_with_action_and_variant_context() {
        let adapter = PersisterAdapter::new(RecordingSink::default());
        let event = Event::new(
            Action::Add,
            Utc::now(),
            1,
            Payload::EntityType { entity_type: "Clearance".into() },
        );
        let err = adapter.dispatch(&event).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Add EntityType"), "{message}");
        assert!(message.contains("disk full"), "{message}");
    }

    #[test]
    fn event_id_is_preserved_into_meta() {
        let id = EventId::new();
        let event = Event { event_id: id, action: Action::Remove, occurred_at: Utc::now(), hash_code: 9, payload: Payload::User { user: "bob".into() } };
        let meta = EventMeta::from(&event);
        assert_eq!(meta.event_id, id);
    }
}
