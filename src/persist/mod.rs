// Persistence capabilities (§6).
//
// Two distinct shapes exist on purpose:
//
// - `EventPersister`: twenty typed, single-event calls (one per variant
//   per action). This is the contract `persist::adapter::PersisterAdapter`
//   dispatches into during a normal flush drain (§4.5).
// - `BulkPersister` / `IdempotentBulkPersister` / `BackupPersister` /
//   `PrimaryReader`: batch-shaped contracts used by the redundant
//   persister (§4.6) and by the split orchestrator when copying a hash
//   range of events to a target shard (§4.8).
//
// `RedundantPersister` (in `redundant.rs`) bridges the two: it implements
// `EventPersister` by wrapping each typed call into a one-element bulk
// `persist` call, which is what makes the data-flow diagram's single box
// "Persister (Redundant -> Primary | Backup)" true in code as well as in
// prose.

pub mod adapter;
pub mod redundant;

use crate::error::Result;
use crate::event::{Event, EventId, HashCode};
use chrono::{DateTime, Utc};

/// The trailing `(id, ts, hash)` triple every §6 typed call carries.
#[derive(Debug, Clone, Copy)]
pub struct EventMeta {
    pub event_id: EventId,
    pub occurred_at: DateTime<Utc>,
    pub hash_code: HashCode,
}

impl From<&Event> for EventMeta {
    fn from(event: &Event) -> Self {
        EventMeta {
            event_id: event.event_id,
            occurred_at: event.occurred_at,
            hash_code: event.hash_code,
        }
    }
}

/// Twenty typed single-event persistence calls (§6).
pub trait EventPersister: Send + Sync {
    fn add_user(&self, user: &str, meta: EventMeta) -> Result<()>;
    fn remove_user(&self, user: &str, meta: EventMeta) -> Result<()>;
    fn add_group(&self, group: &str, meta: EventMeta) -> Result<()>;
    fn remove_group(&self, group: &str, meta: EventMeta) -> Result<()>;
    fn add_user_to_group_mapping(&self, user: &str, group: &str, meta: EventMeta) -> Result<()>;
    fn remove_user_to_group_mapping(&self, user: &str, group: &str, meta: EventMeta) -> Result<()>;
    fn add_group_to_group_mapping(&self, from_group: &str, to_group: &str, meta: EventMeta) -> Result<()>;
    fn remove_group_to_group_mapping(&self, from_group: &str, to_group: &str, meta: EventMeta) -> Result<()>;
    fn add_user_to_component_access(&self, user: &str, component: &str, access_level: &str, meta: EventMeta) -> Result<()>;
    fn remove_user_to_component_access(&self, user: &str, component: &str, access_level: &str, meta: EventMeta) -> Result<()>;
    fn add_group_to_component_access(&self, group: &str, component: &str, access_level: &str, meta: EventMeta) -> Result<()>;
    fn remove_group_to_component_access(&self, group: &str, component: &str, access_level: &str, meta: EventMeta) -> Result<()>;
    fn add_entity_type(&self, entity_type: &str, meta: EventMeta) -> Result<()>;
    fn remove_entity_type(&self, entity_type: &str, meta: EventMeta) -> Result<()>;
    fn add_entity(&self, entity_type: &str, entity: &str, meta: EventMeta) -> Result<()>;
    fn remove_entity(&self, entity_type: &str, entity: &str, meta: EventMeta) -> Result<()>;
    fn add_user_to_entity_mapping(&self, user: &str, entity_type: &str, entity: &str, meta: EventMeta) -> Result<()>;
    fn remove_user_to_entity_mapping(&self, user: &str, entity_type: &str, entity: &str, meta: EventMeta) -> Result<()>;
    fn add_group_to_entity_mapping(&self, group: &str, entity_type: &str, entity: &str, meta: EventMeta) -> Result<()>;
    fn remove_group_to_entity_mapping(&self, group: &str, entity_type: &str, entity: &str, meta: EventMeta) -> Result<()>;
}

/// Plain bulk persister: writes a batch of events, no dedup contract.
/// Used for the backup sink.
pub trait BulkPersister: Send + Sync {
    fn persist(&self, events: &[Event]) -> Result<()>;
}

/// An idempotent bulk persister, keyed by `event_id` (I5). Used for the
/// primary sink.
pub trait IdempotentBulkPersister: Send + Sync {
    fn persist(&self, events: &[Event], ignore_duplicates: bool) -> Result<()>;
}

/// The backup sink additionally supports reading everything back, used
/// on startup replay (§4.6 step 1).
pub trait BackupPersister: BulkPersister {
    fn read_all(&self) -> Result<Vec<Event>>;
}

/// Read path for the primary store, unaffected by the write-side
/// failure latch.
pub trait PrimaryReader: Send + Sync {
    fn load(&self) -> Result<Vec<Event>>;
    fn load_at_event(&self, at_event: EventId) -> Result<Vec<Event>>;
    fn load_at_time(&self, at_time: DateTime<Utc>) -> Result<Vec<Event>>;
}

/// In-memory test doubles, grouped here rather than scattered across
/// `#[cfg(test)]` blocks because both the redundant-persister and the
/// split-orchestrator test suites need them.
pub mod test_doubles {
    use super::*;
    use crate::error::AccessError;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[derive(Default)]
    pub struct InMemoryIdempotentPersister {
        pub events: Mutex<Vec<Event>>,
        pub seen_ids: Mutex<HashSet<EventId>>,
        pub fail_next: Mutex<bool>,
    }

    impl InMemoryIdempotentPersister {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_fail_next(&self, fail: bool) {
            *self.fail_next.lock() = fail;
        }

        pub fn events_snapshot(&self) -> Vec<Event> {
            self.events.lock().clone()
        }
    }

    impl IdempotentBulkPersister for InMemoryIdempotentPersister {
        fn persist(&self, events: &[Event], ignore_duplicates: bool) -> Result<()> {
            if *self.fail_next.lock() {
                *self.fail_next.lock() = false;
                return Err(AccessError::Persistence("primary sink unavailable".to_string()));
            }
            let mut seen = self.seen_ids.lock();
            let mut stored = self.events.lock();
            for event in events {
                if seen.contains(&event.event_id) {
                    if ignore_duplicates {
                        continue;
                    }
                    return Err(AccessError::Persistence(format!(
                        "duplicate event_id {}",
                        event.event_id
                    )));
                }
                seen.insert(event.event_id);
                stored.push(event.clone());
            }
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct InMemoryBackupPersister {
        pub events: Mutex<Vec<Event>>,
        pub fail_read: Mutex<bool>,
    }

    impl InMemoryBackupPersister {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed(&self, events: Vec<Event>) {
            *self.events.lock() = events;
        }
    }

    impl BulkPersister for InMemoryBackupPersister {
        fn persist(&self, events: &[Event]) -> Result<()> {
            self.events.lock().extend(events.iter().cloned());
            Ok(())
        }
    }

    impl BackupPersister for InMemoryBackupPersister {
        fn read_all(&self) -> Result<Vec<Event>> {
            if *self.fail_read.lock() {
                return Err(AccessError::Persistence("backup unreadable".to_string()));
            }
            Ok(self.events.lock().clone())
        }
    }
}
