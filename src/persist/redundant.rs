// Redundant persister (§4.6).
//
// Wraps an idempotent primary sink and a backup sink. On the first write
// after process start, replays anything the backup holds that the
// primary doesn't, then persists normally. Once the primary fails, every
// subsequent write for the lifetime of the process routes to the backup
// only — `primary_failed` is a one-way latch, not a health-checked
// circuit breaker (see SPEC_FULL.md's open-question decision on this).
//
// Reads (`load`, `load_at_event`, `load_at_time`) go through a separate
// `PrimaryReader` and are never affected by the write-side latch.

use super::{BackupPersister, EventMeta, EventPersister, IdempotentBulkPersister, PrimaryReader};
use crate::error::{AccessError, Result};
use crate::event::{Action, Event, EventId, Payload};
use crate::metrics::MetricLogger;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct RedundantPersister {
    primary: Arc<dyn IdempotentBulkPersister>,
    backup: Arc<dyn BackupPersister>,
    reader: Arc<dyn PrimaryReader>,
    metrics: Arc<dyn MetricLogger>,
    first_call_done: AtomicBool,
    primary_failed: AtomicBool,
    /// Serializes the startup-replay check so two racing first calls
    /// don't both replay.
    startup_gate: Mutex<()>,
}

impl RedundantPersister {
    pub fn new(
        primary: Arc<dyn IdempotentBulkPersister>,
        backup: Arc<dyn BackupPersister>,
        reader: Arc<dyn PrimaryReader>,
        metrics: Arc<dyn MetricLogger>,
    ) -> Self {
        Self {
            primary,
            backup,
            reader,
            metrics,
            first_call_done: AtomicBool::new(false),
            primary_failed: AtomicBool::new(false),
            startup_gate: Mutex::new(()),
        }
    }

    pub fn primary_has_failed(&self) -> bool {
        self.primary_failed.load(Ordering::SeqCst)
    }

    /// Writes `events` to the primary (replaying backup-only history on
    /// the first call), falling back to backup-only once the primary has
    /// ever failed.
    pub fn persist(&self, events: &[Event], ignore_duplicates: bool) -> Result<()> {
        if !self.first_call_done.swap(true, Ordering::SeqCst) {
            let _gate = self.startup_gate.lock();
            self.replay_backup_into_primary(events)?;
        }

        if self.primary_failed.load(Ordering::SeqCst) {
            self.metrics.increment("events-flushed-from-backup", events.len() as u64);
            return self.backup.persist(events);
        }

        match self.primary.persist(events, ignore_duplicates) {
            Ok(()) => Ok(()),
            Err(primary_err) => {
                self.primary_failed.store(true, Ordering::SeqCst);
                self.metrics.increment("primary-failures", 1);
                match self.backup.persist(events) {
                    Ok(()) => Err(primary_err),
                    Err(backup_err) => Err(AccessError::aggregate(primary_err, backup_err)),
                }
            }
        }
    }

    /// Startup replay: whatever the backup holds that the primary
    /// doesn't (by event_id) gets pushed into the primary, duplicates
    /// ignored. If that push fails, `incoming` (the events this very
    /// `persist()` call was asked to write) has nowhere else to go --
    /// both the stray backup events and `incoming` are written to
    /// backup together so nothing this call touched is dropped.
    fn replay_backup_into_primary(&self, incoming: &[Event]) -> Result<()> {
        let backup_events = self.backup.read_all()?;
        if backup_events.is_empty() {
            return Ok(());
        }
        let primary_events = self.reader.load()?;
        let known: HashSet<EventId> = primary_events.iter().map(|e| e.event_id).collect();
        let missing: Vec<Event> = backup_events
            .into_iter()
            .filter(|e| !known.contains(&e.event_id))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        if let Err(primary_err) = self.primary.persist(&missing, true) {
            self.primary_failed.store(true, Ordering::SeqCst);
            self.metrics.increment("write-to-primary-failed", 1);
            let written = missing.len() + incoming.len();
            let mut to_backup = missing;
            to_backup.extend(incoming.iter().cloned());
            return match self.backup.persist(&to_backup) {
                Ok(()) => {
                    self.metrics.increment("events-written-to-backup", written as u64);
                    Err(primary_err)
                }
                Err(backup_err) => Err(AccessError::aggregate(primary_err, backup_err)),
            };
        }

        self.metrics.increment("events-replayed-on-startup", missing.len() as u64);
        Ok(())
    }
}

fn single_event(action: Action, meta: EventMeta, payload: Payload) -> Event {
    Event { event_id: meta.event_id, action, occurred_at: meta.occurred_at, hash_code: meta.hash_code, payload }
}

/// `RedundantPersister` satisfies the twenty-typed-call contract by
/// wrapping each call into a one-element bulk `persist`, which is what
/// makes it usable as the sink a `persist::adapter::PersisterAdapter`
/// dispatches into.
impl EventPersister for RedundantPersister {
    fn add_user(&self, user: &str, meta: EventMeta) -> Result<()> {
        self.persist(&[single_event(Action::Add, meta, Payload::User { user: user.to_string() })], false)
    }
    fn remove_user(&self, user: &str, meta: EventMeta) -> Result<()> {
        self.persist(&[single_event(Action::Remove, meta, Payload::User { user: user.to_string() })], false)
    }
    fn add_group(&self, group: &str, meta: EventMeta) -> Result<()> {
        self.persist(&[single_event(Action::Add, meta, Payload::Group { group: group.to_string() })], false)
    }
    fn remove_group(&self, group: &str, meta: EventMeta) -> Result<()> {
        self.persist(&[single_event(Action::Remove, meta, Payload::Group { group: group.to_string() })], false)
    }
    fn add_user_to_group_mapping(&self, user: &str, group: &str, meta: EventMeta) -> Result<()> {
        self.persist(
            &[single_event(Action::Add, meta, Payload::UserToGroupMapping { user: user.to_string(), group: group.to_string() })],
            false,
        )
    }
    fn remove_user_to_group_mapping(&self, user: &str, group: &str, meta: EventMeta) -> Result<()> {
        self.persist(
            &[single_event(Action::Remove, meta, Payload::UserToGroupMapping { user: user.to_string(), group: group.to_string() })],
            false,
        )
    }
    fn add_group_to_group_mapping(&self, from_group: &str, to_group: &str, meta: EventMeta) -> Result<()> {
        self.persist(
            &[single_event(
                Action::Add,
                meta,
                Payload::GroupToGroupMapping { from_group: from_group.to_string(), to_group: to_group.to_string() },
            )],
            false,
        )
    }
    fn remove_group_to_group_mapping(&self, from_group: &str, to_group: &str, meta: EventMeta) -> Result<()> {
        self.persist(
            &[single_event(
                Action::Remove,
                meta,
                Payload::GroupToGroupMapping { from_group: from_group.to_string(), to_group: to_group.to_string() },
            )],
            false,
        )
    }
    fn add_user_to_component_access(&self, user: &str, component: &str, access_level: &str, meta: EventMeta) -> Result<()> {
        self.persist(
            &[single_event(
                Action::Add,
                meta,
                Payload::UserToComponentAccess {
                    user: user.to_string(),
                    component: component.to_string(),
                    access_level: access_level.to_string(),
                },
            )],
            false,
        )
    }
    fn remove_user_to_component_access(&self, user: &str, component: &str, access_level: &str, meta: EventMeta) -> Result<()> {
        self.persist(
            &[single_event(
                Action::Remove,
                meta,
                Payload::UserToComponentAccess {
                    user: user.to_string(),
                    component: component.to_string(),
                    access_level: access_level.to_string(),
                },
            )],
            false,
        )
    }
    fn add_group_to_component_access(&self, group: &str, component: &str, access_level: &str, meta: EventMeta) -> Result<()> {
        self.persist(
            &[single_event(
                Action::Add,
                meta,
                Payload::GroupToComponentAccess {
                    group: group.to_string(),
                    component: component.to_string(),
                    access_level: access_level.to_string(),
                },
            )],
            false,
        )
    }
    fn remove_group_to_component_access(&self, group: &str, component: &str, access_level: &str, meta: EventMeta) -> Result<()> {
        self.persist(
            &[single_event(
                Action::Remove,
                meta,
                Payload::GroupToComponentAccess {
                    group: group.to_string(),
                    component: component.to_string(),
                    access_level: access_level.to_string(),
                },
            )],
            false,
        )
    }
    fn add_entity_type(&self, entity_type: &str, meta: EventMeta) -> Result<()> {
        self.persist(&[single_event(Action::Add, meta, Payload::EntityType { entity_type: entity_type.to_string() })], false)
    }
    fn remove_entity_type(&self, entity_type: &str, meta: EventMeta) -> Result<()> {
        self.persist(&[single_event(Action::Remove, meta, Payload::EntityType { entity_type: entity_type.to_string() })], false)
    }
    fn add_entity(&self, entity_type: &str, entity: &str, meta: EventMeta) -> Result<()> {
        self.persist(
            &[single_event(Action::Add, meta, Payload::Entity { entity_type: entity_type.to_string(), entity: entity.to_string() })],
            false,
        )
    }
    fn remove_entity(&self, entity_type: &str, entity: &str, meta: EventMeta) -> Result<()> {
        self.persist(
            &[single_event(Action::Remove, meta, Payload::Entity { entity_type: entity_type.to_string(), entity: entity.to_string() })],
            false,
        )
    }
    fn add_user_to_entity_mapping(&self, user: &str, entity_type: &str, entity: &str, meta: EventMeta) -> Result<()> {
        self.persist(
            &[single_event(
                Action::Add,
                meta,
                Payload::UserToEntityMapping { user: user.to_string(), entity_type: entity_type.to_string(), entity: entity.to_string() },
            )],
            false,
        )
    }
    fn remove_user_to_entity_mapping(&self, user: &str, entity_type: &str, entity: &str, meta: EventMeta) -> Result<()> {
        self.persist(
            &[single_event(
                Action::Remove,
                meta,
                Payload::UserToEntityMapping { user: user.to_string(), entity_type: entity_type.to_string(), entity: entity.to_string() },
            )],
            false,
        )
    }
    fn add_group_to_entity_mapping(&self, group: &str, entity_type: &str, entity: &str, meta: EventMeta) -> Result<()> {
        self.persist(
            &[single_event(
                Action::Add,
                meta,
                Payload::GroupToEntityMapping { group: group.to_string(), entity_type: entity_type.to_string(), entity: entity.to_string() },
            )],
            false,
        )
    }
    fn remove_group_to_entity_mapping(&self, group: &str, entity_type: &str, entity: &str, meta: EventMeta) -> Result<()> {
        self.persist(
            &[single_event(
                Action::Remove,
                meta,
                Payload::GroupToEntityMapping { group: group.to_string(), entity_type: entity_type.to_string(), entity: entity.to_string() },
            )],
            false,
        )
    }
}

/// In-memory `PrimaryReader` test double backed by the same store as
/// `test_doubles::InMemoryIdempotentPersister`.
pub struct InMemoryPrimaryReader {
    source: Arc<super::test_doubles::InMemoryIdempotentPersister>,
}

impl InMemoryPrimaryReader {
    pub fn new(source: Arc<super::test_doubles::InMemoryIdempotentPersister>) -> Self {
        Self { source }
    }
}

impl PrimaryReader for InMemoryPrimaryReader {
    fn load(&self) -> Result<Vec<Event>> {
        Ok(self.source.events_snapshot())
    }
    fn load_at_event(&self, at_event: EventId) -> Result<Vec<Event>> {
        let all = self.source.events_snapshot();
        let idx = all.iter().position(|e| e.event_id == at_event);
        Ok(match idx {
            Some(i) => all[..=i].to_vec(),
            None => Vec::new(),
        })
    }
    fn load_at_time(&self, at_time: DateTime<Utc>) -> Result<Vec<Event>> {
        Ok(self.source.events_snapshot().into_iter().filter(|e| e.occurred_at <= at_time).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventId;
    use crate::metrics::InMemoryMetricLogger;
    use crate::persist::test_doubles::{InMemoryBackupPersister, InMemoryIdempotentPersister};

    fn harness() -> (
        Arc<InMemoryIdempotentPersister>,
        Arc<InMemoryBackupPersister>,
        Arc<InMemoryMetricLogger>,
        RedundantPersister,
    ) {
        let primary = Arc::new(InMemoryIdempotentPersister::new());
        let backup = Arc::new(InMemoryBackupPersister::new());
        let metrics = Arc::new(InMemoryMetricLogger::new());
        let reader = Arc::new(InMemoryPrimaryReader::new(primary.clone()));
        let redundant = RedundantPersister::new(primary.clone(), backup.clone(), reader, metrics.clone());
        (primary, backup, metrics, redundant)
    }

    fn sample_event(hash: i32) -> Event {
        Event::new(Action::Add, Utc::now(), hash, Payload::User { user: format!("user-{hash}") })
    }

    #[test]
    fn healthy_path_writes_to_primary_only() {
        let (primary, backup, _metrics, redundant) = harness();
        let event = sample_event(1);
        redundant.persist(&[event.clone()], false).unwrap();
        assert_eq!(primary.events_snapshot(), vec![event]);
        assert!(backup.events.lock().is_empty(), "steady-state writes must not touch backup (S3)");
    }

    #[test]
    fn primary_failure_latches_and_routes_subsequent_writes_to_backup_only() {
        let (primary, backup, metrics, redundant) = harness();
        primary.set_fail_next(true);

        let first = sample_event(1);
        let err = redundant.persist(&[first], false).unwrap_err();
        assert!(err.to_string().contains("unavailable"));
        assert!(redundant.primary_has_failed());
        assert_eq!(metrics.get("primary-failures"), 1);

        let second = sample_event(2);
        redundant.persist(&[second.clone()], false).unwrap();
        assert_eq!(backup.events.lock().last().cloned(), Some(second));
        assert!(primary.events_snapshot().iter().all(|e| e.hash_code != 2));
    }

    #[test]
    fn startup_replay_pushes_backup_only_events_into_primary() {
        let primary = Arc::new(InMemoryIdempotentPersister::new());
        let backup = Arc::new(InMemoryBackupPersister::new());
        let stray = sample_event(99);
        backup.seed(vec![stray.clone()]);
        let metrics = Arc::new(InMemoryMetricLogger::new());
        let reader = Arc::new(InMemoryPrimaryReader::new(primary.clone()));
        let redundant = RedundantPersister::new(primary.clone(), backup.clone(), reader, metrics.clone());

        redundant.persist(&[sample_event(1)], false).unwrap();

        assert!(primary.events_snapshot().iter().any(|e| e.event_id == stray.event_id));
        assert_eq!(metrics.get("events-replayed-on-startup"), 1);
    }

    // S4: the backup holds stray events from a prior crash, and the
    // very first write after restart finds the primary still down. Both
    // the stray events and the incoming batch must land in backup, the
    // latch must flip, and the caller still sees the primary's failure.
    #[test]
    fn startup_replay_failure_writes_stray_and_incoming_events_to_backup() {
        let primary = Arc::new(InMemoryIdempotentPersister::new());
        let backup = Arc::new(InMemoryBackupPersister::new());
        let stray = vec![sample_event(90), sample_event(91), sample_event(92)];
        backup.seed(stray.clone());
        let metrics = Arc::new(InMemoryMetricLogger::new());
        let reader = Arc::new(InMemoryPrimaryReader::new(primary.clone()));
        let redundant = RedundantPersister::new(primary.clone(), backup.clone(), reader, metrics.clone());

        primary.set_fail_next(true);
        let incoming = vec![sample_event(1), sample_event(2)];
        let err = redundant.persist(&incoming, false).unwrap_err();
        assert!(err.to_string().contains("unavailable"));

        assert!(redundant.primary_has_failed());
        assert_eq!(metrics.get("write-to-primary-failed"), 1);
        assert_eq!(metrics.get("events-written-to-backup"), 5);

        let backed_up = backup.events.lock().clone();
        for stray_event in &stray {
            assert!(backed_up.iter().any(|e| e.event_id == stray_event.event_id));
        }
        for incoming_event in &incoming {
            assert!(backed_up.iter().any(|e| e.event_id == incoming_event.event_id));
        }
        assert!(primary.events_snapshot().iter().all(|e| e.hash_code != 1 && e.hash_code != 2));
    }

    #[test]
    fn typed_call_reaches_the_underlying_sinks() {
        let (primary, _backup, _metrics, redundant) = harness();
        let meta = EventMeta { event_id: EventId::new(), occurred_at: Utc::now(), hash_code: 5 };
        redundant.add_user("carol", meta).unwrap();
        assert!(primary.events_snapshot().iter().any(|e| matches!(&e.payload, Payload::User { user } if user == "carol")));
    }

    #[test]
    fn reader_is_unaffected_by_write_side_latch() {
        let (primary, _backup, _metrics, redundant) = harness();
        primary.set_fail_next(true);
        let _ = redundant.persist(&[sample_event(1)], false);
        // load() goes through the InMemoryPrimaryReader directly, bypassing
        // the latch entirely -- confirm the reader still answers normally.
        let reader = InMemoryPrimaryReader::new(primary.clone());
        assert!(reader.load().unwrap().is_empty());
    }
}
