// Buffer (§4.3).
//
// Ten FIFO queues, one per `Variant`, behind a single lock manager. Every
// `add_*`/`remove_*` call: acquires its variant's lock set (mode depends
// on Add vs. Remove), runs the event through the validator, has the
// validator's buffering action allocate a sequence number and enqueue,
// then notifies the flush strategy of the new total.
//
// Flush is triggered either directly (tests, the split orchestrator's
// forced drain) or asynchronously: `FlushStrategy` implementations are
// handed a `FlushSignal` at construction rather than a back-reference to
// `Buffer`, so the strategy can request a flush without the buffer and
// the strategy owning each other.

pub mod flush;

use crate::clock::SequenceAllocator;
use crate::error::{AccessError, Result};
use crate::event::validator::{BufferingAction, DerivedEventSink, EventValidator, PendingEvent};
use crate::event::{Action, BufferEntry, Event, HashCode, Key, Payload, Variant};
use crate::lock::{AcquireMode, LockManager};
use crate::metrics::MetricLogger;
use crate::persist::adapter::PersisterDispatch;
use dashmap::DashSet;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn variant_index(variant: Variant) -> usize {
    Variant::ALL.iter().position(|v| *v == variant).expect("Variant::ALL is exhaustive")
}

/// Lets a `FlushStrategy` request a flush without holding a reference
/// back to the `Buffer` that owns it.
#[derive(Clone)]
pub struct FlushSignal(crossbeam::channel::Sender<()>);

impl FlushSignal {
    pub fn request(&self) {
        let _ = self.0.try_send(());
    }
}

/// Decides when buffered writes should be flushed. Time-based,
/// count-based, or a combination; the strategy calls `signal.request()`
/// whenever its condition is met.
pub trait FlushStrategy: Send + Sync {
    fn on_buffered(&self, total_buffered: u64, signal: &FlushSignal);
}

/// Flushes every `threshold`-th buffered event.
pub struct CountTriggeredFlushStrategy {
    threshold: u64,
}

impl CountTriggeredFlushStrategy {
    pub fn new(threshold: u64) -> Self {
        assert!(threshold > 0, "flush threshold must be positive");
        Self { threshold }
    }
}

impl FlushStrategy for CountTriggeredFlushStrategy {
    fn on_buffered(&self, total_buffered: u64, signal: &FlushSignal) {
        if total_buffered % self.threshold == 0 {
            signal.request();
        }
    }
}

/// Never requests a flush on its own; useful in tests that call
/// `Buffer::flush` directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualFlushStrategy;

impl FlushStrategy for ManualFlushStrategy {
    fn on_buffered(&self, _total_buffered: u64, _signal: &FlushSignal) {}
}

/// Everything the flush engine needs back out of a successful or
/// partially-successful drain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed: u64,
    pub excluded_from_flush: u64,
}

pub struct Buffer {
    queues: [Mutex<VecDeque<BufferEntry>>; 10],
    sequencer: SequenceAllocator,
    lock_manager: Arc<LockManager>,
    validator: Arc<dyn EventValidator>,
    metrics: Arc<dyn MetricLogger>,
    persister: Arc<dyn PersisterDispatch>,
    flush_strategy: Arc<dyn FlushStrategy>,
    flush_signal: FlushSignal,
    flush_request_rx: crossbeam::channel::Receiver<()>,
    total_buffered: AtomicU64,
    latched_flush_error: Mutex<Option<AccessError>>,
    known_entity_types: DashSet<Key>,
}

impl Buffer {
    pub fn new(
        lock_manager: Arc<LockManager>,
        validator: Arc<dyn EventValidator>,
        metrics: Arc<dyn MetricLogger>,
        persister: Arc<dyn PersisterDispatch>,
        flush_strategy: Arc<dyn FlushStrategy>,
        sequencer: SequenceAllocator,
    ) -> Arc<Self> {
        let (tx, rx) = crossbeam::channel::unbounded();
        Arc::new(Self {
            queues: Default::default(),
            sequencer,
            lock_manager,
            validator,
            metrics,
            persister,
            flush_strategy,
            flush_signal: FlushSignal(tx),
            flush_request_rx: rx,
            total_buffered: AtomicU64::new(0),
            latched_flush_error: Mutex::new(None),
            known_entity_types: DashSet::new(),
        })
    }

    /// Spawns the background worker that blocks on the flush-request
    /// channel and flushes whenever the strategy signals. Any error is
    /// latched and resurfaced to the next `add_*`/`remove_*` caller.
    pub fn spawn_worker(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        let buffer = Arc::clone(self);
        std::thread::spawn(move || {
            while buffer.flush_request_rx.recv().is_ok() {
                if let Err(e) = buffer.flush() {
                    *buffer.latched_flush_error.lock() = Some(e);
                }
            }
        })
    }

    fn check_latched_error(&self) -> Result<()> {
        if let Some(e) = self.latched_flush_error.lock().take() {
            return Err(AccessError::BufferFlushing(format!(
                "a prior background flush failed: {e}"
            )));
        }
        Ok(())
    }

    fn mode_for(action: Action) -> AcquireMode {
        match action {
            Action::Add => AcquireMode::AddDependencies,
            Action::Remove => AcquireMode::RemoveDependents,
        }
    }

    /// Shared write path for all twenty `add_*`/`remove_*` entry points.
    fn write(&self, action: Action, hash_code: HashCode, payload: Payload) -> Result<()> {
        self.check_latched_error()?;

        let variant = payload.variant();
        let _guard = self.lock_manager.acquire(Self::mode_for(action), variant);

        let pending = PendingEvent { action, hash_code, payload: payload.clone() };
        let buffer_action: BufferingAction<'_> = Box::new(|| self.enqueue(action, hash_code, payload));
        self.validator.validate(&pending, buffer_action, self)?;

        let total = self.total_buffered.load(Ordering::SeqCst);
        self.flush_strategy.on_buffered(total, &self.flush_signal);
        Ok(())
    }

    fn enqueue(&self, action: Action, hash_code: HashCode, payload: Payload) -> Result<()> {
        let variant = payload.variant();
        if action == Action::Add && matches!(payload, Payload::EntityType { .. }) {
            if let Payload::EntityType { entity_type } = &payload {
                self.known_entity_types.insert(entity_type.clone());
            }
        }
        if action == Action::Remove {
            if let Payload::EntityType { entity_type } = &payload {
                self.known_entity_types.remove(entity_type);
            }
        }

        let (seq, occurred_at) = self.sequencer.next();
        let event = Event::new(action, occurred_at, hash_code, payload);
        self.queues[variant_index(variant)].lock().push_back(BufferEntry { event, seq });
        self.total_buffered.fetch_add(1, Ordering::SeqCst);
        self.metrics.increment("events-buffered", 1);
        Ok(())
    }

    pub fn add_user(&self, user: impl Into<Key>, hash_code: HashCode) -> Result<()> {
        self.write(Action::Add, hash_code, Payload::User { user: user.into() })
    }
    pub fn remove_user(&self, user: impl Into<Key>, hash_code: HashCode) -> Result<()> {
        self.write(Action::Remove, hash_code, Payload::User { user: user.into() })
    }
    pub fn add_group(&self, group: impl Into<Key>, hash_code: HashCode) -> Result<()> {
        self.write(Action::Add, hash_code, Payload::Group { group: group.into() })
    }
    pub fn remove_group(&self, group: impl Into<Key>, hash_code: HashCode) -> Result<()> {
        self.write(Action::Remove, hash_code, Payload::Group { group: group.into() })
    }
    pub fn add_user_to_group_mapping(&self, user: impl Into<Key>, group: impl Into<Key>, hash_code: HashCode) -> Result<()> {
        self.write(Action::Add, hash_code, Payload::UserToGroupMapping { user: user.into(), group: group.into() })
    }
    pub fn remove_user_to_group_mapping(&self, user: impl Into<Key>, group: impl Into<Key>, hash_code: HashCode) -> Result<()> {
        self.write(Action::Remove, hash_code, Payload::UserToGroupMapping { user: user.into(), group: group.into() })
    }
    pub fn add_group_to_group_mapping(&self, from_group: impl Into<Key>, to_group: impl Into<Key>, hash_code: HashCode) -> Result<()> {
        self.write(Action::Add, hash_code, Payload::GroupToGroupMapping { from_group: from_group.into(), to_group: to_group.into() })
    }
    pub fn remove_group_to_group_mapping(&self, from_group: impl Into<Key>, to_group: impl Into<Key>, hash_code: HashCode) -> Result<()> {
        self.write(Action::Remove, hash_code, Payload::GroupToGroupMapping { from_group: from_group.into(), to_group: to_group.into() })
    }
    pub fn add_user_to_component_access(
        &self,
        user: impl Into<Key>,
        component: impl Into<Key>,
        access_level: impl Into<Key>,
        hash_code: HashCode,
    ) -> Result<()> {
        self.write(
            Action::Add,
            hash_code,
            Payload::UserToComponentAccess { user: user.into(), component: component.into(), access_level: access_level.into() },
        )
    }
    pub fn remove_user_to_component_access(
        &self,
        user: impl Into<Key>,
        component: impl Into<Key>,
        access_level: impl Into<Key>,
        hash_code: HashCode,
    ) -> Result<()> {
        self.write(
            Action::Remove,
            hash_code,
            Payload::UserToComponentAccess { user: user.into(), component: component.into(), access_level: access_level.into() },
        )
    }
    pub fn add_group_to_component_access(
        &self,
        group: impl Into<Key>,
        component: impl Into<Key>,
        access_level: impl Into<Key>,
        hash_code: HashCode,
    ) -> Result<()> {
        self.write(
            Action::Add,
            hash_code,
            Payload::GroupToComponentAccess { group: group.into(), component: component.into(), access_level: access_level.into() },
        )
    }
    pub fn remove_group_to_component_access(
        &self,
        group: impl Into<Key>,
        component: impl Into<Key>,
        access_level: impl Into<Key>,
        hash_code: HashCode,
    ) -> Result<()> {
        self.write(
            Action::Remove,
            hash_code,
            Payload::GroupToComponentAccess { group: group.into(), component: component.into(), access_level: access_level.into() },
        )
    }
    pub fn add_entity_type(&self, entity_type: impl Into<Key>, hash_code: HashCode) -> Result<()> {
        self.write(Action::Add, hash_code, Payload::EntityType { entity_type: entity_type.into() })
    }
    pub fn remove_entity_type(&self, entity_type: impl Into<Key>, hash_code: HashCode) -> Result<()> {
        self.write(Action::Remove, hash_code, Payload::EntityType { entity_type: entity_type.into() })
    }
    pub fn add_entity(&self, entity_type: impl Into<Key>, entity: impl Into<Key>, hash_code: HashCode) -> Result<()> {
        self.write(Action::Add, hash_code, Payload::Entity { entity_type: entity_type.into(), entity: entity.into() })
    }
    pub fn remove_entity(&self, entity_type: impl Into<Key>, entity: impl Into<Key>, hash_code: HashCode) -> Result<()> {
        self.write(Action::Remove, hash_code, Payload::Entity { entity_type: entity_type.into(), entity: entity.into() })
    }
    pub fn add_user_to_entity_mapping(
        &self,
        user: impl Into<Key>,
        entity_type: impl Into<Key>,
        entity: impl Into<Key>,
        hash_code: HashCode,
    ) -> Result<()> {
        self.write(
            Action::Add,
            hash_code,
            Payload::UserToEntityMapping { user: user.into(), entity_type: entity_type.into(), entity: entity.into() },
        )
    }
    pub fn remove_user_to_entity_mapping(
        &self,
        user: impl Into<Key>,
        entity_type: impl Into<Key>,
        entity: impl Into<Key>,
        hash_code: HashCode,
    ) -> Result<()> {
        self.write(
            Action::Remove,
            hash_code,
            Payload::UserToEntityMapping { user: user.into(), entity_type: entity_type.into(), entity: entity.into() },
        )
    }
    pub fn add_group_to_entity_mapping(
        &self,
        group: impl Into<Key>,
        entity_type: impl Into<Key>,
        entity: impl Into<Key>,
        hash_code: HashCode,
    ) -> Result<()> {
        self.write(
            Action::Add,
            hash_code,
            Payload::GroupToEntityMapping { group: group.into(), entity_type: entity_type.into(), entity: entity.into() },
        )
    }
    pub fn remove_group_to_entity_mapping(
        &self,
        group: impl Into<Key>,
        entity_type: impl Into<Key>,
        entity: impl Into<Key>,
        hash_code: HashCode,
    ) -> Result<()> {
        self.write(
            Action::Remove,
            hash_code,
            Payload::GroupToEntityMapping { group: group.into(), entity_type: entity_type.into(), entity: entity.into() },
        )
    }

    /// Total events currently sitting in every queue combined.
    pub fn pending_count(&self) -> u64 {
        self.queues.iter().map(|q| q.lock().len() as u64).sum()
    }

    pub fn pending_count_for(&self, variant: Variant) -> usize {
        self.queues[variant_index(variant)].lock().len()
    }

    /// Drains every queue in strict global sequence order and hands each
    /// event to the persister adapter (§4.4). Safe to call concurrently
    /// with `add_*`/`remove_*`: only entries sequenced before the
    /// snapshot's high-water mark are drained, so writes racing the flush
    /// are simply left for the next one.
    pub fn flush(&self) -> Result<FlushReport> {
        flush::run(self)
    }
}

impl DerivedEventSink for Buffer {
    fn ensure_entity_type(&self, entity_type: &Key, hash_code: HashCode) -> Result<()> {
        if self.known_entity_types.contains(entity_type) {
            return Ok(());
        }
        // Recursive call: EntityType is dependency-free (no ancestors),
        // so acquiring its own lock here never conflicts with the
        // Entity lock the outer `write` call already holds.
        let _single = self.lock_manager.acquire_single_if_needed(Variant::EntityType);
        self.enqueue(Action::Add, hash_code, Payload::EntityType { entity_type: entity_type.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{SequenceAllocator, SteppingClock};
    use crate::event::validator::DefaultEventValidator;
    use crate::metrics::InMemoryMetricLogger;
    use crate::persist::adapter::PersisterDispatch;
    use parking_lot::Mutex as PMutex;

    struct NullDispatch;
    impl PersisterDispatch for NullDispatch {
        fn dispatch(&self, _event: &Event) -> Result<()> {
            Ok(())
        }
    }

    struct RecordingDispatch {
        seen: PMutex<Vec<Event>>,
    }
    impl PersisterDispatch for RecordingDispatch {
        fn dispatch(&self, event: &Event) -> Result<()> {
            self.seen.lock().push(event.clone());
            Ok(())
        }
    }

    fn new_buffer() -> Arc<Buffer> {
        Buffer::new(
            Arc::new(LockManager::new()),
            Arc::new(DefaultEventValidator),
            Arc::new(InMemoryMetricLogger::new()),
            Arc::new(NullDispatch),
            Arc::new(ManualFlushStrategy),
            SequenceAllocator::new(Box::new(SteppingClock::default())),
        )
    }

    #[test]
    fn add_user_buffers_into_the_user_queue() {
        let buffer = new_buffer();
        buffer.add_user("alice", 1).unwrap();
        assert_eq!(buffer.pending_count_for(Variant::User), 1);
        assert_eq!(buffer.pending_count(), 1);
    }

    #[test]
    fn add_entity_also_buffers_its_entity_type_first() {
        let buffer = new_buffer();
        buffer.add_entity("Clearance", "TopSecret", 1).unwrap();
        assert_eq!(buffer.pending_count_for(Variant::EntityType), 1);
        assert_eq!(buffer.pending_count_for(Variant::Entity), 1);
    }

    #[test]
    fn second_add_entity_of_known_type_does_not_rebuffer_the_type() {
        let buffer = new_buffer();
        buffer.add_entity("Clearance", "TopSecret", 1).unwrap();
        buffer.add_entity("Clearance", "Confidential", 2).unwrap();
        assert_eq!(buffer.pending_count_for(Variant::EntityType), 1);
        assert_eq!(buffer.pending_count_for(Variant::Entity), 2);
    }

    #[test]
    fn rejected_write_does_not_buffer_anything() {
        let buffer = new_buffer();
        let err = buffer.add_user("", 1);
        assert!(err.is_err());
        assert_eq!(buffer.pending_count(), 0);
    }

    #[test]
    fn latched_flush_error_surfaces_on_next_write() {
        let buffer = new_buffer();
        *buffer.latched_flush_error.lock() = Some(AccessError::Persistence("disk full".to_string()));
        let err = buffer.add_user("alice", 1).unwrap_err();
        assert!(matches!(err, AccessError::BufferFlushing(_)));
        // the latch is a one-shot: the next call should succeed cleanly.
        buffer.add_user("bob", 2).unwrap();
    }
}
