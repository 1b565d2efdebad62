// Split orchestrator (§4.8).
//
// Moves a sub-range of one shard group's events into a brand-new target
// shard group without ever losing or duplicating an event, in seven
// steps: bulk-copy what already exists, pause routing, wait for
// in-flight writes to drain, force a buffer flush, copy whatever arrived
// while that was happening, delete the moved range from the source, then
// resume routing. Any failure before the delete step aborts and leaves
// routing paused; a failure during delete is reported separately because
// it is safe to retry in place without re-copying anything.

use crate::error::{AccessError, Result};
use crate::event::{Event, EventId};
use crate::metrics::MetricLogger;
use crate::persist::IdempotentBulkPersister;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitState {
    Idle,
    Copying,
    Pausing,
    Quiescing,
    Flushing,
    FinalCopy,
    Deleting,
    Resuming,
    /// Failed at or before the delete step; routing stays paused and the
    /// split must be retried or abandoned by a human operator.
    Aborted,
}

/// Reads events in a hash-range, oldest-first, from the source shard group.
pub trait EventReader: Send + Sync {
    /// The first event id in the target range not yet seen by this
    /// reader, or `None` if there is nothing left to copy right now.
    fn get_initial_event(&self) -> Result<Option<EventId>>;

    fn get_events(
        &self,
        from_id: EventId,
        hash_range_start: i32,
        hash_range_end: i32,
        include_group_events: bool,
        batch_size: usize,
    ) -> Result<Vec<Event>>;

    fn get_next_event_after(&self, id: EventId) -> Result<Option<EventId>>;
}

/// Deletes a hash-range's events from the source shard group once they
/// have been durably copied to the target.
pub trait EventDeleter: Send + Sync {
    fn delete(&self, hash_range_start: i32, hash_range_end: i32, include_group_events: bool) -> Result<()>;
}

/// Pauses and resumes routing of writes for the range under split.
pub trait Router: Send + Sync {
    fn pause(&self) -> Result<()>;
    fn resume(&self) -> Result<()>;
}

/// Lets the orchestrator observe and drain the source writer's in-flight
/// work during quiescence.
pub trait WriterAdmin: Send + Sync {
    fn event_processing_count(&self) -> Result<u64>;
    fn flush_event_buffers(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SplitConfig {
    pub hash_range_start: i32,
    pub hash_range_end: i32,
    pub include_group_events: bool,
    pub event_batch_size: usize,
    pub writer_quiesce_retry_attempts: u32,
    pub writer_quiesce_retry_interval_ms: u64,
}

pub struct SplitOrchestrator {
    event_reader: Arc<dyn EventReader>,
    target_persister: Arc<dyn IdempotentBulkPersister>,
    event_deleter: Arc<dyn EventDeleter>,
    router: Arc<dyn Router>,
    writer_admin: Arc<dyn WriterAdmin>,
    metrics: Arc<dyn MetricLogger>,
    state: Mutex<SplitState>,
}

impl SplitOrchestrator {
    pub fn new(
        event_reader: Arc<dyn EventReader>,
        target_persister: Arc<dyn IdempotentBulkPersister>,
        event_deleter: Arc<dyn EventDeleter>,
        router: Arc<dyn Router>,
        writer_admin: Arc<dyn WriterAdmin>,
        metrics: Arc<dyn MetricLogger>,
    ) -> Self {
        Self {
            event_reader,
            target_persister,
            event_deleter,
            router,
            writer_admin,
            metrics,
            state: Mutex::new(SplitState::Idle),
        }
    }

    pub fn state(&self) -> SplitState {
        *self.state.lock()
    }

    fn set_state(&self, state: SplitState) {
        *self.state.lock() = state;
    }

    /// Drains `get_events`/`get_next_event_after` from `self.event_reader`
    /// starting at whatever `get_initial_event` currently reports,
    /// incrementing `batch_counter` once per round trip so failures can be
    /// tagged with the batch they happened in. Returns with no error and
    /// no batches taken if the reader currently has nothing to offer --
    /// callers decide for themselves whether that's expected.
    async fn copy_phase(&self, config: &SplitConfig, batch_counter: &mut u32) -> Result<()> {
        let mut cursor = match self.event_reader.get_initial_event()? {
            Some(id) => id,
            None => return Ok(()),
        };
        loop {
            *batch_counter += 1;
            let batch = self
                .event_reader
                .get_events(
                    cursor,
                    config.hash_range_start,
                    config.hash_range_end,
                    config.include_group_events,
                    config.event_batch_size,
                )
                .map_err(|e| AccessError::Internal(format!("batch {batch_counter}: {e}")))?;
            if batch.is_empty() {
                break;
            }
            let last_id = batch.last().expect("just checked non-empty").event_id;
            self.target_persister
                .persist(&batch, true)
                .map_err(|e| AccessError::Internal(format!("batch {batch_counter}: {e}")))?;
            match self.event_reader.get_next_event_after(last_id)? {
                Some(next_id) => cursor = next_id,
                None => break,
            }
        }
        Ok(())
    }

    async fn wait_for_quiescence(&self, config: &SplitConfig) -> Result<()> {
        let mut count = self.writer_admin.event_processing_count()?;
        if count == 0 {
            return Ok(());
        }
        let mut retried = 0u32;
        while retried < config.writer_quiesce_retry_attempts {
            tokio::time::sleep(Duration::from_millis(config.writer_quiesce_retry_interval_ms)).await;
            count = self.writer_admin.event_processing_count()?;
            retried += 1;
            self.metrics.increment("split-quiescence-retry", 1);
            if count == 0 {
                return Ok(());
            }
        }
        Err(AccessError::WaitTimeout {
            waited_ms: config.writer_quiesce_retry_interval_ms * retried as u64,
            context: format!(
                "writer event-processing count remains at {count} after {retried} retries at {}ms intervals",
                config.writer_quiesce_retry_interval_ms
            ),
        })
    }

    /// Runs the full split to completion, or aborts and leaves routing
    /// paused. A caller that gets `Err` back with `state() ==
    /// SplitState::Deleting` may simply retry the delete; any other
    /// aborted state means the split must restart from the top.
    pub async fn run(&self, config: &SplitConfig) -> Result<()> {
        let timer = self.metrics.begin_interval("split-duration");

        self.set_state(SplitState::Copying);
        let mut batch_counter = 0u32;
        if let Err(e) = self.copy_phase(config, &mut batch_counter).await {
            self.metrics.cancel_interval(timer);
            self.set_state(SplitState::Aborted);
            return Err(e);
        }
        if batch_counter == 0 {
            self.metrics.cancel_interval(timer);
            self.set_state(SplitState::Aborted);
            return Err(AccessError::NotFound(
                "no events found in the target hash range to split".to_string(),
            ));
        }

        self.set_state(SplitState::Pausing);
        if let Err(e) = self.router.pause() {
            self.metrics.cancel_interval(timer);
            self.set_state(SplitState::Aborted);
            return Err(e);
        }

        self.set_state(SplitState::Quiescing);
        if let Err(e) = self.wait_for_quiescence(config).await {
            self.metrics.cancel_interval(timer);
            self.set_state(SplitState::Aborted);
            return Err(e);
        }

        self.set_state(SplitState::Flushing);
        if let Err(e) = self.writer_admin.flush_event_buffers() {
            self.metrics.cancel_interval(timer);
            self.set_state(SplitState::Aborted);
            return Err(e);
        }

        self.set_state(SplitState::FinalCopy);
        if let Err(e) = self.copy_phase(config, &mut batch_counter).await {
            self.metrics.cancel_interval(timer);
            self.set_state(SplitState::Aborted);
            return Err(e);
        }

        self.set_state(SplitState::Deleting);
        if let Err(e) = self
            .event_deleter
            .delete(config.hash_range_start, config.hash_range_end, config.include_group_events)
        {
            self.metrics.cancel_interval(timer);
            // left in Deleting, not Aborted: the copy is durable and
            // idempotent, so a caller can just retry the delete.
            return Err(e);
        }

        self.set_state(SplitState::Resuming);
        self.router.resume()?;
        self.set_state(SplitState::Idle);

        self.metrics.end_interval(timer);
        self.metrics.increment("split-completed", 1);
        self.metrics.increment("split-batches", batch_counter as u64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Action, Payload};
    use crate::metrics::InMemoryMetricLogger;
    use chrono::Utc;

    /// A reader whose event list can grow mid-test: `delivered_through`
    /// tracks how far it has handed events out, so a second
    /// `get_initial_event` call only reports what's new -- exactly what
    /// FINAL_COPY relies on. `stage_straggler` queues events that only
    /// become visible starting from the *next* `get_initial_event` call,
    /// modeling writes that land after COPYING has already scanned past
    /// them, without depending on real concurrent timing.
    #[derive(Default)]
    struct ScriptedEventReader {
        events: Mutex<Vec<Event>>,
        delivered_through: Mutex<Option<usize>>,
        initial_calls: Mutex<u32>,
        staged: Mutex<Option<Vec<Event>>>,
    }

    impl ScriptedEventReader {
        fn seed(&self, initial_events: Vec<Event>) {
            self.events.lock().extend(initial_events);
        }

        fn stage_straggler(&self, events: Vec<Event>) {
            *self.staged.lock() = Some(events);
        }
    }

    impl EventReader for ScriptedEventReader {
        fn get_initial_event(&self) -> Result<Option<EventId>> {
            *self.initial_calls.lock() += 1;
            if *self.initial_calls.lock() > 1 {
                if let Some(extra) = self.staged.lock().take() {
                    self.events.lock().extend(extra);
                }
            }
            let delivered = *self.delivered_through.lock();
            let events = self.events.lock();
            let next_idx = delivered.map(|i| i + 1).unwrap_or(0);
            Ok(events.get(next_idx).map(|e| e.event_id))
        }

        fn get_events(
            &self,
            from_id: EventId,
            _hash_range_start: i32,
            _hash_range_end: i32,
            _include_group_events: bool,
            batch_size: usize,
        ) -> Result<Vec<Event>> {
            let events = self.events.lock();
            let Some(idx) = events.iter().position(|e| e.event_id == from_id) else {
                return Ok(Vec::new());
            };
            let batch: Vec<Event> = events[idx..].iter().take(batch_size).cloned().collect();
            if let Some(last) = batch.last() {
                let last_idx = events.iter().position(|e| e.event_id == last.event_id).unwrap();
                *self.delivered_through.lock() = Some(last_idx);
            }
            Ok(batch)
        }

        fn get_next_event_after(&self, id: EventId) -> Result<Option<EventId>> {
            let events = self.events.lock();
            let idx = events.iter().position(|e| e.event_id == id);
            Ok(match idx {
                Some(i) if i + 1 < events.len() => Some(events[i + 1].event_id),
                _ => None,
            })
        }
    }

    #[derive(Default)]
    struct RecordingTargetPersister {
        batches: Mutex<Vec<Vec<Event>>>,
    }

    impl IdempotentBulkPersister for RecordingTargetPersister {
        fn persist(&self, events: &[Event], _ignore_duplicates: bool) -> Result<()> {
            self.batches.lock().push(events.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingDeleter {
        calls: Mutex<u32>,
    }

    impl EventDeleter for RecordingDeleter {
        fn delete(&self, _start: i32, _end: i32, _include_group_events: bool) -> Result<()> {
            *self.calls.lock() += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingRouter {
        paused: Mutex<bool>,
        resumed: Mutex<bool>,
    }

    impl Router for RecordingRouter {
        fn pause(&self) -> Result<()> {
            *self.paused.lock() = true;
            Ok(())
        }
        fn resume(&self) -> Result<()> {
            *self.resumed.lock() = true;
            Ok(())
        }
    }

    struct FixedWriterAdmin {
        processing_counts: Mutex<std::collections::VecDeque<u64>>,
        flush_calls: Mutex<u32>,
    }

    impl FixedWriterAdmin {
        fn new(processing_counts: Vec<u64>) -> Self {
            Self {
                processing_counts: Mutex::new(processing_counts.into()),
                flush_calls: Mutex::new(0),
            }
        }
    }

    impl WriterAdmin for FixedWriterAdmin {
        fn event_processing_count(&self) -> Result<u64> {
            let mut counts = self.processing_counts.lock();
            Ok(if counts.len() > 1 { counts.pop_front().unwrap() } else { *counts.front().unwrap() })
        }
        fn flush_event_buffers(&self) -> Result<()> {
            *self.flush_calls.lock() += 1;
            Ok(())
        }
    }

    fn make_event(hash_code: i32) -> Event {
        Event::new(Action::Add, Utc::now(), hash_code, Payload::User { user: format!("user-{hash_code}") })
    }

    fn config() -> SplitConfig {
        SplitConfig {
            hash_range_start: i32::MIN,
            hash_range_end: 0,
            include_group_events: true,
            event_batch_size: 2,
            writer_quiesce_retry_attempts: 3,
            writer_quiesce_retry_interval_ms: 5,
        }
    }

    /// Scenario S5: 8 existing events copy in 4 batches of 2; a 2-event
    /// straggler arrives during the pause and is picked up as a 5th batch
    /// by FINAL_COPY.
    #[tokio::test]
    async fn happy_path_matches_the_straggler_scenario() {
        let reader = Arc::new(ScriptedEventReader::default());
        reader.seed((0..8).map(make_event).collect());
        // becomes visible starting from FINAL_COPY's get_initial_event call
        reader.stage_straggler((8..10).map(make_event).collect());
        let target = Arc::new(RecordingTargetPersister::default());
        let deleter = Arc::new(RecordingDeleter::default());
        let router = Arc::new(RecordingRouter::default());
        let writer_admin = Arc::new(FixedWriterAdmin::new(vec![0]));
        let metrics = Arc::new(InMemoryMetricLogger::new());

        let orchestrator = SplitOrchestrator::new(
            reader,
            target.clone(),
            deleter.clone(),
            router.clone(),
            writer_admin,
            metrics.clone(),
        );

        orchestrator.run(&config()).await.unwrap();

        assert_eq!(orchestrator.state(), SplitState::Idle);
        assert_eq!(target.batches.lock().len(), 5);
        assert_eq!(target.batches.lock().iter().map(|b| b.len()).sum::<usize>(), 10);
        assert_eq!(*deleter.calls.lock(), 1);
        assert!(*router.paused.lock());
        assert!(*router.resumed.lock());
        assert_eq!(metrics.get("split-batches"), 5);
    }

    /// Scenario S6: the writer reports 3 in-flight operations on every
    /// poll (1 initial + 3 retries), so quiescence times out and the
    /// split aborts with routing left paused.
    #[tokio::test]
    async fn quiescence_timeout_matches_the_stuck_writer_scenario() {
        let reader = Arc::new(ScriptedEventReader::default());
        reader.seed(vec![make_event(1)]);
        let target = Arc::new(RecordingTargetPersister::default());
        let deleter = Arc::new(RecordingDeleter::default());
        let router = Arc::new(RecordingRouter::default());
        let writer_admin = Arc::new(FixedWriterAdmin::new(vec![3]));
        let metrics = Arc::new(InMemoryMetricLogger::new());

        let orchestrator =
            SplitOrchestrator::new(reader, target, deleter.clone(), router.clone(), writer_admin, metrics.clone());

        let err = orchestrator.run(&config()).await.unwrap_err();
        assert!(matches!(err, AccessError::WaitTimeout { .. }));
        assert_eq!(orchestrator.state(), SplitState::Aborted);
        assert_eq!(*deleter.calls.lock(), 0);
        assert!(*router.paused.lock());
        assert!(!*router.resumed.lock());
        assert_eq!(metrics.get("split-quiescence-retry"), 3);
    }

    #[tokio::test]
    async fn empty_target_range_is_fatal_on_the_very_first_copy() {
        let reader = Arc::new(ScriptedEventReader::default());
        let target = Arc::new(RecordingTargetPersister::default());
        let deleter = Arc::new(RecordingDeleter::default());
        let router = Arc::new(RecordingRouter::default());
        let writer_admin = Arc::new(FixedWriterAdmin::new(vec![0]));
        let metrics = Arc::new(InMemoryMetricLogger::new());

        let orchestrator = SplitOrchestrator::new(reader, target, deleter, router, writer_admin, metrics);
        let err = orchestrator.run(&config()).await.unwrap_err();
        assert!(matches!(err, AccessError::NotFound(_)));
        assert_eq!(orchestrator.state(), SplitState::Aborted);
    }

    #[tokio::test]
    async fn delete_failure_leaves_state_at_deleting_for_a_safe_retry() {
        struct FailingDeleter;
        impl EventDeleter for FailingDeleter {
            fn delete(&self, _s: i32, _e: i32, _g: bool) -> Result<()> {
                Err(AccessError::Persistence("source store unreachable".to_string()))
            }
        }

        let reader = Arc::new(ScriptedEventReader::default());
        reader.seed(vec![make_event(1)]);
        let target = Arc::new(RecordingTargetPersister::default());
        let router = Arc::new(RecordingRouter::default());
        let writer_admin = Arc::new(FixedWriterAdmin::new(vec![0]));
        let metrics = Arc::new(InMemoryMetricLogger::new());

        let orchestrator =
            SplitOrchestrator::new(reader, target, Arc::new(FailingDeleter), router.clone(), writer_admin, metrics);
        let err = orchestrator.run(&config()).await.unwrap_err();
        assert!(matches!(err, AccessError::Persistence(_)));
        assert_eq!(orchestrator.state(), SplitState::Deleting);
        assert!(*router.paused.lock());
        assert!(!*router.resumed.lock());
    }
}
