// Access Manager - event-sourced, hash-sharded access-control core
// Core library module

pub mod buffer;
pub mod clock;
pub mod error;
pub mod event;
pub mod lock;
pub mod metrics;
pub mod persist;
pub mod shard;
pub mod split;

pub use error::{AccessError, Result};

use buffer::{Buffer, FlushStrategy};
use clock::{Clock, SequenceAllocator, SystemClock};
use event::validator::{DefaultEventValidator, EventValidator};
use lock::LockManager;
use metrics::{MetricLogger, NoOpMetricLogger};
use persist::adapter::{PersisterAdapter, PersisterDispatch};
use persist::EventPersister;
use std::sync::Arc;

/// Top-level configuration for one node's buffer + flush pipeline.
#[derive(Clone)]
pub struct NodeConfig {
    pub flush_strategy: Arc<dyn FlushStrategy>,
    pub validator: Arc<dyn EventValidator>,
    pub metrics: Arc<dyn MetricLogger>,
    pub clock: Arc<dyn Clock>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            flush_strategy: Arc::new(buffer::CountTriggeredFlushStrategy::new(500)),
            validator: Arc::new(DefaultEventValidator),
            metrics: Arc::new(NoOpMetricLogger),
            clock: Arc::new(SystemClock),
        }
    }
}

/// Wires a lock manager, validator, sequence allocator, and persister
/// together behind one buffer, exposing the write surface a node's API
/// layer sits on top of (§2's "Buffer" box plus everything that feeds
/// it).
pub fn build_buffer<P: EventPersister + 'static>(sink: P, config: NodeConfig) -> Arc<Buffer> {
    let dispatch: Arc<dyn PersisterDispatch> = Arc::new(PersisterAdapter::new(sink));
    let sequencer = SequenceAllocator::new(Box::new(SystemClockAdapter(config.clock)));
    Buffer::new(
        Arc::new(LockManager::new()),
        config.validator,
        config.metrics,
        dispatch,
        config.flush_strategy,
        sequencer,
    )
}

/// Bridges the `Arc<dyn Clock>` held by `NodeConfig` into the owned
/// `Box<dyn Clock>` `SequenceAllocator` expects.
struct SystemClockAdapter(Arc<dyn Clock>);

impl Clock for SystemClockAdapter {
    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.0.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Payload;
    use crate::persist::EventMeta;

    struct NoopPersister;

    macro_rules! noop_method {
        ($name:ident($($arg:ident: $ty:ty),*)) => {
            fn $name(&self, $($arg: $ty),*, _meta: EventMeta) -> Result<()> {
                Ok(())
            }
        };
    }

    impl EventPersister for NoopPersister {
        noop_method!(add_user(user: &str));
        noop_method!(remove_user(user: &str));
        noop_method!(add_group(group: &str));
        noop_method!(remove_group(group: &str));
        noop_method!(add_user_to_group_mapping(user: &str, group: &str));
        noop_method!(remove_user_to_group_mapping(user: &str, group: &str));
        noop_method!(add_group_to_group_mapping(from_group: &str, to_group: &str));
        noop_method!(remove_group_to_group_mapping(from_group: &str, to_group: &str));
        noop_method!(add_user_to_component_access(user: &str, component: &str, access_level: &str));
        noop_method!(remove_user_to_component_access(user: &str, component: &str, access_level: &str));
        noop_method!(add_group_to_component_access(group: &str, component: &str, access_level: &str));
        noop_method!(remove_group_to_component_access(group: &str, component: &str, access_level: &str));
        noop_method!(add_entity_type(entity_type: &str));
        noop_method!(remove_entity_type(entity_type: &str));
        noop_method!(add_entity(entity_type: &str, entity: &str));
        noop_method!(remove_entity(entity_type: &str, entity: &str));
        noop_method!(add_user_to_entity_mapping(user: &str, entity_type: &str, entity: &str));
        noop_method!(remove_user_to_entity_mapping(user: &str, entity_type: &str, entity: &str));
        noop_method!(add_group_to_entity_mapping(group: &str, entity_type: &str, entity: &str));
        noop_method!(remove_group_to_entity_mapping(group: &str, entity_type: &str, entity: &str));
    }

    #[test]
    fn build_buffer_wires_a_working_write_and_flush_path() {
        let buffer = build_buffer(NoopPersister, NodeConfig::default());
        buffer.add_user("alice", 1).unwrap();
        buffer.add_entity("Document", "doc-1", 2).unwrap();
        // add_entity also buffers its EntityType dependency first (§3.2)
        assert_eq!(buffer.pending_count(), 3);

        let report = buffer.flush().unwrap();
        assert_eq!(report.flushed, 3);
        assert_eq!(buffer.pending_count(), 0);
    }

    #[test]
    fn payload_variant_round_trips_through_the_full_stack() {
        let buffer = build_buffer(NoopPersister, NodeConfig::default());
        buffer.add_group_to_component_access("admins", "billing", "ReadWrite", 7).unwrap();
        assert_eq!(buffer.pending_count_for(Payload::GroupToComponentAccess {
            group: String::new(),
            component: String::new(),
            access_level: String::new(),
        }.variant()), 1);
    }
}
