// Flush engine (§4.4).
//
// Phase A: snapshot the sequence high-water mark, then drain each queue's
// prefix of entries sequenced at or before it, leaving later entries
// (raced in after the mark was taken) in place -- "excluded from flush".
// Queue contents are append-ordered by sequence already (one queue only
// ever receives pushes from callers that just took a sequence number),
// so each per-queue drain is a simple pop-while-front-qualifies scan, no
// sorting needed.
//
// Phase B: k-way merge the ten per-queue snapshots into strict global
// sequence order via a min-heap, dispatching one event at a time to the
// persister adapter. If dispatch fails partway through, every entry not
// yet successfully persisted -- the one that failed, whatever else was
// sitting in the heap, and the untouched remainder of each snapshot --
// is re-prepended to its live queue in original order before the error
// is propagated, so a mid-flush failure loses nothing and a later flush
// attempt picks the same events back up.

use super::{Buffer, FlushReport};
use crate::error::{AccessError, Result};
use crate::event::BufferEntry;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};

struct HeapItem {
    entry: BufferEntry,
    queue_idx: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.entry.seq == other.entry.seq
    }
}
impl Eq for HeapItem {}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.entry.seq.cmp(&other.entry.seq)
    }
}

fn snapshot(buffer: &Buffer) -> ([VecDeque<BufferEntry>; 10], u64) {
    let high_water = buffer.sequencer.high_water();
    let mut snapshots: [VecDeque<BufferEntry>; 10] = Default::default();
    let mut excluded = 0u64;

    for i in 0..10 {
        let mut queue = buffer.queues[i].lock();
        while let Some(front) = queue.front() {
            if front.seq > high_water {
                break;
            }
            snapshots[i].push_back(queue.pop_front().expect("front() just confirmed Some"));
        }
        excluded += queue.len() as u64;
    }

    (snapshots, excluded)
}

/// Re-prepends everything not yet persisted back onto the live queues, in
/// original relative order, ahead of whatever has been buffered since.
fn restore_remainder(
    buffer: &Buffer,
    failed: BufferEntry,
    failed_idx: usize,
    mut snapshots: [VecDeque<BufferEntry>; 10],
    heap: BinaryHeap<Reverse<HeapItem>>,
) {
    let mut pending_head: [Option<BufferEntry>; 10] = Default::default();
    pending_head[failed_idx] = Some(failed);
    for Reverse(item) in heap.into_iter() {
        pending_head[item.queue_idx] = Some(item.entry);
    }

    for i in 0..10 {
        let mut remainder = VecDeque::new();
        if let Some(head) = pending_head[i].take() {
            remainder.push_back(head);
        }
        remainder.append(&mut snapshots[i]);
        if remainder.is_empty() {
            continue;
        }
        let mut live = buffer.queues[i].lock();
        for entry in remainder.into_iter().rev() {
            live.push_front(entry);
        }
    }
}

pub(super) fn run(buffer: &Buffer) -> Result<FlushReport> {
    let timer = buffer.metrics.begin_interval("flush-duration");
    let (mut snapshots, excluded) = snapshot(buffer);

    let mut heap = BinaryHeap::new();
    for i in 0..10 {
        if let Some(entry) = snapshots[i].pop_front() {
            heap.push(Reverse(HeapItem { entry, queue_idx: i }));
        }
    }

    let mut flushed = 0u64;
    while let Some(Reverse(item)) = heap.pop() {
        let queue_idx = item.queue_idx;
        if let Err(e) = buffer.persister.dispatch(&item.entry.event) {
            restore_remainder(buffer, item.entry, queue_idx, snapshots, heap);
            buffer.metrics.cancel_interval(timer);
            return Err(AccessError::BufferFlushing(format!("flush aborted mid-drain: {e}")));
        }
        flushed += 1;
        if let Some(next) = snapshots[queue_idx].pop_front() {
            heap.push(Reverse(HeapItem { entry: next, queue_idx }));
        }
    }

    buffer.metrics.end_interval(timer);
    buffer.metrics.increment("events-flushed", flushed);
    buffer.metrics.increment("events-excluded-from-flush", excluded);
    Ok(FlushReport { flushed, excluded_from_flush: excluded })
}
