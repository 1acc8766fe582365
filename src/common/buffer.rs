use std::{
    collections::hash_map::RandomState,
    hash::{BuildHasher, Hash, Hasher},
    sync::atomic::{AtomicU64, AtomicU8, Ordering},
};

use crossbeam_channel::{Receiver, Sender};
use crossbeam_utils::CachePadded;
use smallvec::SmallVec;

use super::{
    constants::{BUFFER_THRESHOLD, MAXIMUM_BATCH_SIZE, MAXIMUM_BUFFER_SIZE},
    entry::NodeRef,
};

/// A buffered record of a map mutation, awaiting replay against the eviction
/// deque. Tasks are created on the hot path and consumed exactly once during
/// a drain (read tasks may be discarded on buffer overflow).
pub(crate) enum Task<K, V> {
    /// The node was looked up; reorder it to the MRU position.
    Read(NodeRef<K, V>),
    /// The node was inserted with the given weight; link it and account for
    /// its weight.
    Add(NodeRef<K, V>, u32),
    /// The node's value was swapped; reorder it and apply the signed weight
    /// difference.
    Update(NodeRef<K, V>, i64),
    /// The node was retired; unlink it and kill it.
    Remove(NodeRef<K, V>),
}

struct PendingTask<K, V> {
    seq: u64,
    task: Task<K, V>,
}

struct Stripe<K, V> {
    tx: Sender<PendingTask<K, V>>,
    rx: Receiver<PendingTask<K, V>>,
}

/// A fixed set of pending-operation buffers, striped by the calling thread's
/// identity so that concurrent threads rarely contend on the same queue.
/// Each task carries a globally increasing (but only weakly ordered across
/// threads) sequence number assigned at creation time; the drain uses it to
/// reconstruct an approximate global order.
pub(crate) struct BufferSet<K, V> {
    stripes: Box<[CachePadded<Stripe<K, V>>]>,
    stripe_mask: usize,
    next_seq: AtomicU64,
    hasher: RandomState,
}

impl<K, V> BufferSet<K, V> {
    /// `num_stripes` must be a power of two.
    pub(crate) fn new(num_stripes: usize) -> Self {
        debug_assert!(num_stripes.is_power_of_two());
        let stripes = (0..num_stripes)
            .map(|_| {
                let (tx, rx) = crossbeam_channel::unbounded();
                CachePadded::new(Stripe { tx, rx })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            stripes,
            stripe_mask: num_stripes - 1,
            next_seq: AtomicU64::new(0),
            hasher: RandomState::new(),
        }
    }

    /// The sequence number the next published task would receive. Used to
    /// re-baseline after `clear` has consumed every buffer.
    pub(crate) fn next_sequence(&self) -> u64 {
        self.next_seq.load(Ordering::Relaxed)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.stripes.iter().all(|stripe| stripe.rx.is_empty())
    }

    /// Records a read against the node. Returns `true` when the buffered
    /// read is "delayable", i.e. the buffer is short enough that draining is
    /// merely optional. Reads are discarded (and reported delayable) when
    /// the stripe has grown past its maximum length.
    pub(crate) fn publish_read(&self, node: NodeRef<K, V>) -> bool {
        let stripe = &self.stripes[self.stripe_index()];
        if stripe.tx.len() >= MAXIMUM_BUFFER_SIZE {
            return true;
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let _ = stripe.tx.send(PendingTask {
            seq,
            task: Task::Read(node),
        });
        stripe.tx.len() < BUFFER_THRESHOLD
    }

    /// Records a write task. Write tasks are never discarded.
    pub(crate) fn publish_write(&self, task: Task<K, V>) {
        let stripe = &self.stripes[self.stripe_index()];
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let _ = stripe.tx.send(PendingTask { seq, task });
    }

    /// Drains every stripe and replays the collected tasks in ascending slot
    /// order, where a task's slot is its sequence number relative to
    /// `baseline` (the sequence one past the last drain's highest replayed
    /// slot). Returns the new baseline.
    ///
    /// Three deliberate approximations keep this cheap:
    ///
    /// - a task older than the baseline is replayed immediately, out of slot
    ///   order;
    /// - a task past the end of the batch is clamped onto the last slot and
    ///   the rest of its stripe is left for the next pass;
    /// - tasks sharing a slot run in arrival-at-drain order, not true
    ///   submission order.
    pub(crate) fn drain(&self, baseline: u64, mut run: impl FnMut(Task<K, V>)) -> u64 {
        let mut slots: Vec<SmallVec<[PendingTask<K, V>; 2]>> = (0..MAXIMUM_BATCH_SIZE)
            .map(|_| SmallVec::new())
            .collect();
        let mut highest: Option<usize> = None;

        for stripe in self.stripes.iter() {
            while let Ok(pending) = stripe.rx.try_recv() {
                let slot = pending.seq as i64 - baseline as i64;
                if slot < 0 {
                    // Stale relative to the last drain; its effect is safe to
                    // apply right away.
                    run(pending.task);
                } else if slot as usize >= MAXIMUM_BATCH_SIZE {
                    let last = MAXIMUM_BATCH_SIZE - 1;
                    slots[last].push(pending);
                    highest = Some(last);
                    // Leave the remainder of this stripe for the next pass so
                    // its tasks are recomputed against the advanced baseline.
                    break;
                } else {
                    let slot = slot as usize;
                    slots[slot].push(pending);
                    highest = Some(highest.map_or(slot, |h| h.max(slot)));
                }
            }
        }

        for chain in slots {
            for pending in chain {
                run(pending.task);
            }
        }

        match highest {
            Some(h) => baseline + h as u64 + 1,
            None => baseline,
        }
    }

    /// Consumes every buffered task in per-stripe arrival order, without slot
    /// reordering. Used by `clear`, which runs write tasks and discards
    /// reads.
    pub(crate) fn drain_all(&self, mut run: impl FnMut(Task<K, V>)) {
        for stripe in self.stripes.iter() {
            while let Ok(pending) = stripe.rx.try_recv() {
                run(pending.task);
            }
        }
    }

    fn stripe_index(&self) -> usize {
        let mut hasher = self.hasher.build_hasher();
        std::thread::current().id().hash(&mut hasher);
        hasher.finish() as usize & self.stripe_mask
    }

    #[cfg(test)]
    fn publish_write_to(&self, stripe: usize, task: Task<K, V>) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let _ = self.stripes[stripe].tx.send(PendingTask { seq, task });
    }
}

const IDLE: u8 = 0;
const REQUIRED: u8 = 1;
const PROCESSING: u8 = 2;

/// Tracks whether buffered tasks need to be drained. Writes force the
/// `Required` state; reads leave the decision to the per-buffer threshold.
pub(crate) struct DrainStatus(AtomicU8);

impl Default for DrainStatus {
    fn default() -> Self {
        Self(AtomicU8::new(IDLE))
    }
}

impl DrainStatus {
    /// Whether the caller should attempt a drain. `delayable` is `true` when
    /// the triggering event was a read on a short buffer.
    pub(crate) fn should_drain(&self, delayable: bool) -> bool {
        match self.0.load(Ordering::Acquire) {
            IDLE => !delayable,
            REQUIRED => true,
            _ => false, // a drain is already in progress
        }
    }

    pub(crate) fn set_required(&self) {
        self.0.store(REQUIRED, Ordering::Release);
    }

    pub(crate) fn set_processing(&self) {
        self.0.store(PROCESSING, Ordering::Release);
    }

    /// Returns to idle unless another writer demanded a drain while this one
    /// was running.
    pub(crate) fn finish(&self) {
        let _ = self
            .0
            .compare_exchange(PROCESSING, IDLE, Ordering::AcqRel, Ordering::Acquire);
    }
}

#[cfg(test)]
mod tests {
    use super::{BufferSet, Task};
    use crate::common::constants::MAXIMUM_BATCH_SIZE;
    use crate::common::entry::{Node, NodeRef};
    use std::sync::Arc;
    use triomphe::Arc as TrioArc;

    fn node(id: u32) -> NodeRef<u32, u32> {
        TrioArc::new(Node::new(Arc::new(id), id, 1))
    }

    fn replayed_ids(buffers: &BufferSet<u32, u32>, baseline: u64) -> (Vec<u32>, u64) {
        let mut ids = Vec::new();
        let next = buffers.drain(baseline, |task| {
            if let Task::Read(n) = task {
                ids.push(**n.key());
            }
        });
        (ids, next)
    }

    #[test]
    fn replays_in_sequence_order_across_stripes() {
        let buffers: BufferSet<u32, u32> = BufferSet::new(2);

        // Interleave stripes; sequence numbers are 0, 1, 2, 3.
        buffers.publish_write_to(0, Task::Read(node(0)));
        buffers.publish_write_to(1, Task::Read(node(1)));
        buffers.publish_write_to(0, Task::Read(node(2)));
        buffers.publish_write_to(1, Task::Read(node(3)));

        // A per-stripe replay would yield 0, 2, 1, 3. The slot ordering must
        // restore the global sequence.
        let (ids, next) = replayed_ids(&buffers, 0);
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(next, 4);
    }

    #[test]
    fn stale_tasks_run_immediately() {
        let buffers: BufferSet<u32, u32> = BufferSet::new(1);

        for i in 0..3 {
            buffers.publish_write_to(0, Task::Read(node(i)));
        }

        // Pretend an earlier drain advanced the baseline past the first two
        // tasks. They are replayed immediately (before any slotted task) and
        // do not affect the advanced baseline.
        let (ids, next) = replayed_ids(&buffers, 2);
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(next, 3);
    }

    #[test]
    fn overflow_clamps_to_last_slot_and_defers_the_rest() {
        let buffers: BufferSet<u32, u32> = BufferSet::new(1);
        let total = MAXIMUM_BATCH_SIZE + 5;

        for i in 0..total as u32 {
            buffers.publish_write_to(0, Task::Read(node(i)));
        }

        // The first pass replays one full batch plus the single task that
        // was clamped onto the last slot; the rest stay buffered.
        let (ids, next) = replayed_ids(&buffers, 0);
        assert_eq!(ids.len(), MAXIMUM_BATCH_SIZE + 1);
        assert_eq!(ids[..], (0..=MAXIMUM_BATCH_SIZE as u32).collect::<Vec<_>>()[..]);
        assert_eq!(next, MAXIMUM_BATCH_SIZE as u64);

        // The second pass picks up the deferred tasks at their recomputed
        // slots.
        let (ids, next) = replayed_ids(&buffers, next);
        assert_eq!(
            ids,
            (MAXIMUM_BATCH_SIZE as u32 + 1..total as u32).collect::<Vec<_>>()
        );
        assert_eq!(next, total as u64);
    }

    #[test]
    fn clamped_tasks_share_the_last_slot_in_fifo_order() {
        let buffers: BufferSet<u32, u32> = BufferSet::new(2);

        // Fill every slot of the batch from stripe 0...
        for i in 0..MAXIMUM_BATCH_SIZE as u32 {
            buffers.publish_write_to(0, Task::Read(node(i)));
        }
        // ...then overflow once per stripe. Both tasks clamp onto the last
        // slot, forming a chain of two.
        buffers.publish_write_to(0, Task::Read(node(1000)));
        buffers.publish_write_to(1, Task::Read(node(2000)));

        let (ids, next) = replayed_ids(&buffers, 0);
        assert_eq!(ids.len(), MAXIMUM_BATCH_SIZE + 2);
        assert_eq!(
            ids[..MAXIMUM_BATCH_SIZE],
            (0..MAXIMUM_BATCH_SIZE as u32).collect::<Vec<_>>()[..]
        );
        // The chained tasks replay after every in-range slot, in the order
        // they were collected.
        assert_eq!(ids[MAXIMUM_BATCH_SIZE..], [1000, 2000]);
        assert_eq!(next, MAXIMUM_BATCH_SIZE as u64);

        // The chain was consumed in this pass, not deferred.
        let (ids, _) = replayed_ids(&buffers, next);
        assert!(ids.is_empty());
    }

    #[test]
    fn drain_all_preserves_per_stripe_order() {
        let buffers: BufferSet<u32, u32> = BufferSet::new(2);
        buffers.publish_write_to(0, Task::Read(node(10)));
        buffers.publish_write_to(0, Task::Read(node(11)));

        let mut ids = Vec::new();
        buffers.drain_all(|task| {
            if let Task::Read(n) = task {
                ids.push(**n.key());
            }
        });
        assert_eq!(ids, vec![10, 11]);

        // Everything was consumed.
        let (ids, _) = replayed_ids(&buffers, buffers.next_sequence());
        assert!(ids.is_empty());
    }
}
