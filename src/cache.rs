use std::{
    collections::hash_map::RandomState,
    hash::{BuildHasher, Hash},
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_epoch::{self as epoch, Guard};
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use triomphe::Arc as TrioArc;

use crate::{
    common::{
        buffer::{BufferSet, DrainStatus, Task},
        constants::MAXIMUM_WEIGHT,
        deque::{DeqNode, Deque},
        entry::{Node, NodeRef},
        housekeeper::{Housekeeper, InnerSync},
        num_buffer_stripes, Weigher,
    },
    notification::{EvictionListener, RemovalNotifier},
};

/// The key -> node index. The index is the source of truth for the mapping
/// and provides the linearizable read/write semantics; the eviction deque
/// only approximates recency.
type CacheStore<K, V, S> = dashmap::DashMap<Arc<K>, NodeRef<K, V>, S>;

/// A concurrent hash map bounded by a weighted capacity, evicting the least
/// recently used entries.
///
/// Reads and writes go straight to a lock-free index; the bookkeeping needed
/// to maintain the eviction order is recorded into striped buffers and
/// replayed in batches under a single eviction lock, so the lock stays off
/// the hot path. As a consequence the recency order, `weighted_size` and the
/// snapshot views are only eventually consistent with the operations already
/// visible through `get`.
///
/// Cloning a `Cache` is cheap; all clones share the same internal state.
///
/// # Examples
///
/// ```
/// use linked_cache::Cache;
///
/// let cache = Cache::new(2);
///
/// cache.insert(1, "one");
/// cache.insert(2, "two");
/// cache.insert(3, "three");
/// cache.run_pending_tasks();
///
/// // The oldest entry was evicted to honor the capacity.
/// assert_eq!(cache.len(), 2);
/// assert_eq!(cache.get(&1), None);
/// assert_eq!(cache.get(&2), Some("two"));
/// assert_eq!(cache.get(&3), Some("three"));
/// ```
pub struct Cache<K, V, S = RandomState> {
    inner: Arc<Inner<K, V, S>>,
    housekeeper: Option<Arc<Housekeeper>>,
}

impl<K, V, S> Clone for Cache<K, V, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            housekeeper: self.housekeeper.as_ref().map(Arc::clone),
        }
    }
}

impl<K, V, S> std::fmt::Debug for Cache<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher + Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("len", &self.inner.cache.len())
            .field("capacity", &self.inner.capacity.load(Ordering::Relaxed))
            .finish()
    }
}

impl<K, V> Cache<K, V, RandomState>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Constructs a cache that holds up to `max_capacity` total weight. With
    /// the default weigher every entry weighs 1, so this is an entry count.
    pub fn new(max_capacity: u64) -> Self {
        crate::CacheBuilder::new(max_capacity).build()
    }
}

impl<K, V, S> Cache<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn with_everything(
        max_capacity: u64,
        initial_capacity: Option<usize>,
        concurrency_level: Option<usize>,
        build_hasher: S,
        weigher: Option<Weigher<K, V>>,
        eviction_listener: Option<EvictionListener<K, V>>,
        catch_up_period: Option<Duration>,
    ) -> Self {
        let inner = Arc::new(Inner::new(
            max_capacity,
            initial_capacity,
            concurrency_level,
            build_hasher,
            weigher,
            eviction_listener,
        ));
        let housekeeper =
            catch_up_period.map(|period| Arc::new(Housekeeper::start(&inner, period)));
        Self { inner, housekeeper }
    }

    /// Returns a clone of the value mapped to `key`, recording the access
    /// for the eviction order. Never blocks on the eviction lock.
    pub fn get(&self, key: &K) -> Option<V> {
        let node = {
            let entry_ref = self.inner.cache.get(key)?;
            TrioArc::clone(entry_ref.value())
        };
        let guard = epoch::pin();
        let value = node.value(&guard);
        self.inner.after_read(node);
        Some(value)
    }

    /// Returns `true` if the map contains the key. Does not record an
    /// access.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.cache.contains_key(key)
    }

    /// Maps `key` to `value`, returning the previous value if the key was
    /// present.
    ///
    /// # Panics
    ///
    /// Panics if the configured weigher returns a weight outside
    /// `1..=MAXIMUM_WEIGHT` for this value. The map is left unchanged.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.inner.insert(key, value, false)
    }

    /// Maps `key` to `value` only if the key has no mapping, returning the
    /// current value otherwise. An existing mapping is treated as an access.
    ///
    /// # Panics
    ///
    /// See [`Cache::insert`].
    pub fn insert_if_absent(&self, key: K, value: V) -> Option<V> {
        self.inner.insert(key, value, true)
    }

    /// Replaces the value for a key only if it is already mapped, returning
    /// the previous value.
    ///
    /// # Panics
    ///
    /// See [`Cache::insert`].
    pub fn replace(&self, key: &K, value: V) -> Option<V> {
        self.inner.replace(key, value)
    }

    /// Replaces the value for a key only if it is currently mapped to
    /// `expected`.
    ///
    /// # Panics
    ///
    /// See [`Cache::insert`].
    pub fn replace_if_equal(&self, key: &K, expected: &V, value: V) -> bool
    where
        V: PartialEq,
    {
        self.inner.replace_if_equal(key, expected, value)
    }

    /// Removes the mapping for a key, returning the previous value. Explicit
    /// removals are not reported to the eviction listener.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.remove(key)
    }

    /// Removes the mapping for a key only if it is currently mapped to
    /// `expected`.
    pub fn remove_if_equal(&self, key: &K, expected: &V) -> bool
    where
        V: PartialEq,
    {
        self.inner.remove_if_equal(key, expected)
    }

    /// The number of entries in the map.
    pub fn len(&self) -> usize {
        self.inner.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.cache.is_empty()
    }

    /// The combined weight of the entries tracked by the eviction policy.
    /// Eventually consistent: a just-inserted entry is visible to `get`
    /// before it is reflected here.
    pub fn weighted_size(&self) -> u64 {
        self.inner.weighted_size.load(Ordering::Relaxed).max(0) as u64
    }

    /// The maximum total weight of the cache.
    pub fn capacity(&self) -> u64 {
        self.inner.capacity.load(Ordering::Relaxed)
    }

    /// Changes the maximum total weight. Decreasing the capacity evicts
    /// eagerly: the calling thread runs an eviction pass before returning,
    /// and then delivers any resulting notifications.
    pub fn set_capacity(&self, capacity: u64) {
        self.inner.set_capacity(capacity);
    }

    /// The keys ordered from the least to the most recently used, up to
    /// `limit`. An O(n) snapshot taken under the eviction lock after the
    /// pending operations have been replayed.
    pub fn ascending_keys(&self, limit: Option<usize>) -> Vec<Arc<K>> {
        self.inner.snapshot_keys(true, limit)
    }

    /// The keys ordered from the most to the least recently used, up to
    /// `limit`.
    pub fn descending_keys(&self, limit: Option<usize>) -> Vec<Arc<K>> {
        self.inner.snapshot_keys(false, limit)
    }

    /// Key/value pairs ordered from the least to the most recently used, up
    /// to `limit`.
    pub fn ascending_entries(&self, limit: Option<usize>) -> Vec<(Arc<K>, V)> {
        self.inner.snapshot_entries(true, limit)
    }

    /// Key/value pairs ordered from the most to the least recently used, up
    /// to `limit`.
    pub fn descending_entries(&self, limit: Option<usize>) -> Vec<(Arc<K>, V)> {
        self.inner.snapshot_entries(false, limit)
    }

    /// Removes every entry. Pending write tasks are replayed first so their
    /// weights are accounted, then every entry is discarded; buffered read
    /// tasks are dropped. The purge itself produces no eviction
    /// notifications.
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Replays every buffered task against the eviction order, runs the
    /// eviction pass, and delivers pending notifications. Blocks on the
    /// eviction lock. Tests use this as the quiescent point after which
    /// `weighted_size` and the snapshot views are exact.
    pub fn run_pending_tasks(&self) {
        self.inner.sync();
    }
}

struct EvictionState<K, V> {
    deque: Deque<NodeRef<K, V>>,
    /// One past the highest slot replayed by the last drain; the baseline
    /// against which the next drain computes task slots.
    drained_seq: u64,
}

// The deque stores raw pointers, but they are only dereferenced by the
// thread holding the eviction lock.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for EvictionState<K, V> {}

struct Inner<K, V, S> {
    capacity: AtomicU64,
    /// Signed because buffered tasks may replay out of order: the removal of
    /// an entry whose add task is still pending subtracts before the add
    /// adds, leaving the counter transiently negative.
    weighted_size: AtomicI64,
    cache: CacheStore<K, V, S>,
    eviction: Mutex<EvictionState<K, V>>,
    buffers: BufferSet<K, V>,
    drain_status: DrainStatus,
    weigher: Option<Weigher<K, V>>,
    notifier: Option<RemovalNotifier<K, V>>,
}

impl<K, V, S> Inner<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn new(
        max_capacity: u64,
        initial_capacity: Option<usize>,
        concurrency_level: Option<usize>,
        build_hasher: S,
        weigher: Option<Weigher<K, V>>,
        eviction_listener: Option<EvictionListener<K, V>>,
    ) -> Self {
        let initial_capacity = initial_capacity.unwrap_or_default();
        let cache = match concurrency_level {
            Some(level) => dashmap::DashMap::with_capacity_and_hasher_and_shard_amount(
                initial_capacity,
                build_hasher,
                level.next_power_of_two().max(2),
            ),
            None => dashmap::DashMap::with_capacity_and_hasher(initial_capacity, build_hasher),
        };

        Self {
            capacity: AtomicU64::new(max_capacity),
            weighted_size: AtomicI64::new(0),
            cache,
            eviction: Mutex::new(EvictionState {
                deque: Deque::new(),
                drained_seq: 0,
            }),
            buffers: BufferSet::new(num_buffer_stripes()),
            drain_status: DrainStatus::default(),
            weigher,
            notifier: eviction_listener.map(RemovalNotifier::new),
        }
    }

    /// Weighs a value, panicking before any mutation when the weigher
    /// misbehaves.
    #[inline]
    fn weigh(&self, key: &K, value: &V) -> u32 {
        let weight = self.weigher.as_ref().map(|w| w(key, value)).unwrap_or(1);
        assert!(
            (1..=MAXIMUM_WEIGHT).contains(&weight),
            "the weigher returned a weight of {weight}; weights must be in 1..={MAXIMUM_WEIGHT}"
        );
        weight
    }

    fn insert(&self, key: K, value: V, only_if_absent: bool) -> Option<V> {
        let key = Arc::new(key);
        let weight = self.weigh(&key, &value);
        let guard = epoch::pin();
        let node = TrioArc::new(Node::new(Arc::clone(&key), value.clone(), weight));

        loop {
            let prior = match self.cache.entry(Arc::clone(&key)) {
                Entry::Vacant(entry) => {
                    entry.insert(TrioArc::clone(&node));
                    None
                }
                Entry::Occupied(entry) => Some(TrioArc::clone(entry.get())),
            };

            let Some(prior) = prior else {
                self.after_write(Task::Add(node, weight));
                return None;
            };

            if only_if_absent {
                let existing = prior.value(&guard);
                self.after_read(prior);
                return Some(existing);
            }

            match prior.try_update(value.clone(), weight, &guard) {
                Some((old_value, old_weight)) => {
                    let weight_diff = weight as i64 - old_weight as i64;
                    if weight_diff == 0 {
                        self.after_read(prior);
                    } else {
                        self.after_write(Task::Update(prior, weight_diff));
                    }
                    return Some(old_value);
                }
                // The prior mapping was retired by a concurrent removal.
                // Retry once it disappears from the index.
                None => continue,
            }
        }
    }

    fn replace(&self, key: &K, value: V) -> Option<V> {
        let weight = self.weigh(key, &value);
        let node = {
            let entry_ref = self.cache.get(key)?;
            TrioArc::clone(entry_ref.value())
        };
        let guard = epoch::pin();
        let (old_value, old_weight) = node.try_update(value, weight, &guard)?;
        let weight_diff = weight as i64 - old_weight as i64;
        if weight_diff == 0 {
            self.after_read(node);
        } else {
            self.after_write(Task::Update(node, weight_diff));
        }
        Some(old_value)
    }

    fn replace_if_equal(&self, key: &K, expected: &V, value: V) -> bool
    where
        V: PartialEq,
    {
        let weight = self.weigh(key, &value);
        let node = match self.cache.get(key) {
            Some(entry_ref) => TrioArc::clone(entry_ref.value()),
            None => return false,
        };
        let guard = epoch::pin();
        match node.try_update_if_equal(expected, value, weight, &guard) {
            Some(old_weight) => {
                let weight_diff = weight as i64 - old_weight as i64;
                if weight_diff == 0 {
                    self.after_read(node);
                } else {
                    self.after_write(Task::Update(node, weight_diff));
                }
                true
            }
            None => false,
        }
    }

    fn remove(&self, key: &K) -> Option<V> {
        let (_key, node) = self.cache.remove(key)?;
        let guard = epoch::pin();
        node.make_retired(&guard);
        let value = node.value(&guard);
        self.after_write(Task::Remove(node));
        Some(value)
    }

    fn remove_if_equal(&self, key: &K, expected: &V) -> bool
    where
        V: PartialEq,
    {
        let node = match self.cache.get(key) {
            Some(entry_ref) => TrioArc::clone(entry_ref.value()),
            None => return false,
        };
        let guard = epoch::pin();
        loop {
            if node.value(&guard) != *expected {
                return false;
            }
            if node.try_retire(&guard).is_some() {
                // This thread won the retirement; only it may unmap this
                // exact node and schedule the removal.
                self.cache
                    .remove_if(node.key(), |_, current| TrioArc::ptr_eq(current, &node));
                self.after_write(Task::Remove(node));
                return true;
            }
            if !node.is_alive(&guard) {
                // Lost the race to another removal.
                return false;
            }
            // The value was concurrently replaced; re-check the fresh
            // snapshot.
        }
    }

    fn set_capacity(&self, capacity: u64) {
        let mut state = self.eviction.lock();
        self.capacity.store(capacity, Ordering::Relaxed);
        self.drain_status.set_processing();
        self.drain_and_evict(&mut state);
        self.drain_status.finish();
        drop(state);
        self.deliver_notifications();
    }

    fn clear(&self) {
        let mut state = self.eviction.lock();
        let guard = epoch::pin();

        // Replay buffered write tasks so every weight is accounted before
        // the purge; reads are only reorderings and can be dropped.
        let EvictionState { deque, drained_seq } = &mut *state;
        self.buffers.drain_all(|task| match task {
            Task::Read(_) => (),
            write_task => self.run_task(write_task, deque, &guard),
        });
        *drained_seq = self.buffers.next_sequence();

        while let Some(removed) = state.deque.pop_front() {
            let node = removed.element;
            node.take_deq_node();
            self.cache
                .remove_if(node.key(), |_, current| TrioArc::ptr_eq(current, &node));
            let weight = node.make_dead(&guard);
            self.adjust_weight(-(weight as i64));
        }

        drop(state);
        // The write replay above may have evicted entries over capacity;
        // those are genuine evictions and are still delivered.
        self.deliver_notifications();
    }

    fn snapshot_keys(&self, ascending: bool, limit: Option<usize>) -> Vec<Arc<K>> {
        self.snapshot(ascending, limit, |node, _| Arc::clone(node.key()))
    }

    fn snapshot_entries(&self, ascending: bool, limit: Option<usize>) -> Vec<(Arc<K>, V)> {
        self.snapshot(ascending, limit, |node, guard| {
            (Arc::clone(node.key()), node.value(guard))
        })
    }

    fn snapshot<T>(
        &self,
        ascending: bool,
        limit: Option<usize>,
        mut select: impl FnMut(&NodeRef<K, V>, &Guard) -> T,
    ) -> Vec<T> {
        let mut state = self.eviction.lock();
        self.drain_status.set_processing();
        self.drain_and_evict(&mut state);
        self.drain_status.finish();

        let guard = epoch::pin();
        let limit = limit.unwrap_or_else(|| state.deque.len());
        let items = if ascending {
            state
                .deque
                .iter()
                .take(limit)
                .map(|node| select(node, &guard))
                .collect()
        } else {
            state
                .deque
                .iter()
                .rev()
                .take(limit)
                .map(|node| select(node, &guard))
                .collect()
        };

        drop(state);
        self.deliver_notifications();
        items
    }

    /// Records a read task and drains if the policy demands it. Reads only
    /// force a drain once their buffer has grown past the threshold.
    fn after_read(&self, node: NodeRef<K, V>) {
        let delayable = self.buffers.publish_read(node);
        if self.drain_status.should_drain(delayable) {
            self.try_sync();
        }
    }

    /// Records a write task. Writes always demand a drain and attempt one
    /// immediately (non-blocking; if the lock is held, whichever thread
    /// holds it will pick the task up).
    fn after_write(&self, task: Task<K, V>) {
        self.buffers.publish_write(task);
        self.drain_status.set_required();
        self.try_sync();
    }

    /// A single non-blocking drain attempt.
    fn try_sync(&self) {
        if let Some(mut state) = self.eviction.try_lock() {
            self.drain_status.set_processing();
            self.drain_and_evict(&mut state);
            self.drain_status.finish();
            drop(state);
            self.deliver_notifications();
        }
    }

    /// A blocking drain that loops until every buffer is empty.
    fn sync(&self) {
        let mut state = self.eviction.lock();
        self.drain_status.set_processing();
        loop {
            self.drain_and_evict(&mut state);
            if self.buffers.is_empty() {
                break;
            }
        }
        self.drain_status.finish();
        drop(state);
        self.deliver_notifications();
    }

    fn drain_and_evict(&self, state: &mut EvictionState<K, V>) {
        let guard = epoch::pin();
        let EvictionState { deque, drained_seq } = state;
        *drained_seq = self
            .buffers
            .drain(*drained_seq, |task| self.run_task(task, deque, &guard));
        self.evict(deque, &guard);
    }

    fn run_task(&self, task: Task<K, V>, deque: &mut Deque<NodeRef<K, V>>, guard: &Guard) {
        match task {
            Task::Read(node) => Self::reorder(deque, &node),
            Task::Add(node, weight) => {
                self.adjust_weight(weight as i64);
                // Skip linking when the node was retired before this replay;
                // the pending removal task will settle the weight.
                if node.is_alive(guard) {
                    let deq_node = deque.push_back(Box::new(DeqNode::new(TrioArc::clone(&node))));
                    node.set_deq_node(deq_node);
                    self.evict(deque, guard);
                }
            }
            Task::Update(node, weight_diff) => {
                Self::reorder(deque, &node);
                self.adjust_weight(weight_diff);
                self.evict(deque, guard);
            }
            Task::Remove(node) => {
                Self::unlink(deque, &node);
                let weight = node.make_dead(guard);
                self.adjust_weight(-(weight as i64));
            }
        }
    }

    /// Moves a node to the MRU position. No-op when it was concurrently
    /// unlinked.
    fn reorder(deque: &mut Deque<NodeRef<K, V>>, node: &NodeRef<K, V>) {
        if let Some(deq_node) = node.deq_node() {
            if deque.contains(unsafe { deq_node.as_ref() }) {
                unsafe { deque.move_to_back(deq_node) };
            }
        }
    }

    fn unlink(deque: &mut Deque<NodeRef<K, V>>, node: &NodeRef<K, V>) {
        if let Some(deq_node) = node.take_deq_node() {
            unsafe { deque.unlink_and_drop(deq_node) };
        }
    }

    /// Pops LRU victims until the weighted size fits the capacity, or the
    /// deque is exhausted (the bound is best-effort while entries are being
    /// added concurrently).
    fn evict(&self, deque: &mut Deque<NodeRef<K, V>>, guard: &Guard) {
        loop {
            let weighted_size = self.weighted_size.load(Ordering::Relaxed);
            if weighted_size <= 0
                || (weighted_size as u64) <= self.capacity.load(Ordering::Relaxed)
            {
                break;
            }
            let node = match deque.peek_front() {
                Some(front) => TrioArc::clone(&front.element),
                None => break,
            };
            Self::unlink(deque, &node);

            // Notify only when this exact node still backed its key; a
            // concurrent removal or replacement already claimed it
            // otherwise.
            let removed = self
                .cache
                .remove_if(node.key(), |_, current| TrioArc::ptr_eq(current, &node))
                .is_some();
            if removed {
                if let Some(notifier) = &self.notifier {
                    notifier.enqueue(Arc::clone(node.key()), node.value(guard));
                }
            }

            let weight = node.make_dead(guard);
            self.adjust_weight(-(weight as i64));
        }
    }

    fn deliver_notifications(&self) {
        if let Some(notifier) = &self.notifier {
            notifier.deliver_all();
        }
    }

    // The weighted size is only mutated while the eviction lock is held, so
    // a plain load/store pair is sufficient; the atomic exists for the
    // lock-free `weighted_size()` reader.
    fn adjust_weight(&self, diff: i64) {
        let current = self.weighted_size.load(Ordering::Relaxed);
        self.weighted_size.store(current + diff, Ordering::Relaxed);
    }
}

impl<K, V, S> InnerSync for Inner<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn try_run_pending_tasks(&self) {
        self.try_sync();
    }
}
