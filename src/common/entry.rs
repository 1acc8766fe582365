use std::{ptr::NonNull, sync::Arc, sync::atomic::Ordering};

use crossbeam_epoch::{Atomic, Guard, Owned};
use parking_lot::Mutex;
use triomphe::Arc as TrioArc;

use super::deque::DeqNode;

/// An immutable snapshot of a cached value and its weight. The lifecycle
/// state is folded into the sign of `weight` so that a single
/// compare-exchange both validates the expected prior state and performs the
/// transition:
///
/// - positive: the entry is alive (reachable from the hash table and, once
///   its pending add has been replayed, the eviction deque),
/// - negative: the entry is retired (unlinked from the hash table, the
///   eviction deque has not been told yet),
/// - zero: the entry is dead (unreachable from both structures).
#[derive(Debug)]
pub(crate) struct WeightedEntry<V> {
    pub(crate) value: V,
    weight: i32,
}

impl<V> WeightedEntry<V> {
    fn alive(value: V, weight: u32) -> Self {
        debug_assert!(weight > 0);
        Self {
            value,
            weight: weight as i32,
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.weight > 0
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.weight == 0
    }
}

/// A reference-counted pointer to a node. `triomphe::Arc` is used because
/// nodes never need weak references and the cache clones these on every hot
/// path operation.
pub(crate) type NodeRef<K, V> = TrioArc<Node<K, V>>;

type DeqNodePtr<K, V> = NonNull<DeqNode<NodeRef<K, V>>>;

/// A mutable slot in the hash table, owning a key and an atomically
/// swappable [`WeightedEntry`] snapshot. The deque back-pointer is read and
/// written only while the eviction lock is held; it is `Some` exactly when
/// the node is linked into the eviction deque.
pub(crate) struct Node<K, V> {
    key: Arc<K>,
    entry: Atomic<WeightedEntry<V>>,
    deq_node: Mutex<Option<DeqNodePtr<K, V>>>,
}

// The raw deque pointer is only dereferenced under the eviction lock.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for Node<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Node<K, V> {}

impl<K, V> Node<K, V> {
    pub(crate) fn new(key: Arc<K>, value: V, weight: u32) -> Self {
        Self {
            key,
            entry: Atomic::new(WeightedEntry::alive(value, weight)),
            deq_node: Mutex::new(None),
        }
    }

    pub(crate) fn key(&self) -> &Arc<K> {
        &self.key
    }

    pub(crate) fn is_alive(&self, guard: &Guard) -> bool {
        let entry = self.entry.load(Ordering::Acquire, guard);
        unsafe { entry.deref() }.is_alive()
    }

    pub(crate) fn deq_node(&self) -> Option<DeqNodePtr<K, V>> {
        *self.deq_node.lock()
    }

    pub(crate) fn set_deq_node(&self, node: DeqNodePtr<K, V>) {
        *self.deq_node.lock() = Some(node);
    }

    pub(crate) fn take_deq_node(&self) -> Option<DeqNodePtr<K, V>> {
        self.deq_node.lock().take()
    }
}

impl<K, V: Clone> Node<K, V> {
    /// Returns a clone of the current value, whatever the lifecycle state.
    /// A retired entry may still be observed by a reader that found the node
    /// before it was unlinked from the hash table; returning its value is the
    /// benign outcome of that race.
    pub(crate) fn value(&self, guard: &Guard) -> V {
        let entry = self.entry.load(Ordering::Acquire, guard);
        unsafe { entry.deref() }.value.clone()
    }

    /// Attempts to swap an alive snapshot for a new alive snapshot, returning
    /// the previous value and weight. Fails when the entry was concurrently
    /// retired or killed; the caller is expected to retry at the hash table
    /// level.
    pub(crate) fn try_update(&self, value: V, weight: u32, guard: &Guard) -> Option<(V, u32)> {
        let mut new = Owned::new(WeightedEntry::alive(value, weight));
        loop {
            let current = self.entry.load(Ordering::Acquire, guard);
            let current_ref = unsafe { current.deref() };
            if !current_ref.is_alive() {
                return None;
            }
            match self.entry.compare_exchange(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => {
                    let prior = (current_ref.value.clone(), current_ref.weight as u32);
                    unsafe { guard.defer_destroy(current) };
                    return Some(prior);
                }
                Err(e) => new = e.new,
            }
        }
    }

    /// Like [`Node::try_update`], but only succeeds while the current value
    /// compares equal to `expected`. Returns the previous weight on success
    /// so the caller can account for the weight difference.
    pub(crate) fn try_update_if_equal(
        &self,
        expected: &V,
        value: V,
        weight: u32,
        guard: &Guard,
    ) -> Option<u32>
    where
        V: PartialEq,
    {
        let mut new = Owned::new(WeightedEntry::alive(value, weight));
        loop {
            let current = self.entry.load(Ordering::Acquire, guard);
            let current_ref = unsafe { current.deref() };
            if !current_ref.is_alive() || current_ref.value != *expected {
                return None;
            }
            match self.entry.compare_exchange(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => {
                    let prior_weight = current_ref.weight as u32;
                    unsafe { guard.defer_destroy(current) };
                    return Some(prior_weight);
                }
                Err(e) => new = e.new,
            }
        }
    }

    /// Attempts the Alive -> Retired transition, returning the positive
    /// weight on success. Fails when the entry is already retired or dead.
    pub(crate) fn try_retire(&self, guard: &Guard) -> Option<u32> {
        loop {
            let current = self.entry.load(Ordering::Acquire, guard);
            let current_ref = unsafe { current.deref() };
            if !current_ref.is_alive() {
                return None;
            }
            let retired = WeightedEntry {
                value: current_ref.value.clone(),
                weight: -current_ref.weight,
            };
            match self.entry.compare_exchange(
                current,
                Owned::new(retired),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => {
                    let weight = current_ref.weight as u32;
                    unsafe { guard.defer_destroy(current) };
                    return Some(weight);
                }
                Err(_) => continue,
            }
        }
    }

    /// Retires the entry unconditionally, spinning against concurrent value
    /// updates. No-op when the entry is already retired or dead.
    pub(crate) fn make_retired(&self, guard: &Guard) {
        loop {
            let current = self.entry.load(Ordering::Acquire, guard);
            if !unsafe { current.deref() }.is_alive() {
                return;
            }
            if self.try_retire(guard).is_some() {
                return;
            }
        }
    }

    /// Transitions the entry to Dead from any state, returning the absolute
    /// prior weight. Returns 0 when the entry was already dead, so the
    /// weighted size is decremented exactly once per entry.
    pub(crate) fn make_dead(&self, guard: &Guard) -> u64 {
        loop {
            let current = self.entry.load(Ordering::Acquire, guard);
            let current_ref = unsafe { current.deref() };
            if current_ref.is_dead() {
                return 0;
            }
            let dead = WeightedEntry {
                value: current_ref.value.clone(),
                weight: 0,
            };
            match self.entry.compare_exchange(
                current,
                Owned::new(dead),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => {
                    let weight = current_ref.weight.unsigned_abs() as u64;
                    unsafe { guard.defer_destroy(current) };
                    return weight;
                }
                Err(_) => continue,
            }
        }
    }
}

impl<K, V> Drop for Node<K, V> {
    fn drop(&mut self) {
        // The node is no longer shared; reclaim the snapshot directly.
        let entry = std::mem::replace(&mut self.entry, Atomic::null());
        unsafe {
            drop(entry.into_owned());
        }
    }
}

impl<K, V> std::fmt::Debug for Node<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Node;
    use std::sync::Arc;

    #[test]
    fn state_transitions() {
        let guard = crossbeam_epoch::pin();
        let node = Node::new(Arc::new("k"), "v".to_string(), 3);

        assert!(node.is_alive(&guard));
        assert_eq!(node.value(&guard), "v".to_string());

        // Alive -> Retired keeps the value readable and reports the weight.
        assert_eq!(node.try_retire(&guard), Some(3));
        assert!(!node.is_alive(&guard));
        assert_eq!(node.value(&guard), "v".to_string());

        // A second retire must fail, and updates must be rejected.
        assert_eq!(node.try_retire(&guard), None);
        assert!(node.try_update("w".to_string(), 1, &guard).is_none());

        // Retired -> Dead reports the absolute weight exactly once.
        assert_eq!(node.make_dead(&guard), 3);
        assert_eq!(node.make_dead(&guard), 0);
    }

    #[test]
    fn update_alive() {
        let guard = crossbeam_epoch::pin();
        let node = Node::new(Arc::new(1), "a".to_string(), 2);

        let prior = node.try_update("b".to_string(), 5, &guard);
        assert_eq!(prior, Some(("a".to_string(), 2)));
        assert!(node.is_alive(&guard));
        assert_eq!(node.value(&guard), "b".to_string());

        // Killing an alive entry (eviction path) reports the current weight.
        assert_eq!(node.make_dead(&guard), 5);
        assert!(node.try_update("c".to_string(), 1, &guard).is_none());
    }

    #[test]
    fn conditional_update_checks_the_value() {
        let guard = crossbeam_epoch::pin();
        let node = Node::new(Arc::new(1), "a".to_string(), 2);

        assert_eq!(
            node.try_update_if_equal(&"x".to_string(), "b".to_string(), 1, &guard),
            None
        );
        assert_eq!(node.value(&guard), "a".to_string());

        assert_eq!(
            node.try_update_if_equal(&"a".to_string(), "b".to_string(), 4, &guard),
            Some(2)
        );
        assert_eq!(node.value(&guard), "b".to_string());

        node.make_retired(&guard);
        assert_eq!(
            node.try_update_if_equal(&"b".to_string(), "c".to_string(), 1, &guard),
            None
        );
    }

    #[test]
    fn make_retired_is_idempotent() {
        let guard = crossbeam_epoch::pin();
        let node = Node::new(Arc::new(1), 10_u64, 1);

        node.make_retired(&guard);
        node.make_retired(&guard);
        assert!(!node.is_alive(&guard));
        assert_eq!(node.make_dead(&guard), 1);
    }
}
