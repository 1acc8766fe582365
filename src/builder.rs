use std::{
    collections::hash_map::RandomState,
    hash::{BuildHasher, Hash},
    sync::Arc,
    time::Duration,
};

use crate::{cache::Cache, common::Weigher, notification::EvictionListener};

/// Builds a [`Cache`] with the given configuration.
///
/// Configuration mistakes are usage errors and panic at build (or call)
/// time rather than returning a `Result`.
///
/// # Examples
///
/// ```
/// use linked_cache::CacheBuilder;
///
/// // A cache bounded by the total length of its string values.
/// let cache = CacheBuilder::new(1024)
///     .weigher(|_key: &String, value: &String| value.len() as u32)
///     .eviction_listener(|key, value| println!("evicted {key}: {value}"))
///     .build();
///
/// cache.insert("a".to_string(), "x".repeat(100));
/// cache.run_pending_tasks();
/// assert_eq!(cache.weighted_size(), 100);
/// ```
#[must_use]
pub struct CacheBuilder<K, V> {
    max_capacity: u64,
    initial_capacity: Option<usize>,
    concurrency_level: Option<usize>,
    weigher: Option<Weigher<K, V>>,
    eviction_listener: Option<EvictionListener<K, V>>,
    catch_up_period: Option<Duration>,
}

impl<K, V> CacheBuilder<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Starts a builder for a cache holding up to `max_capacity` total
    /// weight (entry count, unless a [`weigher`](Self::weigher) is set).
    pub fn new(max_capacity: u64) -> Self {
        Self {
            max_capacity,
            initial_capacity: None,
            concurrency_level: None,
            weigher: None,
            eviction_listener: None,
            catch_up_period: None,
        }
    }

    /// Pre-sizes the hash table for the expected number of entries.
    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = Some(capacity);
        self
    }

    /// An estimate of the number of threads that will mutate the cache
    /// concurrently, used to size the internal sharding. The default lets
    /// the hash table pick based on the number of CPUs.
    ///
    /// # Panics
    ///
    /// Panics if `level` is zero.
    pub fn concurrency_level(mut self, level: usize) -> Self {
        assert!(level > 0, "concurrency_level must be positive");
        self.concurrency_level = Some(level);
        self
    }

    /// Sets a function computing the weight of each entry, in
    /// `1..=`[`MAXIMUM_WEIGHT`]. Weights outside that range make the
    /// offending `insert`/`replace` call panic.
    ///
    /// [`MAXIMUM_WEIGHT`]: crate::MAXIMUM_WEIGHT
    pub fn weigher(mut self, weigher: impl Fn(&K, &V) -> u32 + Send + Sync + 'static) -> Self {
        self.weigher = Some(Arc::new(weigher));
        self
    }

    /// Sets a listener called once for each entry evicted to honor the
    /// capacity bound. See [`EvictionListener`] for the delivery contract.
    pub fn eviction_listener(mut self, listener: impl Fn(Arc<K>, V) + Send + Sync + 'static) -> Self {
        self.eviction_listener = Some(Arc::new(listener));
        self
    }

    /// Spawns a background thread that drains the pending-operation buffers
    /// every `period`, so a cache that stops receiving traffic still
    /// converges (and delivers its notifications) without waiting for the
    /// next foreground operation. Without this, maintenance runs only
    /// piggybacked on cache operations.
    ///
    /// The cache spawns and owns a dedicated thread for this rather than
    /// accepting a caller-supplied executor; the thread is joined when the
    /// last cache handle is dropped.
    ///
    /// # Panics
    ///
    /// Panics if `period` is zero.
    pub fn catch_up_period(mut self, period: Duration) -> Self {
        assert!(!period.is_zero(), "catch_up_period must be positive");
        self.catch_up_period = Some(period);
        self
    }

    /// Builds a cache using the default hasher.
    pub fn build(self) -> Cache<K, V, RandomState> {
        self.build_with_hasher(RandomState::default())
    }

    /// Builds a cache that hashes keys with `hasher`.
    pub fn build_with_hasher<S>(self, hasher: S) -> Cache<K, V, S>
    where
        S: BuildHasher + Clone + Send + Sync + 'static,
    {
        Cache::with_everything(
            self.max_capacity,
            self.initial_capacity,
            self.concurrency_level,
            hasher,
            self.weigher,
            self.eviction_listener,
            self.catch_up_period,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::CacheBuilder;
    use std::time::Duration;

    #[test]
    fn build_with_defaults() {
        let cache = CacheBuilder::new(100).build();
        assert_eq!(cache.capacity(), 100);
        assert!(cache.is_empty());

        cache.insert(1, 'a');
        assert_eq!(cache.get(&1), Some('a'));
    }

    #[test]
    fn build_with_everything() {
        let cache = CacheBuilder::new(100)
            .initial_capacity(32)
            .concurrency_level(4)
            .weigher(|_k: &u32, _v: &char| 2)
            .eviction_listener(|_k, _v| ())
            .build();

        cache.insert(1, 'a');
        cache.run_pending_tasks();
        assert_eq!(cache.weighted_size(), 2);
    }

    #[test]
    #[should_panic(expected = "concurrency_level must be positive")]
    fn zero_concurrency_level_panics() {
        let _ = CacheBuilder::<u32, u32>::new(100).concurrency_level(0);
    }

    #[test]
    #[should_panic(expected = "catch_up_period must be positive")]
    fn zero_catch_up_period_panics() {
        let _ = CacheBuilder::<u32, u32>::new(100).catch_up_period(Duration::ZERO);
    }

    #[test]
    fn housekeeper_stops_with_the_cache() {
        let cache = CacheBuilder::new(10)
            .catch_up_period(Duration::from_millis(10))
            .build();

        cache.insert(1, "a");
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.get(&1), Some("a"));

        // Dropping the last handle must join the background thread rather
        // than hang or leak it.
        drop(cache);
    }
}
