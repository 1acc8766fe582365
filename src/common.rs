use std::sync::Arc;

pub(crate) mod buffer;
pub(crate) mod constants;
pub(crate) mod deque;
pub(crate) mod entry;
pub(crate) mod housekeeper;

/// A function that assigns a positive weight to a cached value.
///
/// The weight must be in `1..=MAXIMUM_WEIGHT`; a weigher returning anything
/// else makes the triggering insert panic before any mutation takes place.
pub type Weigher<K, V> = Arc<dyn Fn(&K, &V) -> u32 + Send + Sync + 'static>;

/// The number of pending-operation buffers: the next power of two at or
/// above the available parallelism.
pub(crate) fn num_buffer_stripes() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .next_power_of_two()
}
