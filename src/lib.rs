#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! A concurrent hash map bounded by a weighted capacity, evicting its least
//! recently used entries.
//!
//! The design keeps eviction bookkeeping off the hot path: `get`, `insert`
//! and friends operate on a sharded lock-free index and merely record what
//! they did into striped pending-operation buffers. Whichever thread next
//! acquires the (uncontended, try-locked) eviction lock replays those
//! records against an intrusive recency deque and pops LRU victims until
//! the cache fits its capacity again. The recency order and `weighted_size`
//! are therefore eventually consistent with the map contents; `get` itself
//! is always linearizable against `insert` and `remove`.
//!
//! # Example
//!
//! ```
//! use linked_cache::CacheBuilder;
//!
//! let cache = CacheBuilder::new(2)
//!     .eviction_listener(|key, value| println!("evicted {key}: {value}"))
//!     .build();
//!
//! cache.insert(1, "one");
//! cache.insert(2, "two");
//! cache.get(&1); // protects key 1 from the next eviction
//! cache.insert(3, "three");
//! cache.run_pending_tasks();
//!
//! assert!(cache.contains_key(&1));
//! assert!(!cache.contains_key(&2));
//! assert!(cache.contains_key(&3));
//! ```

pub(crate) mod builder;
pub(crate) mod cache;
pub(crate) mod common;
pub(crate) mod notification;

pub use builder::CacheBuilder;
pub use cache::Cache;
pub use common::constants::MAXIMUM_WEIGHT;
pub use common::Weigher;
pub use notification::EvictionListener;
