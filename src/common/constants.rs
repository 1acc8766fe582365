/// The largest weight a single entry may carry. Bounds the total weight of
/// a full replay batch to within `i64`, and leaves the sign bit (plus a few
/// guard bits) free for the entry lifecycle encoding.
pub const MAXIMUM_WEIGHT: u32 = 1 << 29;

/// The maximum number of buffered tasks replayed per drain pass.
pub(crate) const MAXIMUM_BATCH_SIZE: usize = 64;

/// A read buffer shorter than this makes draining optional.
pub(crate) const BUFFER_THRESHOLD: usize = 16;

/// The per-stripe length at which buffered reads start being discarded
/// instead of queued.
pub(crate) const MAXIMUM_BUFFER_SIZE: usize = 1 << 20;
