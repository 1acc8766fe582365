use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

/// A function called once for each entry evicted due to capacity overflow.
///
/// The listener runs on whichever thread happened to drain the buffers, after
/// the eviction lock has been released. Entries removed explicitly (via
/// `remove`, `replace` or `clear`) are never reported.
///
/// The cache does not insulate callers from a panicking listener: the panic
/// propagates to the delivering thread. Guard inside the listener if that
/// matters.
pub type EvictionListener<K, V> = Arc<dyn Fn(Arc<K>, V) + Send + Sync + 'static>;

/// Collects evicted entries during an eviction pass and delivers them to the
/// listener outside the eviction lock. Multi-producer/multi-consumer by
/// construction: any draining thread may enqueue, and any thread that just
/// finished a drain flushes.
pub(crate) struct RemovalNotifier<K, V> {
    listener: EvictionListener<K, V>,
    tx: Sender<(Arc<K>, V)>,
    rx: Receiver<(Arc<K>, V)>,
}

impl<K, V> RemovalNotifier<K, V> {
    pub(crate) fn new(listener: EvictionListener<K, V>) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { listener, tx, rx }
    }

    /// Records an evicted entry. Called while the eviction lock is held.
    pub(crate) fn enqueue(&self, key: Arc<K>, value: V) {
        let _ = self.tx.send((key, value));
    }

    /// Delivers every queued notification on the calling thread.
    pub(crate) fn deliver_all(&self) {
        while let Ok((key, value)) = self.rx.try_recv() {
            self.notify(key, value);
        }
    }

    fn notify(&self, key: Arc<K>, value: V) {
        #[cfg(feature = "logging")]
        {
            use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

            let listener = &self.listener;
            if let Err(payload) = catch_unwind(AssertUnwindSafe(move || listener(key, value))) {
                log::error!("The eviction listener panicked while handling an evicted entry");
                resume_unwind(payload);
            }
        }
        #[cfg(not(feature = "logging"))]
        (self.listener)(key, value);
    }
}
