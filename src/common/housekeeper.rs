use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

pub(crate) trait InnerSync: Send + Sync + 'static {
    /// Attempts a non-blocking drain of the pending-operation buffers.
    fn try_run_pending_tasks(&self);
}

/// A periodic catch-up task for caches whose buffers would otherwise only be
/// drained by foreground traffic. The thread holds a `Weak` reference to the
/// cache internals so that it never keeps a dropped cache alive; it exits on
/// the first tick after the cache is gone, or when the owning handle signals
/// shutdown.
pub(crate) struct Housekeeper {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Housekeeper {
    pub(crate) fn start<T: InnerSync>(inner: &Arc<T>, period: Duration) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let target: Weak<T> = Arc::downgrade(inner);
        let flag = Arc::clone(&shutdown);

        let thread = thread::Builder::new()
            .name("linked-cache-housekeeper".into())
            .spawn(move || loop {
                thread::park_timeout(period);
                if flag.load(Ordering::Acquire) {
                    break;
                }
                match target.upgrade() {
                    Some(inner) => inner.try_run_pending_tasks(),
                    None => break,
                }
            })
            .expect("Failed to spawn the housekeeper thread");

        Self {
            shutdown,
            thread: Some(thread),
        }
    }
}

impl Drop for Housekeeper {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Housekeeper, InnerSync};
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl InnerSync for Counter {
        fn try_run_pending_tasks(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn runs_periodically_and_stops_on_drop() {
        let counter = Arc::new(Counter::default());
        let housekeeper = Housekeeper::start(&counter, Duration::from_millis(5));

        while counter.0.load(Ordering::Relaxed) == 0 {
            std::thread::sleep(Duration::from_millis(5));
        }

        drop(housekeeper);
        let calls = counter.0.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(30));
        // No more ticks after the handle was dropped.
        assert_eq!(counter.0.load(Ordering::Relaxed), calls);
    }

    #[test]
    fn exits_when_the_target_is_dropped() {
        let counter = Arc::new(Counter::default());
        let mut housekeeper = Housekeeper::start(&counter, Duration::from_millis(5));
        drop(counter);

        // The thread notices the dead Weak on its next tick and exits; join
        // must not hang.
        let thread = housekeeper.thread.take().unwrap();
        thread.thread().unpark();
        thread.join().unwrap();
    }
}
