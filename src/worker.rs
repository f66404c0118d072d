use std::cell::Cell;

thread_local! {
    static CONCURRENT_GC_WORKER: Cell<bool> = Cell::new(false);
}

/// Mark the current thread as a concurrent GC worker for the lifetime of the
/// returned scope.
pub struct ConcurrentGcWorkerScope {
    _priv: (),
}

impl ConcurrentGcWorkerScope {
    pub fn new() -> Self {
        CONCURRENT_GC_WORKER.with(|flag| {
            assert!(!flag.get(), "thread is already a concurrent GC worker");
            flag.set(true);
        });
        Self { _priv: () }
    }
}

impl Default for ConcurrentGcWorkerScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConcurrentGcWorkerScope {
    fn drop(&mut self) {
        CONCURRENT_GC_WORKER.with(|flag| flag.set(false));
    }
}

pub fn is_concurrent_gc_worker() -> bool {
    CONCURRENT_GC_WORKER.with(|flag| flag.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_flags_the_thread() {
        assert!(!is_concurrent_gc_worker());
        {
            let _scope = ConcurrentGcWorkerScope::new();
            assert!(is_concurrent_gc_worker());
        }
        assert!(!is_concurrent_gc_worker());
    }

    #[test]
    fn other_threads_are_unaffected() {
        let _scope = ConcurrentGcWorkerScope::new();
        std::thread::spawn(|| assert!(!is_concurrent_gc_worker()))
            .join()
            .unwrap();
    }
}
