//! Per worker thread state.
//!
//! A worker owns a run queue, a lookup cache shared by every process it
//! runs, and an idle monitor it sleeps on when there is nothing to do.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::queue::SegQueue;
use parking_lot::{Condvar, Mutex};

use crate::lookup_cache::LookupCache;
use crate::program::ProcessRef;

pub struct ThreadState {
    id: usize,
    queue: SegQueue<ProcessRef>,
    cache: Mutex<Option<Box<LookupCache>>>,
    wake: Mutex<bool>,
    idle: Condvar,
    processes_run: AtomicUsize,
}

impl ThreadState {
    pub fn new(id: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            queue: SegQueue::new(),
            cache: Mutex::new(None),
            wake: Mutex::new(false),
            idle: Condvar::new(),
            processes_run: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    // ------------------------------------------------------------------
    // Run queue
    // ------------------------------------------------------------------

    pub fn enqueue(&self, process: ProcessRef) {
        self.queue.push(process);
        self.notify();
    }

    pub fn dequeue(&self) -> Option<ProcessRef> {
        let process = self.queue.pop()?;
        self.processes_run.fetch_add(1, Ordering::Relaxed);
        Some(process)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn processes_run(&self) -> usize {
        self.processes_run.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Lookup cache
    // ------------------------------------------------------------------

    /// Run `f` on this thread's cache, creating it on first use.
    pub fn with_lookup_cache<R>(&self, f: impl FnOnce(&mut LookupCache) -> R) -> R {
        let mut cache = self.cache.lock();
        f(cache.get_or_insert_with(|| Box::new(LookupCache::new())))
    }

    pub fn has_lookup_cache(&self) -> bool {
        self.cache.lock().is_some()
    }

    pub fn clear_lookup_cache(&self) {
        if let Some(cache) = self.cache.lock().as_mut() {
            cache.clear();
        }
    }

    // ------------------------------------------------------------------
    // Idle monitor
    // ------------------------------------------------------------------

    /// Sleep until notified or until `timeout` passes. Returns whether a
    /// notification arrived.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let mut wake = self.wake.lock();
        if !*wake {
            self.idle.wait_for(&mut wake, timeout);
        }
        std::mem::replace(&mut *wake, false)
    }

    pub fn notify(&self) {
        *self.wake.lock() = true;
        self.idle.notify_one();
    }
}

impl std::fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadState")
            .field("id", &self.id)
            .field("queued", &self.queue.len())
            .finish()
    }
}
