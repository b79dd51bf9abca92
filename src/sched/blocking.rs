//! Worker pool for the blocking escape hatch.
//!
//! The scheduler never blocks its loop thread. Work that must block (a
//! long computation, a synchronous OS call with no readiness interface)
//! goes through this pool: a small set of lazily spawned OS threads
//! draining a FIFO queue.
//!
//! Threads are spawned up to `max_threads` as demand arrives and retire
//! after sitting idle past a threshold. Shutdown is cooperative: the
//! owning scheduler flips the flag, wakes everyone, and joins.

use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Idle time after which a worker thread exits.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on pool threads.
const MAX_THREADS: usize = 4;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolInner {
    queue: SegQueue<Job>,
    /// Guards the condvar; the queue itself is lock-free.
    mutex: Mutex<()>,
    condvar: Condvar,
    shutdown: AtomicBool,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
}

/// FIFO pool of worker threads.
pub(crate) struct WorkerPool {
    inner: Arc<PoolInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                queue: SegQueue::new(),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
                shutdown: AtomicBool::new(false),
                active_threads: AtomicUsize::new(0),
                idle_threads: AtomicUsize::new(0),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Enqueues a job, spawning a worker if none is idle and the cap
    /// allows another.
    pub(crate) fn spawn(&self, job: Job) {
        let inner = &self.inner;
        inner.queue.push(job);

        if inner.idle_threads.load(Ordering::Acquire) == 0 {
            let active = inner.active_threads.load(Ordering::Acquire);
            if active < MAX_THREADS {
                self.spawn_worker();
            }
        }
        let _guard = inner.mutex.lock().expect("pool mutex poisoned");
        inner.condvar.notify_one();
    }

    fn spawn_worker(&self) {
        let inner = Arc::clone(&self.inner);
        inner.active_threads.fetch_add(1, Ordering::AcqRel);
        let index = inner.active_threads.load(Ordering::Relaxed);
        let builder = std::thread::Builder::new().name(format!("netsonde-worker-{index}"));
        let handle = builder.spawn(move || worker_loop(&inner));
        match handle {
            Ok(handle) => self
                .handles
                .lock()
                .expect("pool handle list poisoned")
                .push(handle),
            Err(err) => {
                self.inner.active_threads.fetch_sub(1, Ordering::AcqRel);
                tracing::warn!(error = %err, "failed to spawn worker thread");
            }
        }
    }

    /// Signals shutdown and joins every worker.
    pub(crate) fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.inner.mutex.lock().expect("pool mutex poisoned");
            self.inner.condvar.notify_all();
        }
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.handles.lock().expect("pool handle list poisoned"),
        );
        for handle in handles {
            if handle.join().is_err() {
                tracing::warn!("worker thread panicked during shutdown");
            }
        }
    }

    #[cfg(test)]
    fn active_threads(&self) -> usize {
        self.inner.active_threads.load(Ordering::Acquire)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: &Arc<PoolInner>) {
    loop {
        if let Some(job) = inner.queue.pop() {
            job();
            continue;
        }
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }

        inner.idle_threads.fetch_add(1, Ordering::AcqRel);
        let mut timed_out = false;
        {
            let guard = inner.mutex.lock().expect("pool mutex poisoned");
            // Re-check under the lock so a push between pop and park is
            // not lost, then park until notified or idle-retirement.
            if inner.queue.is_empty() && !inner.shutdown.load(Ordering::Acquire) {
                let (guard, wait) = inner
                    .condvar
                    .wait_timeout(guard, IDLE_TIMEOUT)
                    .expect("pool mutex poisoned");
                timed_out = wait.timed_out();
                drop(guard);
            }
        }
        inner.idle_threads.fetch_sub(1, Ordering::AcqRel);

        if timed_out && inner.queue.is_empty() {
            // Idle past the threshold with nothing queued: retire.
            break;
        }
    }
    inner.active_threads.fetch_sub(1, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    #[test]
    fn runs_submitted_jobs() {
        let pool = WorkerPool::new();
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            pool.spawn(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 16 {
            assert!(Instant::now() < deadline, "jobs did not finish in time");
            std::thread::sleep(Duration::from_millis(5));
        }
        pool.shutdown();
    }

    #[test]
    fn respects_thread_cap() {
        let pool = WorkerPool::new();
        let gate = Arc::new(AtomicBool::new(false));
        for _ in 0..32 {
            let gate = Arc::clone(&gate);
            pool.spawn(Box::new(move || {
                while !gate.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }));
        }
        std::thread::sleep(Duration::from_millis(50));
        assert!(pool.active_threads() <= MAX_THREADS);
        gate.store(true, Ordering::Release);
        pool.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let pool = WorkerPool::new();
        pool.spawn(Box::new(|| {}));
        pool.shutdown();
        pool.shutdown();
    }
}
