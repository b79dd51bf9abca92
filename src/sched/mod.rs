//! Cooperative event loop.
//!
//! One [`Scheduler`] owns one loop. Everything the crate does (transport
//! I/O, DNS traffic, delayed work) is driven from the single thread that
//! calls [`Scheduler::run`]:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Scheduler                             │
//! │  ┌───────────┐  ┌──────────┐  ┌───────────┐  ┌────────────┐  │
//! │  │ ready     │  │ timer    │  │ watch     │  │ Reactor    │  │
//! │  │ queue     │  │ heap     │  │ arena     │  │ (epoll)    │  │
//! │  └───────────┘  └──────────┘  └───────────┘  └────────────┘  │
//! │        ▲                                           ▲         │
//! │        │ injection queue (Send)                    │ notify  │
//! │  ┌─────┴──────────┐                      ┌─────────┴──────┐  │
//! │  │ RemoteHandle   │                      │ WorkerPool     │  │
//! │  │ (any thread)   │                      │ (blocking jobs)│  │
//! │  └────────────────┘                      └────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Loop semantics
//!
//! Each iteration drains, in order: cross-thread injected tasks, the
//! immediate-task queue (FIFO), and expired timers; then it checks for
//! stop/exhaustion and finally polls the reactor for readiness, bounded
//! by the earliest deadline and a fixed 10-second no-op wakeup. The
//! periodic wakeup exists because off-loop work (worker-pool jobs)
//! produces no loop-visible registration while in flight; without it the
//! loop could observe a transient empty state and exit prematurely.
//!
//! # Threading
//!
//! [`Scheduler`] is a single-thread handle (`!Send`). Foreign threads use
//! a [`RemoteHandle`] whose submissions re-enter the loop through the
//! injection queue before touching any loop-owned state.

pub mod blocking;
pub mod interest;
pub mod reactor;
pub mod slab;
pub mod timer;

pub use interest::{Interest, Readiness};
pub use slab::Slot;

use crate::error::{Error, ErrorKind};
use blocking::WorkerPool;
use parking_lot::Mutex;
use polling::Poller;
use reactor::{Fired, Reactor};
use slab::Arena;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use timer::{TimerHeap, TimerTarget};

/// Cadence of the recurring no-op wakeup bounding every poll.
const PERIODIC_WAKEUP: Duration = Duration::from_secs(10);

/// A unit of work owned by the loop from submission to execution.
type Task = Box<dyn FnOnce() + 'static>;

/// A unit of work crossing a thread boundary into the loop.
type SendTask = Box<dyn FnOnce() + Send + 'static>;

/// Completion callback of an fd watch.
type WatchCallback = Box<dyn FnOnce(Result<Readiness, Error>) + 'static>;

/// Handle to a pending [`Scheduler::watch`] registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchToken(Slot);

/// Handle to a pending [`Scheduler::submit_after`] task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayToken(Slot);

struct WatchEntry {
    fd: RawFd,
    interest: Interest,
    callback: WatchCallback,
}

/// Cross-thread side of the scheduler: injection queue, stop flag, and
/// the count of in-flight off-loop jobs.
struct Injector {
    queue: Mutex<VecDeque<SendTask>>,
    stop: AtomicBool,
    off_loop: AtomicUsize,
    waker: Arc<Poller>,
}

impl Injector {
    fn submit(&self, task: SendTask) {
        self.queue.lock().push_back(task);
        self.wake();
    }

    /// Queues the worker's continuation (if any) and retires the job in
    /// one step, so the loop never observes a finished job without its
    /// continuation.
    fn finish_background(&self, continuation: Option<SendTask>) {
        if let Some(task) = continuation {
            self.queue.lock().push_back(task);
        }
        self.off_loop.fetch_sub(1, Ordering::AcqRel);
        self.wake();
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake();
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn clear_stop(&self) {
        self.stop.store(false, Ordering::Release);
    }

    fn wake(&self) {
        if let Err(err) = self.waker.notify() {
            tracing::warn!(error = %err, "reactor wake failed");
        }
    }
}

/// Sendable handle for submitting work to the loop from foreign threads.
///
/// This is the only legal path from a worker thread (or any other thread)
/// back into loop-owned state: the submitted closure runs on the loop
/// thread at the top of its next iteration.
#[derive(Clone)]
pub struct RemoteHandle {
    injector: Arc<Injector>,
}

impl RemoteHandle {
    /// Submits a task to run on the loop thread.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        self.injector.submit(Box::new(task));
    }

    /// Requests the loop to exit at its next safe point. Idempotent.
    pub fn stop(&self) {
        self.injector.request_stop();
    }
}

impl std::fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHandle").finish_non_exhaustive()
    }
}

struct Core {
    reactor: Reactor,
    ready: RefCell<VecDeque<Task>>,
    delayed: RefCell<Arena<Task>>,
    watches: RefCell<Arena<WatchEntry>>,
    timers: RefCell<TimerHeap>,
    injector: Arc<Injector>,
    pool: RefCell<Option<WorkerPool>>,
    running: Cell<bool>,
}

/// The cooperative scheduler driving one event loop.
///
/// Cloning is cheap (shared handle). The handle is `!Send`; see
/// [`Scheduler::remote`] for the cross-thread entry point.
#[derive(Clone)]
pub struct Scheduler {
    core: Rc<Core>,
}

impl Scheduler {
    /// Creates a scheduler with a fresh OS poller.
    pub fn new() -> Result<Self, Error> {
        let reactor = Reactor::new().map_err(|e| Error::from_io(&e, "create poller"))?;
        let waker = reactor.wake_handle();
        Ok(Self {
            core: Rc::new(Core {
                reactor,
                ready: RefCell::new(VecDeque::new()),
                delayed: RefCell::new(Arena::new()),
                watches: RefCell::new(Arena::new()),
                timers: RefCell::new(TimerHeap::new()),
                injector: Arc::new(Injector {
                    queue: Mutex::new(VecDeque::new()),
                    stop: AtomicBool::new(false),
                    off_loop: AtomicUsize::new(0),
                    waker,
                }),
                pool: RefCell::new(None),
                running: Cell::new(false),
            }),
        })
    }

    /// Enqueues a task for the next loop iteration.
    ///
    /// Tasks submitted from the loop thread run in submission order.
    pub fn submit_now(&self, task: impl FnOnce() + 'static) {
        self.core.ready.borrow_mut().push_back(Box::new(task));
    }

    /// Schedules a task to run no earlier than `delay` from now.
    ///
    /// A zero delay behaves like [`Scheduler::submit_now`]. The returned
    /// token may be passed to [`Scheduler::cancel_delayed`]; it is `None`
    /// for the zero-delay case.
    pub fn submit_after(
        &self,
        delay: Duration,
        task: impl FnOnce() + 'static,
    ) -> Option<DelayToken> {
        if delay.is_zero() {
            self.submit_now(task);
            return None;
        }
        let slot = self.core.delayed.borrow_mut().insert(Box::new(task));
        self.core
            .timers
            .borrow_mut()
            .insert(Instant::now() + delay, TimerTarget::Task(slot));
        Some(DelayToken(slot))
    }

    /// Cancels a delayed task without running it.
    ///
    /// A token whose task already ran is ignored.
    pub fn cancel_delayed(&self, token: DelayToken) {
        let _ = self.core.delayed.borrow_mut().remove(token.0);
        // The heap entry stays behind as a tombstone; firing it later
        // fails the generation check.
    }

    /// Registers a one-shot readiness watch on a raw descriptor.
    ///
    /// The callback fires exactly once: with the readiness state, with a
    /// Timeout error if `timeout` elapses first, or never if the watch is
    /// cancelled via [`Scheduler::unwatch`]. The registration retires
    /// with the callback.
    ///
    /// # Errors
    ///
    /// Fails immediately if the descriptor cannot be registered, or if
    /// the requested direction is already being watched.
    pub fn watch(
        &self,
        fd: RawFd,
        interest: Interest,
        timeout: Option<Duration>,
        callback: impl FnOnce(Result<Readiness, Error>) + 'static,
    ) -> Result<WatchToken, Error> {
        if interest.is_empty() {
            return Err(Error::new(ErrorKind::InvalidInput, "watch without interest"));
        }
        let slot = self.core.watches.borrow_mut().insert(WatchEntry {
            fd,
            interest,
            callback: Box::new(callback),
        });
        if let Err(err) = self.core.reactor.register(fd, interest, slot) {
            self.core.watches.borrow_mut().remove(slot);
            return Err(Error::from_io(&err, "watch registration"));
        }
        if let Some(timeout) = timeout {
            self.core
                .timers
                .borrow_mut()
                .insert(Instant::now() + timeout, TimerTarget::Watch(slot));
        }
        Ok(WatchToken(slot))
    }

    /// Cancels a pending watch without invoking its callback.
    ///
    /// A token whose watch already fired is ignored.
    pub fn unwatch(&self, token: WatchToken) {
        let entry = self.core.watches.borrow_mut().remove(token.0);
        if let Some(entry) = entry {
            self.core.reactor.deregister(entry.fd, entry.interest, token.0);
            // The entry's callback drops here, releasing whatever it kept
            // alive, without being invoked.
        }
    }

    /// Runs a job on a worker thread.
    ///
    /// The job must re-enter the loop through a [`RemoteHandle`] before
    /// touching loop-owned state. While the job is in flight the loop
    /// counts it as outstanding work and will not exit.
    pub fn run_in_background(&self, work: impl FnOnce() + Send + 'static) {
        let injector = Arc::clone(&self.core.injector);
        injector.off_loop.fetch_add(1, Ordering::AcqRel);
        self.with_pool(|pool| {
            pool.spawn(Box::new(move || {
                work();
                injector.finish_background(None);
            }));
        });
    }

    /// Runs `work` on a worker thread, then `completion(result)` on the
    /// loop thread.
    pub fn run_in_background_then<T, W, C>(&self, work: W, completion: C)
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        C: FnOnce(T) + Send + 'static,
    {
        let injector = Arc::clone(&self.core.injector);
        injector.off_loop.fetch_add(1, Ordering::AcqRel);
        self.with_pool(|pool| {
            pool.spawn(Box::new(move || {
                let result = work();
                injector.finish_background(Some(Box::new(move || completion(result))));
            }));
        });
    }

    fn with_pool(&self, f: impl FnOnce(&WorkerPool)) {
        let mut pool = self.core.pool.borrow_mut();
        let pool = pool.get_or_insert_with(WorkerPool::new);
        f(pool);
    }

    /// Returns the sendable cross-thread handle.
    #[must_use]
    pub fn remote(&self) -> RemoteHandle {
        RemoteHandle {
            injector: Arc::clone(&self.core.injector),
        }
    }

    /// Requests the loop to exit at its next safe point. Idempotent.
    pub fn stop(&self) {
        self.core.injector.request_stop();
    }

    /// Drives the loop until [`Scheduler::stop`] or exhaustion of
    /// outstanding work.
    ///
    /// # Errors
    ///
    /// A fatal poller failure propagates and unwinds the loop. Calling
    /// `run` while the loop is already running is an error.
    pub fn run(&self) -> Result<(), Error> {
        if self.core.running.replace(true) {
            return Err(Error::new(ErrorKind::InvalidInput, "loop already running"));
        }
        let result = self.run_inner();
        self.core.running.set(false);
        self.core.injector.clear_stop();
        result
    }

    fn run_inner(&self) -> Result<(), Error> {
        let core = &self.core;
        let mut fired: Vec<Fired> = Vec::new();
        loop {
            // Cross-thread submissions re-enter here.
            let injected: Vec<SendTask> = core.injector.queue.lock().drain(..).collect();
            for task in injected {
                task();
            }

            // Immediate tasks, in submission order. Tasks submitted while
            // draining run on the next iteration.
            let batch: Vec<Task> = {
                let mut ready = core.ready.borrow_mut();
                ready.drain(..).collect()
            };
            for task in batch {
                task();
            }

            // Expired timers: delayed tasks and watch timeouts. A target
            // whose slot was already retired fails the generation check
            // and is skipped.
            let now = Instant::now();
            let expired = core.timers.borrow_mut().pop_expired(now);
            for target in expired {
                match target {
                    TimerTarget::Task(slot) => {
                        let task = core.delayed.borrow_mut().remove(slot);
                        if let Some(task) = task {
                            task();
                        }
                    }
                    TimerTarget::Watch(slot) => self.expire_watch(slot),
                }
            }

            if core.injector.stop_requested() {
                tracing::debug!("loop stopping on request");
                break;
            }
            if self.is_idle() {
                tracing::debug!("loop exiting: no outstanding work");
                break;
            }

            fired.clear();
            // Work queued by the callbacks above must not wait out a full
            // poll; degrade to a readiness sweep.
            let immediate = !core.ready.borrow().is_empty()
                || !core.injector.queue.lock().is_empty();
            let timeout = if immediate {
                Duration::ZERO
            } else {
                self.poll_timeout()
            };
            if let Err(err) = core.reactor.poll(Some(timeout), &mut fired) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::warn!(error = %err, "fatal poll failure");
                return Err(Error::from_io(&err, "poll"));
            }
            for event in &fired {
                self.dispatch_watch(event.watch, event.ready);
            }
        }
        Ok(())
    }

    /// Delivers a timeout to a watch whose deadline passed.
    fn expire_watch(&self, slot: Slot) {
        let entry = self.core.watches.borrow_mut().remove(slot);
        let Some(entry) = entry else {
            // Fired or cancelled before its deadline: tombstoned.
            return;
        };
        self.core.reactor.deregister(entry.fd, entry.interest, slot);
        (entry.callback)(Err(Error::new(ErrorKind::Timeout, "watch")));
    }

    /// Delivers readiness to a watch the reactor reported.
    fn dispatch_watch(&self, slot: Slot, ready: Readiness) {
        let entry = self.core.watches.borrow_mut().remove(slot);
        let Some(entry) = entry else {
            // Cancelled by an earlier callback in the same batch.
            return;
        };
        // A both-directions watch retires whole when either side fires;
        // clear whatever the poll pass left armed.
        self.core.reactor.deregister(entry.fd, entry.interest, slot);
        (entry.callback)(Ok(ready));
    }

    fn is_idle(&self) -> bool {
        let core = &self.core;
        core.ready.borrow().is_empty()
            && core.watches.borrow().is_empty()
            && core.delayed.borrow().is_empty()
            && core.injector.queue.lock().is_empty()
            && core.injector.off_loop.load(Ordering::Acquire) == 0
    }

    fn poll_timeout(&self) -> Duration {
        let now = Instant::now();
        let until_deadline = self
            .core
            .timers
            .borrow()
            .peek_deadline()
            .map(|deadline| deadline.saturating_duration_since(now));
        match until_deadline {
            Some(d) if d < PERIODIC_WAKEUP => d,
            // The recurring no-op wakeup: with off-loop work in flight
            // there may be nothing registered, so never sleep unbounded.
            _ => PERIODIC_WAKEUP,
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("ready", &self.core.ready.borrow().len())
            .field("watches", &self.core.watches.borrow().len())
            .field("delayed", &self.core.delayed.borrow().len())
            .field("running", &self.core.running.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::cell::RefCell;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn submit_now_runs_in_submission_order() {
        init_test("submit_now_runs_in_submission_order");
        let sched = Scheduler::new().expect("create scheduler");
        let order = Rc::new(RefCell::new(Vec::new()));

        for n in 0..5 {
            let order = Rc::clone(&order);
            sched.submit_now(move || order.borrow_mut().push(n));
        }
        sched.run().expect("run");

        let got = order.borrow().clone();
        crate::assert_with_log!(got == vec![0, 1, 2, 3, 4], "order", vec![0, 1, 2, 3, 4], got);
        crate::test_complete!("submit_now_runs_in_submission_order");
    }

    #[test]
    fn zero_delay_runs_before_positive_delay() {
        init_test("zero_delay_runs_before_positive_delay");
        let sched = Scheduler::new().expect("create scheduler");
        let order = Rc::new(RefCell::new(Vec::new()));

        {
            let order = Rc::clone(&order);
            sched.submit_after(Duration::from_millis(30), move || {
                order.borrow_mut().push("late");
            });
        }
        {
            let order = Rc::clone(&order);
            sched.submit_after(Duration::ZERO, move || {
                order.borrow_mut().push("now");
            });
        }
        sched.run().expect("run");

        let got = order.borrow().clone();
        crate::assert_with_log!(got == vec!["now", "late"], "order", vec!["now", "late"], got);
        crate::test_complete!("zero_delay_runs_before_positive_delay");
    }

    #[test]
    fn watch_fires_on_readable() {
        init_test("watch_fires_on_readable");
        let sched = Scheduler::new().expect("create scheduler");
        let (sock, peer) = UnixStream::pair().expect("socketpair");
        sock.set_nonblocking(true).expect("nonblocking");

        let seen = Rc::new(Cell::new(false));
        {
            let seen = Rc::clone(&seen);
            sched
                .watch(
                    sock.as_raw_fd(),
                    Interest::READABLE,
                    Some(Duration::from_secs(5)),
                    move |result| {
                        let ready = result.expect("readiness");
                        assert!(ready.readable);
                        seen.set(true);
                    },
                )
                .expect("watch");
        }
        (&peer).write_all(b"ping").expect("peer write");
        sched.run().expect("run");

        crate::assert_with_log!(seen.get(), "watch fired", true, seen.get());
        crate::test_complete!("watch_fires_on_readable");
    }

    #[test]
    fn watch_times_out_against_silent_peer() {
        init_test("watch_times_out_against_silent_peer");
        let sched = Scheduler::new().expect("create scheduler");
        let (sock, _peer) = UnixStream::pair().expect("socketpair");
        sock.set_nonblocking(true).expect("nonblocking");

        let outcome = Rc::new(RefCell::new(None));
        {
            let outcome = Rc::clone(&outcome);
            sched
                .watch(
                    sock.as_raw_fd(),
                    Interest::READABLE,
                    Some(Duration::from_millis(50)),
                    move |result| {
                        *outcome.borrow_mut() = Some(result);
                    },
                )
                .expect("watch");
        }
        let start = Instant::now();
        sched.run().expect("run");
        let elapsed = start.elapsed();

        let timed_out = matches!(
            outcome.borrow().as_ref(),
            Some(Err(err)) if err.is_timeout()
        );
        crate::assert_with_log!(timed_out, "timeout delivered", true, timed_out);
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_secs(2));
        crate::test_complete!("watch_times_out_against_silent_peer");
    }

    #[test]
    fn unwatch_suppresses_callback() {
        init_test("unwatch_suppresses_callback");
        let sched = Scheduler::new().expect("create scheduler");
        let (sock, peer) = UnixStream::pair().expect("socketpair");
        sock.set_nonblocking(true).expect("nonblocking");

        let fired = Rc::new(Cell::new(false));
        let token = {
            let fired = Rc::clone(&fired);
            sched
                .watch(
                    sock.as_raw_fd(),
                    Interest::READABLE,
                    Some(Duration::from_millis(50)),
                    move |_| fired.set(true),
                )
                .expect("watch")
        };
        (&peer).write_all(b"ping").expect("peer write");
        sched.unwatch(token);
        sched.run().expect("run");

        crate::assert_with_log!(!fired.get(), "callback suppressed", false, fired.get());
        crate::test_complete!("unwatch_suppresses_callback");
    }

    #[test]
    fn background_job_reenters_loop() {
        init_test("background_job_reenters_loop");
        let sched = Scheduler::new().expect("create scheduler");
        let result = Rc::new(Cell::new(0u32));
        {
            let result = Rc::clone(&result);
            sched.run_in_background_then(
                || 6 * 7,
                move |value| {
                    // Runs on the loop thread.
                    result.set(value);
                },
            );
        }
        sched.run().expect("run");
        crate::assert_with_log!(result.get() == 42, "continuation ran", 42u32, result.get());
        crate::test_complete!("background_job_reenters_loop");
    }

    #[test]
    fn stop_is_idempotent_and_exits_promptly() {
        init_test("stop_is_idempotent_and_exits_promptly");
        let sched = Scheduler::new().expect("create scheduler");
        {
            let sched2 = sched.clone();
            sched.submit_after(Duration::from_millis(10), move || {
                sched2.stop();
                sched2.stop();
            });
        }
        // Keep plenty of future work queued so only stop() can end it.
        sched.submit_after(Duration::from_secs(60), || {});
        let start = Instant::now();
        sched.run().expect("run");
        assert!(start.elapsed() < Duration::from_secs(5));
        crate::test_complete!("stop_is_idempotent_and_exits_promptly");
    }

    #[test]
    fn remote_submit_from_foreign_thread() {
        init_test("remote_submit_from_foreign_thread");
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let sched = Scheduler::new().expect("create scheduler");
        let remote = sched.remote();
        let hit = Arc::new(AtomicBool::new(false));

        // Keep the loop alive until the remote task arrives.
        sched.submit_after(Duration::from_secs(30), || {});
        let handle = {
            let hit = Arc::clone(&hit);
            let stopper = sched.remote();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                remote.submit(move || {
                    hit.store(true, Ordering::SeqCst);
                    stopper.stop();
                });
            })
        };
        let start = Instant::now();
        sched.run().expect("run");
        handle.join().expect("join submitter");

        let seen = hit.load(Ordering::SeqCst);
        crate::assert_with_log!(seen, "remote task ran on loop", true, seen);
        assert!(start.elapsed() < Duration::from_secs(5));
        crate::test_complete!("remote_submit_from_foreign_thread");
    }

    #[test]
    fn run_twice_sequentially() {
        init_test("run_twice_sequentially");
        let sched = Scheduler::new().expect("create scheduler");
        let count = Rc::new(Cell::new(0u32));
        {
            let count = Rc::clone(&count);
            sched.submit_now(move || count.set(count.get() + 1));
        }
        sched.run().expect("first run");
        {
            let count = Rc::clone(&count);
            sched.submit_now(move || count.set(count.get() + 1));
        }
        sched.run().expect("second run");
        crate::assert_with_log!(count.get() == 2, "both runs executed", 2u32, count.get());
        crate::test_complete!("run_twice_sequentially");
    }
}
