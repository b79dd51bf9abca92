//! OS readiness poller wrapper.
//!
//! The reactor owns the platform poller (epoll on Linux via the `polling`
//! crate) plus per-descriptor bookkeeping: which watch occupies each
//! direction of each registered descriptor. The scheduler's loop asks it
//! to poll and receives the watch keys that fired.
//!
//! # Registration model
//!
//! The poller is one-shot: a delivered event disarms the descriptor until
//! it is re-armed. That matches the watch contract exactly (a watch
//! fires once and auto-retires), so after dispatching an event the
//! reactor re-arms only the directions that still have a live watch, and
//! deletes the registration once none remain.
//!
//! At most one watch may occupy each direction of a descriptor; a second
//! registration for a busy direction fails with `AlreadyExists`.

use super::interest::{Interest, Readiness};
use super::slab::Slot;
use parking_lot::Mutex;
use polling::{Event as PollEvent, Events as PollEvents, Poller};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

/// A watch that became ready during a poll.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Fired {
    pub(crate) watch: Slot,
    pub(crate) ready: Readiness,
}

/// Per-descriptor registration state.
#[derive(Debug, Default)]
struct FdEntry {
    read: Option<Slot>,
    write: Option<Slot>,
}

impl FdEntry {
    fn interest(&self) -> Interest {
        let mut interest = Interest::NONE;
        if self.read.is_some() {
            interest = interest.add(Interest::READABLE);
        }
        if self.write.is_some() {
            interest = interest.add(Interest::WRITABLE);
        }
        interest
    }

    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

fn poll_event(fd: RawFd, interest: Interest) -> PollEvent {
    let key = fd as usize;
    match (interest.is_readable(), interest.is_writable()) {
        (true, true) => PollEvent::all(key),
        (true, false) => PollEvent::readable(key),
        (false, true) => PollEvent::writable(key),
        (false, false) => PollEvent::none(key),
    }
}

/// Readiness poller plus per-descriptor watch bookkeeping.
pub(crate) struct Reactor {
    poller: Arc<Poller>,
    table: RefCell<HashMap<RawFd, FdEntry>>,
    /// Reusable poll buffer; lives outside `table` so dispatch may touch
    /// the table while iterating events.
    events: Mutex<PollEvents>,
}

impl Reactor {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Arc::new(Poller::new()?),
            table: RefCell::new(HashMap::new()),
            events: Mutex::new(PollEvents::new()),
        })
    }

    /// Shared handle used by foreign threads to interrupt a blocking poll.
    pub(crate) fn wake_handle(&self) -> Arc<Poller> {
        Arc::clone(&self.poller)
    }

    /// Registers `watch` on the directions named by `interest`.
    pub(crate) fn register(
        &self,
        fd: RawFd,
        interest: Interest,
        watch: Slot,
    ) -> io::Result<()> {
        let mut table = self.table.borrow_mut();
        let entry = table.entry(fd).or_default();

        if interest.is_readable() && entry.read.is_some()
            || interest.is_writable() && entry.write.is_some()
        {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "direction already watched",
            ));
        }

        let was_empty = entry.is_empty();
        if interest.is_readable() {
            entry.read = Some(watch);
        }
        if interest.is_writable() {
            entry.write = Some(watch);
        }
        let combined = poll_event(fd, entry.interest());

        let result = if was_empty {
            // SAFETY: the descriptor belongs to a transport or caller that
            // outlives the registration; every teardown path deregisters
            // before the descriptor is closed.
            unsafe { self.poller.add(fd, combined) }
        } else {
            // SAFETY: fd is live for the duration of the call; the table
            // entry proves it is currently registered with the poller.
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            self.poller.modify(borrowed, combined)
        };

        if let Err(err) = result {
            // Roll back the bookkeeping so the caller sees no change.
            if interest.is_readable() {
                entry.read = None;
            }
            if interest.is_writable() {
                entry.write = None;
            }
            if entry.is_empty() {
                table.remove(&fd);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Drops the registration of `watch` from the directions named by
    /// `interest`. Quietly ignores directions owned by another watch.
    pub(crate) fn deregister(&self, fd: RawFd, interest: Interest, watch: Slot) {
        let mut table = self.table.borrow_mut();
        let Some(entry) = table.get_mut(&fd) else {
            return;
        };
        if interest.is_readable() && entry.read == Some(watch) {
            entry.read = None;
        }
        if interest.is_writable() && entry.write == Some(watch) {
            entry.write = None;
        }
        // SAFETY: fd is still open here; transports close their socket
        // only after deregistering it.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if entry.is_empty() {
            table.remove(&fd);
            if let Err(err) = self.poller.delete(borrowed) {
                tracing::debug!(fd, error = %err, "poller delete failed");
            }
        } else if let Err(err) = self.poller.modify(borrowed, poll_event(fd, entry.interest())) {
            tracing::debug!(fd, error = %err, "poller modify failed");
        }
    }

    /// Polls for readiness, appending fired watches to `fired`.
    ///
    /// Fired watches are removed from the table; directions that still
    /// hold a watch afterwards are re-armed.
    pub(crate) fn poll(
        &self,
        timeout: Option<Duration>,
        fired: &mut Vec<Fired>,
    ) -> io::Result<()> {
        let mut events = self.events.lock();
        events.clear();
        self.poller.wait(&mut events, timeout)?;

        let mut table = self.table.borrow_mut();
        for event in events.iter() {
            let fd = event.key as RawFd;
            let Some(entry) = table.get_mut(&fd) else {
                // Stale event for a descriptor deregistered this tick.
                continue;
            };
            // Error/hangup conditions surface with neither flag set on
            // some platforms; deliver them to every live direction so the
            // consumer's own syscall observes the failure.
            let bare = !event.readable && !event.writable;
            let readable = event.readable || bare;
            let writable = event.writable || bare;

            if readable {
                if let Some(watch) = entry.read.take() {
                    fired.push(Fired {
                        watch,
                        ready: Readiness {
                            readable: true,
                            writable: false,
                        },
                    });
                }
            }
            if writable {
                if let Some(watch) = entry.write.take() {
                    fired.push(Fired {
                        watch,
                        ready: Readiness {
                            readable: false,
                            writable: true,
                        },
                    });
                }
            }

            // SAFETY: the descriptor is registered, hence still open.
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            if entry.is_empty() {
                table.remove(&fd);
                if let Err(err) = self.poller.delete(borrowed) {
                    tracing::debug!(fd, error = %err, "poller delete failed");
                }
            } else if let Err(err) =
                self.poller.modify(borrowed, poll_event(fd, entry.interest()))
            {
                tracing::debug!(fd, error = %err, "poller re-arm failed");
            }
        }
        Ok(())
    }

    /// Returns the number of descriptors with at least one live watch.
    pub(crate) fn registered_fds(&self) -> usize {
        self.table.borrow().len()
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("registered_fds", &self.registered_fds())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn slot(n: usize) -> Slot {
        Slot::from_usize(n)
    }

    #[test]
    fn register_both_directions_and_deregister() {
        let reactor = Reactor::new().expect("create reactor");
        let (sock, _peer) = UnixStream::pair().expect("socketpair");
        let fd = sock.as_raw_fd();

        reactor
            .register(fd, Interest::READABLE, slot(1))
            .expect("register read");
        reactor
            .register(fd, Interest::WRITABLE, slot(2))
            .expect("register write");
        assert_eq!(reactor.registered_fds(), 1);

        reactor.deregister(fd, Interest::READABLE, slot(1));
        assert_eq!(reactor.registered_fds(), 1);
        reactor.deregister(fd, Interest::WRITABLE, slot(2));
        assert_eq!(reactor.registered_fds(), 0);
    }

    #[test]
    fn busy_direction_rejected() {
        let reactor = Reactor::new().expect("create reactor");
        let (sock, _peer) = UnixStream::pair().expect("socketpair");
        let fd = sock.as_raw_fd();

        reactor
            .register(fd, Interest::READABLE, slot(1))
            .expect("register read");
        let err = reactor
            .register(fd, Interest::READABLE, slot(2))
            .expect_err("second read watch must fail");
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);

        reactor.deregister(fd, Interest::READABLE, slot(1));
    }

    #[test]
    fn readable_event_fires_watch_once() {
        let reactor = Reactor::new().expect("create reactor");
        let (sock, peer) = UnixStream::pair().expect("socketpair");
        sock.set_nonblocking(true).expect("nonblocking");
        let fd = sock.as_raw_fd();

        reactor
            .register(fd, Interest::READABLE, slot(7))
            .expect("register read");

        use std::io::Write;
        (&peer).write_all(b"x").expect("write side");

        let mut fired = Vec::new();
        reactor
            .poll(Some(Duration::from_millis(500)), &mut fired)
            .expect("poll");
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].watch, slot(7));
        assert!(fired[0].ready.readable);
        // One-shot: the registration retired with the event.
        assert_eq!(reactor.registered_fds(), 0);
    }

    #[test]
    fn wake_interrupts_poll() {
        let reactor = Reactor::new().expect("create reactor");
        let waker = reactor.wake_handle();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            waker.notify().expect("notify");
        });

        let start = std::time::Instant::now();
        let mut fired = Vec::new();
        reactor
            .poll(Some(Duration::from_secs(5)), &mut fired)
            .expect("poll");
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(fired.is_empty());
        handle.join().expect("join waker thread");
    }

    #[test]
    fn poll_timeout_returns_empty() {
        let reactor = Reactor::new().expect("create reactor");
        let start = std::time::Instant::now();
        let mut fired = Vec::new();
        reactor
            .poll(Some(Duration::from_millis(50)), &mut fired)
            .expect("poll");
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40));
        assert!(fired.is_empty());
    }
}
