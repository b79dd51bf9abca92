//! Best-effort datagram transport.
//!
//! Same queue discipline as the stream transport, with datagram
//! boundaries preserved: each write-job is exactly one datagram on the
//! wire, each read-waiter resolves with exactly one received datagram.

use super::{ReadCallback, Transport, WriteCallback};
use crate::error::{Error, ErrorKind};
use crate::sched::{Interest, Scheduler, WatchToken};
use socket2::{Domain, Protocol, Socket, Type};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::time::Duration;

/// Largest datagram accepted from the wire (fits a jumbo UDP payload).
const RECV_BUFFER: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Closing,
    Closed,
}

struct WriteJob {
    buf: Vec<u8>,
    done: WriteCallback,
}

struct DatagramInner {
    sched: Scheduler,
    sock: Option<Socket>,
    state: State,
    read_queue: VecDeque<ReadCallback>,
    write_queue: VecDeque<WriteJob>,
    read_watch: Option<WatchToken>,
    write_watch: Option<WatchToken>,
    timeout: Option<Duration>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

/// One connected datagram conversation.
#[derive(Clone)]
pub struct DatagramTransport {
    inner: Rc<RefCell<DatagramInner>>,
}

fn closed_error() -> Error {
    Error::new(ErrorKind::Shutdown, "transport closed")
}

impl DatagramTransport {
    /// Creates a datagram conversation with the given peer.
    ///
    /// The socket is connected, so only datagrams from `peer` are
    /// delivered. Connecting a datagram socket never blocks.
    pub fn connect(sched: &Scheduler, peer: SocketAddr) -> Result<Self, Error> {
        let domain = Domain::for_address(peer);
        let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| Error::from_io(&e, "socket"))?;
        sock.set_nonblocking(true)
            .map_err(|e| Error::from_io(&e, "set nonblocking"))?;
        sock.connect(&peer.into())
            .map_err(|e| Error::from_io(&e, "connect"))?;
        let local_addr = sock.local_addr().ok().and_then(|a| a.as_socket());
        Ok(Self {
            inner: Rc::new(RefCell::new(DatagramInner {
                sched: sched.clone(),
                sock: Some(sock),
                state: State::Open,
                read_queue: VecDeque::new(),
                write_queue: VecDeque::new(),
                read_watch: None,
                write_watch: None,
                timeout: None,
                local_addr,
                peer_addr: Some(peer),
            })),
        })
    }

    /// Enqueues a read-waiter for the next datagram.
    pub fn read(&self, callback: impl FnOnce(Result<Vec<u8>, Error>) + 'static) {
        let mut inner = self.inner.borrow_mut();
        if matches!(inner.state, State::Closing | State::Closed) {
            let sched = inner.sched.clone();
            drop(inner);
            sched.submit_now(move || callback(Err(closed_error())));
            return;
        }
        inner.read_queue.push_back(Box::new(callback));
        drop(inner);
        Self::arm_read(&self.inner);
    }

    /// Enqueues a write-job carrying exactly one datagram.
    pub fn write(&self, data: Vec<u8>, callback: impl FnOnce(Result<(), Error>) + 'static) {
        let mut inner = self.inner.borrow_mut();
        if matches!(inner.state, State::Closing | State::Closed) {
            let sched = inner.sched.clone();
            drop(inner);
            sched.submit_now(move || callback(Err(closed_error())));
            return;
        }
        inner.write_queue.push_back(WriteJob {
            buf: data,
            done: Box::new(callback),
        });
        let sole = inner.write_queue.len() == 1;
        drop(inner);
        if sole {
            Self::flush(&self.inner);
        }
    }

    /// Sets the inactivity timeout for subsequent I/O windows.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.inner.borrow_mut().timeout = timeout;
    }

    /// The local address.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.borrow().local_addr
    }

    /// The peer address.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.borrow().peer_addr
    }

    /// Closes the conversation. Idempotent; see the module notes.
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        if matches!(inner.state, State::Closing | State::Closed) {
            return;
        }
        inner.state = State::Closing;
        if let Some(token) = inner.read_watch.take() {
            inner.sched.unwatch(token);
        }
        if let Some(token) = inner.write_watch.take() {
            inner.sched.unwatch(token);
        }
        let readers = std::mem::take(&mut inner.read_queue);
        let writers = std::mem::take(&mut inner.write_queue);
        let sched = inner.sched.clone();
        drop(inner);

        let rc = Rc::clone(&self.inner);
        sched.submit_now(move || {
            for waiter in readers {
                waiter(Err(closed_error()));
            }
            for job in writers {
                (job.done)(Err(closed_error()));
            }
            let mut inner = rc.borrow_mut();
            inner.state = State::Closed;
            inner.sock = None;
        });
    }

    fn arm_read(rc: &Rc<RefCell<DatagramInner>>) {
        let mut inner = rc.borrow_mut();
        if inner.state != State::Open
            || inner.read_watch.is_some()
            || inner.read_queue.is_empty()
        {
            return;
        }
        let fd = inner.sock.as_ref().expect("socket present while open").as_raw_fd();
        let sched = inner.sched.clone();
        let timeout = inner.timeout;
        let rc2 = Rc::clone(rc);
        match sched.watch(fd, Interest::READABLE, timeout, move |result| {
            Self::on_readable(&rc2, result);
        }) {
            Ok(token) => inner.read_watch = Some(token),
            Err(err) => {
                let waiter = inner
                    .read_queue
                    .pop_front()
                    .expect("read queue non-empty while arming");
                let sched = inner.sched.clone();
                drop(inner);
                sched.submit_now(move || waiter(Err(err)));
            }
        }
    }

    fn on_readable(
        rc: &Rc<RefCell<DatagramInner>>,
        result: Result<crate::sched::Readiness, Error>,
    ) {
        let delivery = {
            let mut inner = rc.borrow_mut();
            inner.read_watch = None;
            if matches!(inner.state, State::Closing | State::Closed) {
                return;
            }
            let me = &mut *inner;
            let waiter = me
                .read_queue
                .pop_front()
                .expect("readiness fired against empty read queue");
            match result {
                Err(err) => Some((waiter, Err(err))),
                Ok(_) => {
                    // One recv = one datagram; an oversize datagram is
                    // truncated by the OS, never split across waiters.
                    let mut buf = vec![0u8; RECV_BUFFER];
                    let mut sock = me.sock.as_ref().expect("socket present while open");
                    match sock.read(&mut buf) {
                        Ok(n) => {
                            buf.truncate(n);
                            Some((waiter, Ok(buf)))
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                            me.read_queue.push_front(waiter);
                            None
                        }
                        Err(err) => Some((waiter, Err(Error::from_io(&err, "recv")))),
                    }
                }
            }
        };
        if let Some((waiter, outcome)) = delivery {
            waiter(outcome);
        }
        Self::arm_read(rc);
    }

    fn flush(rc: &Rc<RefCell<DatagramInner>>) {
        let mut completions: Vec<(WriteCallback, Result<(), Error>)> = Vec::new();
        {
            let mut inner = rc.borrow_mut();
            if inner.state != State::Open {
                return;
            }
            let me = &mut *inner;
            while let Some(job) = me.write_queue.front() {
                let mut sock = me.sock.as_ref().expect("socket present while open");
                // Exactly one datagram per job: a short send would tear a
                // datagram apart, so it is treated as an OS-level error.
                match sock.write(&job.buf) {
                    Ok(n) if n == job.buf.len() => {
                        let job = me.write_queue.pop_front().expect("front job present");
                        completions.push((job.done, Ok(())));
                    }
                    Ok(_) => {
                        let job = me.write_queue.pop_front().expect("front job present");
                        completions.push((
                            job.done,
                            Err(Error::new(ErrorKind::Generic, "short datagram send")),
                        ));
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        let job = me.write_queue.pop_front().expect("front job present");
                        completions.push((job.done, Err(Error::from_io(&err, "send"))));
                    }
                }
            }
        }
        // Deferred-callback discipline: a write() call never re-enters
        // its caller.
        if !completions.is_empty() {
            let sched = rc.borrow().sched.clone();
            sched.submit_now(move || {
                for (done, outcome) in completions {
                    done(outcome);
                }
            });
        }
        Self::arm_write(rc);
    }

    fn arm_write(rc: &Rc<RefCell<DatagramInner>>) {
        let mut inner = rc.borrow_mut();
        if inner.state != State::Open
            || inner.write_watch.is_some()
            || inner.write_queue.is_empty()
        {
            return;
        }
        let fd = inner.sock.as_ref().expect("socket present while open").as_raw_fd();
        let sched = inner.sched.clone();
        let timeout = inner.timeout;
        let rc2 = Rc::clone(rc);
        match sched.watch(fd, Interest::WRITABLE, timeout, move |result| {
            Self::on_writable(&rc2, result);
        }) {
            Ok(token) => inner.write_watch = Some(token),
            Err(err) => {
                let job = inner
                    .write_queue
                    .pop_front()
                    .expect("write queue non-empty while arming");
                let sched = inner.sched.clone();
                drop(inner);
                sched.submit_now(move || (job.done)(Err(err)));
            }
        }
    }

    fn on_writable(
        rc: &Rc<RefCell<DatagramInner>>,
        result: Result<crate::sched::Readiness, Error>,
    ) {
        let timed_out = {
            let mut inner = rc.borrow_mut();
            inner.write_watch = None;
            if matches!(inner.state, State::Closing | State::Closed) {
                return;
            }
            match result {
                Err(err) => {
                    let job = inner
                        .write_queue
                        .pop_front()
                        .expect("write timeout fired against empty write queue");
                    drop(inner);
                    (job.done)(Err(err));
                    true
                }
                Ok(_) => false,
            }
        };
        if timed_out {
            Self::arm_write(rc);
        } else {
            Self::flush(rc);
        }
    }
}

impl Drop for DatagramTransport {
    fn drop(&mut self) {
        if Rc::strong_count(&self.inner) == 1 {
            let state = self.inner.borrow().state;
            if state == State::Open {
                self.close();
            }
        }
    }
}

impl Transport for DatagramTransport {
    fn read(&self, callback: ReadCallback) {
        DatagramTransport::read(self, callback);
    }

    fn write(&self, data: Vec<u8>, callback: WriteCallback) {
        DatagramTransport::write(self, data, callback);
    }

    fn set_timeout(&self, timeout: Option<Duration>) {
        DatagramTransport::set_timeout(self, timeout);
    }

    fn close(&self) {
        DatagramTransport::close(self);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        DatagramTransport::local_addr(self)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        DatagramTransport::peer_addr(self)
    }
}

impl std::fmt::Debug for DatagramTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("DatagramTransport")
            .field("state", &inner.state)
            .field("read_queue", &inner.read_queue.len())
            .field("write_queue", &inner.write_queue.len())
            .field("peer", &inner.peer_addr)
            .finish_non_exhaustive()
    }
}
