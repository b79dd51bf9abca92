//! Connected byte-stream transport.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting ──► Connected ──► Closing ──► Closed
//!      │              │                      ▲
//!      └──────────────┴──────────────────────┘  (error short-circuit)
//! ```
//!
//! `Closed` is terminal. Every queued waiter resolves with a Shutdown
//! error before the socket is released.
//!
//! # Lifetime discipline
//!
//! The caller-facing [`StreamTransport`] is a cheap handle over the
//! shared state. Whenever I/O is outstanding, the readiness callback
//! registered with the scheduler holds its own strong reference to that
//! state, so the state cannot be destroyed while one of its callbacks is
//! on the call stack. Teardown queues a deferred release task and runs a
//! pending-completions counter down to zero before the socket goes away.

use super::connect::{ConnectSettings, Family};
use super::socks5;
use super::{ConnectCallback, ReadCallback, Transport, WriteCallback};
use crate::dns::{self, QueryKind, Records};
use crate::error::{Error, ErrorKind};
use crate::sched::{Interest, Scheduler, WatchToken};
use socket2::{Domain, Protocol, Socket, Type};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::time::Duration;

/// Upper bound on a single delivered chunk.
const READ_CHUNK: usize = 8192;

/// Transport lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connecting,
    Connected,
    Closing,
    Closed,
}

struct WriteJob {
    buf: Vec<u8>,
    off: usize,
    done: WriteCallback,
}

pub(crate) struct StreamInner {
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
    /// Bytes handed back by a protocol stage (SOCKS5 handshake) that
    /// belong to the next reader.
    pushback: Vec<u8>,
    /// Completions detached from the queues but not yet delivered.
    /// Teardown finishes only once this returns to zero.
    pending_completions: usize,
}

/// One connected byte stream.
///
/// Handles are cheap clones over shared state; dropping the last handle
/// closes the stream if the caller has not done so already.
#[derive(Clone)]
pub struct StreamTransport {
    inner: Rc<RefCell<StreamInner>>,
}

fn closed_error() -> Error {
    Error::new(ErrorKind::Shutdown, "transport closed")
}

impl StreamTransport {
    /// Starts an asynchronous connect attempt.
    ///
    /// On success the callback receives a connected transport. On failure
    /// it receives a connection-class error; no handle needing an
    /// explicit close escapes.
    ///
    /// A hostname address is resolved first (family-aware) and every
    /// resulting candidate is attempted in order. With
    /// `settings.socks5_proxy` set, the stream connects to the proxy and
    /// completes the SOCKS5 handshake before reporting connected.
    pub fn connect(
        sched: &Scheduler,
        settings: ConnectSettings,
        callback: impl FnOnce(Result<StreamTransport, Error>) + 'static,
    ) {
        let callback: ConnectCallback = Box::new(callback);
        let sched = sched.clone();

        // With a proxy, the TCP-level destination is the proxy itself and
        // the requested endpoint travels inside the handshake.
        let (dial_host, dial_port) = match settings.proxy_endpoint() {
            Some(Ok((host, port))) => (host, port),
            Some(Err(err)) => {
                sched.submit_now(move || callback(Err(err)));
                return;
            }
            None => (settings.address.clone(), settings.port),
        };

        if let Ok(ip) = dial_host.parse::<IpAddr>() {
            if !settings.family.accepts(ip) {
                sched.submit_now(move || {
                    callback(Err(Error::new(
                        ErrorKind::InvalidInput,
                        "address family mismatch",
                    )));
                });
                return;
            }
            let job = ConnectJob::new(settings, vec![SocketAddr::new(ip, dial_port)], callback);
            Self::connect_next(&sched, job);
            return;
        }

        Self::resolve_then_connect(&sched, settings, dial_host, dial_port, callback);
    }

    /// Resolves `host` per the requested family, then walks candidates.
    fn resolve_then_connect(
        sched: &Scheduler,
        settings: ConnectSettings,
        host: String,
        port: u16,
        callback: ConnectCallback,
    ) {
        let kinds: &[QueryKind] = match settings.family {
            Family::V4 => &[QueryKind::A],
            Family::V6 => &[QueryKind::Aaaa],
            Family::Unspec => &[QueryKind::A, QueryKind::Aaaa],
        };
        let resolver = Rc::new(dns::Resolver::new(sched, dns::ResolveSettings::default()));
        let pending = Rc::new(RefCell::new(ResolveJoin {
            remaining: kinds.len(),
            v4: Vec::new(),
            v6: Vec::new(),
            callback: Some(callback),
        }));

        for kind in kinds {
            let kind = *kind;
            let sched = sched.clone();
            let settings = settings.clone();
            let pending = Rc::clone(&pending);
            let resolver_keepalive = Rc::clone(&resolver);
            let pending_cb = Rc::clone(&pending);
            let sched_cb = sched.clone();
            let outcome = resolver.resolve(kind, &host, move |result| {
                let _keepalive = &resolver_keepalive;
                let mut join = pending_cb.borrow_mut();
                join.remaining -= 1;
                if let Ok(response) = result {
                    if let Records::Addrs(addrs) = response.records {
                        for ip in addrs {
                            let addr = SocketAddr::new(ip, port);
                            if ip.is_ipv4() {
                                join.v4.push(addr);
                            } else {
                                join.v6.push(addr);
                            }
                        }
                    }
                }
                if join.remaining == 0 {
                    // IPv4 candidates first, then IPv6.
                    let mut candidates = std::mem::take(&mut join.v4);
                    candidates.append(&mut join.v6);
                    let callback = join.callback.take().expect("connect callback consumed once");
                    drop(join);
                    if candidates.is_empty() {
                        callback(Err(Error::new(
                            ErrorKind::ConnectionFailed,
                            "hostname resolution produced no addresses",
                        )));
                    } else {
                        let job = ConnectJob::new(settings, candidates, callback);
                        StreamTransport::connect_next(&sched_cb, job);
                    }
                }
            });
            if let Err(err) = outcome {
                let mut join = pending.borrow_mut();
                join.remaining -= 1;
                if join.remaining == 0 && join.v4.is_empty() && join.v6.is_empty() {
                    if let Some(callback) = join.callback.take() {
                        drop(join);
                        let sched = sched.clone();
                        sched.submit_now(move || callback(Err(err)));
                    }
                }
            }
        }
    }

    /// Attempts the next connect candidate, falling through the list on
    /// failure.
    fn connect_next(sched: &Scheduler, job: Rc<RefCell<ConnectJob>>) {
        let addr = {
            let mut state = job.borrow_mut();
            if state.candidates.is_empty() {
                let err = state
                    .last_error
                    .take()
                    .unwrap_or_else(|| Error::new(ErrorKind::ConnectionFailed, "connect"));
                let callback = state.callback.take().expect("connect resolves once");
                drop(state);
                let sched = sched.clone();
                sched.submit_now(move || callback(Err(err)));
                return;
            }
            state.candidates.remove(0)
        };
        tracing::debug!(%addr, "attempting connect");

        let sock = match Self::new_socket(addr) {
            Ok(sock) => sock,
            Err(err) => {
                job.borrow_mut().last_error = Some(err);
                Self::connect_next(sched, job);
                return;
            }
        };

        match sock.connect(&addr.into()) {
            Ok(()) => {
                let stream = {
                    let state = job.borrow();
                    Self::from_parts(sched.clone(), sock, State::Connected, &state.settings)
                };
                Self::finish_connect(stream, &job);
            }
            Err(err) if in_progress(&err) => {
                let (timeout, stream) = {
                    let state = job.borrow();
                    let stream =
                        Self::from_parts(sched.clone(), sock, State::Connecting, &state.settings);
                    (state.settings.timeout, stream)
                };
                let rc = Rc::clone(&stream.inner);
                let fd = rc
                    .borrow()
                    .sock
                    .as_ref()
                    .expect("socket present while connecting")
                    .as_raw_fd();
                let sched2 = sched.clone();
                let job2 = Rc::clone(&job);
                let watched = sched.watch(fd, Interest::WRITABLE, timeout, move |result| {
                    let outcome = match result {
                        Ok(_) => rc.borrow().take_connect_error(),
                        Err(err) => Some(err),
                    };
                    match outcome {
                        None => {
                            rc.borrow_mut().state = State::Connected;
                            let stream = StreamTransport { inner: rc };
                            StreamTransport::finish_connect(stream, &job2);
                        }
                        Some(err) => {
                            StreamTransport::abandon(&rc);
                            job2.borrow_mut().last_error = Some(err);
                            StreamTransport::connect_next(&sched2, job2);
                        }
                    }
                });
                if let Err(err) = watched {
                    Self::abandon(&stream.inner);
                    job.borrow_mut().last_error = Some(err);
                    Self::connect_next(sched, job);
                }
            }
            Err(err) => {
                job.borrow_mut().last_error = Some(Error::from_io(&err, "connect"));
                Self::connect_next(sched, job);
            }
        }
    }

    fn finish_connect(stream: StreamTransport, job: &Rc<RefCell<ConnectJob>>) {
        Self::refresh_addrs(&stream.inner);
        let (settings, callback) = {
            let mut state = job.borrow_mut();
            let callback = state.callback.take().expect("connect resolves once");
            (state.settings.clone(), callback)
        };
        if settings.socks5_proxy.is_some() {
            socks5::handshake(stream, &settings, callback);
        } else {
            let sched = stream.inner.borrow().sched.clone();
            sched.submit_now(move || callback(Ok(stream)));
        }
    }

    fn new_socket(addr: SocketAddr) -> Result<Socket, Error> {
        let domain = Domain::for_address(addr);
        let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| Error::from_io(&e, "socket"))?;
        sock.set_nonblocking(true)
            .map_err(|e| Error::from_io(&e, "set nonblocking"))?;
        Ok(sock)
    }

    fn from_parts(
        sched: Scheduler,
        sock: Socket,
        state: State,
        settings: &ConnectSettings,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(StreamInner {
                sched,
                sock: Some(sock),
                state,
                read_queue: VecDeque::new(),
                write_queue: VecDeque::new(),
                read_watch: None,
                write_watch: None,
                timeout: settings.timeout,
                local_addr: None,
                peer_addr: None,
                pushback: Vec::new(),
                pending_completions: 0,
            })),
        }
    }

    /// Adopts an already-connected socket (listener side, tests).
    pub fn from_socket(sched: &Scheduler, sock: std::net::TcpStream) -> Result<Self, Error> {
        sock.set_nonblocking(true)
            .map_err(|e| Error::from_io(&e, "set nonblocking"))?;
        let stream = Self {
            inner: Rc::new(RefCell::new(StreamInner {
                sched: sched.clone(),
                sock: Some(Socket::from(sock)),
                state: State::Connected,
                read_queue: VecDeque::new(),
                write_queue: VecDeque::new(),
                read_watch: None,
                write_watch: None,
                timeout: None,
                local_addr: None,
                peer_addr: None,
                pushback: Vec::new(),
                pending_completions: 0,
            })),
        };
        Self::refresh_addrs(&stream.inner);
        Ok(stream)
    }

    fn refresh_addrs(rc: &Rc<RefCell<StreamInner>>) {
        let mut inner = rc.borrow_mut();
        if let Some(sock) = inner.sock.as_ref() {
            let local = sock.local_addr().ok().and_then(|a| a.as_socket());
            let peer = sock.peer_addr().ok().and_then(|a| a.as_socket());
            inner.local_addr = local;
            inner.peer_addr = peer;
        }
    }

    /// Tears down a half-built stream after a failed connect attempt.
    fn abandon(rc: &Rc<RefCell<StreamInner>>) {
        let mut inner = rc.borrow_mut();
        inner.state = State::Closed;
        inner.sock = None;
    }

    /// Enqueues a read-waiter for the next chunk.
    ///
    /// Waiters resolve strictly in enqueue order. Peer close delivers
    /// [`ErrorKind::EndOfStream`]; an inactivity window expiring delivers
    /// [`ErrorKind::Timeout`].
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

    /// Enqueues a write-job.
    ///
    /// The sole job starts writing immediately; completions fire in
    /// enqueue order.
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
            off: 0,
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

    /// Clears the inactivity timeout.
    pub fn clear_timeout(&self) {
        self.set_timeout(None);
    }

    /// The local address, once known.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.borrow().local_addr
    }

    /// The peer address, once known.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.borrow().peer_addr
    }

    /// Closes the transport.
    ///
    /// Idempotent. Queued waiters resolve with a Shutdown error on the
    /// next tick; the socket is released by a deferred task, never inside
    /// this call's stack frame.
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
        inner.pending_completions = readers.len() + writers.len();
        let sched = inner.sched.clone();
        drop(inner);

        // Deferred release: this task owns the last internal strong
        // reference; state teardown happens here, on a later tick.
        let rc = Rc::clone(&self.inner);
        sched.submit_now(move || {
            for waiter in readers {
                rc.borrow_mut().pending_completions -= 1;
                waiter(Err(closed_error()));
            }
            for job in writers {
                rc.borrow_mut().pending_completions -= 1;
                (job.done)(Err(closed_error()));
            }
            let mut inner = rc.borrow_mut();
            debug_assert_eq!(inner.pending_completions, 0);
            inner.state = State::Closed;
            inner.sock = None;
        });
    }

    /// Hands bytes back to the transport; the next reader receives them
    /// before anything new from the wire.
    pub(crate) fn unread(&self, data: Vec<u8>) {
        if !data.is_empty() {
            let mut inner = self.inner.borrow_mut();
            inner.pushback.splice(0..0, data);
            drop(inner);
            Self::arm_read(&self.inner);
        }
    }

    fn arm_read(rc: &Rc<RefCell<StreamInner>>) {
        let mut inner = rc.borrow_mut();
        if inner.state != State::Connected
            || inner.read_watch.is_some()
            || inner.read_queue.is_empty()
        {
            return;
        }
        if !inner.pushback.is_empty() {
            let data = std::mem::take(&mut inner.pushback);
            let waiter = inner
                .read_queue
                .pop_front()
                .expect("read queue non-empty while arming");
            let sched = inner.sched.clone();
            drop(inner);
            // Deliver on the next tick, like a chunk off the wire.
            let rc2 = Rc::clone(rc);
            sched.submit_now(move || {
                let closed = matches!(rc2.borrow().state, State::Closing | State::Closed);
                if closed {
                    waiter(Err(closed_error()));
                } else {
                    waiter(Ok(data));
                    StreamTransport::arm_read(&rc2);
                }
            });
            return;
        }
        let fd = inner
            .sock
            .as_ref()
            .expect("socket present while connected")
            .as_raw_fd();
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

    fn on_readable(rc: &Rc<RefCell<StreamInner>>, result: Result<crate::sched::Readiness, Error>) {
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
                    let mut buf = vec![0u8; READ_CHUNK];
                    let mut sock = me.sock.as_ref().expect("socket present while connected");
                    match sock.read(&mut buf) {
                        Ok(0) => Some((waiter, Err(Error::new(ErrorKind::EndOfStream, "read")))),
                        Ok(n) => {
                            buf.truncate(n);
                            Some((waiter, Ok(buf)))
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                            // Spurious wakeup: requeue and re-arm.
                            me.read_queue.push_front(waiter);
                            None
                        }
                        Err(err) => Some((waiter, Err(Error::from_io(&err, "read")))),
                    }
                }
            }
        };
        if let Some((waiter, outcome)) = delivery {
            waiter(outcome);
        }
        Self::arm_read(rc);
    }

    fn flush(rc: &Rc<RefCell<StreamInner>>) {
        // Completions are delivered on the next tick (deferred-callback
        // discipline), so a write() call never re-enters its caller.
        let mut completions: Vec<(WriteCallback, Result<(), Error>)> = Vec::new();
        {
            let mut inner = rc.borrow_mut();
            if inner.state != State::Connected {
                return;
            }
            let me = &mut *inner;
            loop {
                let Some(job) = me.write_queue.front_mut() else {
                    break;
                };
                if job.off >= job.buf.len() {
                    let job = me.write_queue.pop_front().expect("front job present");
                    completions.push((job.done, Ok(())));
                    continue;
                }
                let mut sock = me.sock.as_ref().expect("socket present while connected");
                let chunk_result = sock.write(&job.buf[job.off..]);
                match chunk_result {
                    Ok(n) => {
                        job.off += n;
                        if job.off >= job.buf.len() {
                            let job = me.write_queue.pop_front().expect("front job present");
                            completions.push((job.done, Ok(())));
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        let job = me.write_queue.pop_front().expect("front job present");
                        completions.push((job.done, Err(Error::from_io(&err, "write"))));
                    }
                }
            }
        }
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

    fn arm_write(rc: &Rc<RefCell<StreamInner>>) {
        let mut inner = rc.borrow_mut();
        if inner.state != State::Connected
            || inner.write_watch.is_some()
            || inner.write_queue.is_empty()
        {
            return;
        }
        let fd = inner
            .sock
            .as_ref()
            .expect("socket present while connected")
            .as_raw_fd();
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

    fn on_writable(rc: &Rc<RefCell<StreamInner>>, result: Result<crate::sched::Readiness, Error>) {
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

    /// SO_ERROR check after a connect-writability event.
    fn connect_error_of(sock: &Socket) -> Option<Error> {
        match sock.take_error() {
            Ok(None) => None,
            Ok(Some(err)) => Some(Error::from_io(&err, "connect")),
            Err(err) => Some(Error::from_io(&err, "connect")),
        }
    }
}

impl StreamInner {
    fn take_connect_error(&self) -> Option<Error> {
        self.sock
            .as_ref()
            .and_then(StreamTransport::connect_error_of)
    }
}

struct ResolveJoin {
    remaining: usize,
    v4: Vec<SocketAddr>,
    v6: Vec<SocketAddr>,
    callback: Option<ConnectCallback>,
}

/// Shared state of one connect attempt walking its candidate list.
struct ConnectJob {
    settings: ConnectSettings,
    candidates: Vec<SocketAddr>,
    last_error: Option<Error>,
    callback: Option<ConnectCallback>,
}

impl ConnectJob {
    fn new(
        settings: ConnectSettings,
        candidates: Vec<SocketAddr>,
        callback: ConnectCallback,
    ) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            settings,
            candidates,
            last_error: None,
            callback: Some(callback),
        }))
    }
}

fn in_progress(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == Some(libc::EINPROGRESS)
}

impl Transport for StreamTransport {
    fn read(&self, callback: ReadCallback) {
        StreamTransport::read(self, callback);
    }

    fn write(&self, data: Vec<u8>, callback: WriteCallback) {
        StreamTransport::write(self, data, callback);
    }

    fn set_timeout(&self, timeout: Option<Duration>) {
        StreamTransport::set_timeout(self, timeout);
    }

    fn close(&self) {
        StreamTransport::close(self);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        StreamTransport::local_addr(self)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        StreamTransport::peer_addr(self)
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        // Last handle anywhere (caller or pending callback): close now so
        // queued waiters resolve and the socket is released on a later
        // tick.
        if Rc::strong_count(&self.inner) == 1 {
            let state = self.inner.borrow().state;
            if !matches!(state, State::Closing | State::Closed) {
                self.close();
            }
        }
    }
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("StreamTransport")
            .field("state", &inner.state)
            .field("read_queue", &inner.read_queue.len())
            .field("write_queue", &inner.write_queue.len())
            .field("peer", &inner.peer_addr)
            .finish_non_exhaustive()
    }
}
