//! The lookup engine.
//!
//! One engine instance serves one resolver: it owns the datagram
//! conversation with the configured nameserver, the outstanding-query
//! arena, and the per-attempt retransmission timers.
//!
//! # Query lifetime
//!
//! A query lives in a generation-indexed arena slot from issue until the
//! engine's final notification: a matching reply, attempt-budget
//! exhaustion, or engine shutdown. Cancellation sets the shared flag
//! (the tombstone); the notification that eventually arrives checks the
//! flag, frees the slot, and skips the caller's completion function. The
//! slot is freed exactly once and only by the engine, so no ordering of
//! cancel, reply, and teardown can reach freed state.
//!
//! # Transport lifetime
//!
//! The datagram conversation exists only while queries are pending.
//! When the last pending query completes, the engine drops the socket
//! (and its read interest), so an idle resolver leaves nothing
//! registered with the scheduler.

use super::error::{code, DnsError};
use super::wire::{self, QueryKind};
use super::{DnsResponse, Records, ResolveSettings};
use crate::error::{Error, ErrorKind};
use crate::net::DatagramTransport;
use crate::sched::slab::Arena;
use crate::sched::{DelayToken, Scheduler, Slot};
use rand::Rng;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

/// Completion function of one query.
pub(crate) type QueryCallback = Box<dyn FnOnce(Result<DnsResponse, DnsError>) + 'static>;

struct PendingQuery {
    id: u16,
    kind: QueryKind,
    /// Exact spelling sent on the wire (case randomization included).
    qname_sent: String,
    wire: Vec<u8>,
    attempts_left: u32,
    started: Instant,
    cancelled: Rc<Cell<bool>>,
    timer: Option<DelayToken>,
    callback: QueryCallback,
}

pub(crate) struct Engine {
    sched: Scheduler,
    nameserver: SocketAddr,
    attempts: u32,
    per_attempt_timeout: Duration,
    randomize_case: bool,
    transport: RefCell<Option<DatagramTransport>>,
    /// Bumped whenever the transport is replaced; stale pump callbacks
    /// compare against it and bow out.
    epoch: Cell<u64>,
    pump_active: Cell<bool>,
    pending: RefCell<Arena<PendingQuery>>,
    ids: RefCell<HashMap<u16, Slot>>,
    shut: Cell<bool>,
}

impl Engine {
    /// Reads the configuration once and builds the engine.
    pub(crate) fn create(sched: &Scheduler, settings: &ResolveSettings) -> Result<Rc<Self>, Error> {
        if settings.attempts == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "zero attempts"));
        }
        if settings.timeout.is_zero() {
            return Err(Error::new(ErrorKind::InvalidInput, "zero attempt timeout"));
        }
        let nameserver = match settings.nameserver.as_deref() {
            Some(raw) => parse_nameserver(raw)?,
            None => system_nameserver(),
        };
        tracing::debug!(%nameserver, attempts = settings.attempts, "creating lookup engine");
        Ok(Rc::new(Self {
            sched: sched.clone(),
            nameserver,
            attempts: settings.attempts,
            per_attempt_timeout: settings.timeout,
            randomize_case: settings.randomize_case,
            transport: RefCell::new(None),
            epoch: Cell::new(0),
            pump_active: Cell::new(false),
            pending: RefCell::new(Arena::new()),
            ids: RefCell::new(HashMap::new()),
            shut: Cell::new(false),
        }))
    }

    /// Number of queries awaiting final disposition.
    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.borrow().len()
    }
}

/// Issues one query; `qname` is already canonical (reverse names
/// synthesized, no case randomization yet).
pub(crate) fn issue(
    engine: &Rc<Engine>,
    kind: QueryKind,
    qname: &str,
    callback: QueryCallback,
) -> Result<Rc<Cell<bool>>, Error> {
    if engine.shut.get() {
        return Err(Error::new(ErrorKind::Shutdown, "resolver torn down"));
    }
    let canonical = wire::to_fqdn(qname);
    let qname_sent = if engine.randomize_case {
        wire::randomize_case(&canonical, &mut rand::thread_rng())
    } else {
        canonical
    };
    let id = fresh_id(engine);
    let Some(message) = wire::build_query(id, &qname_sent, kind) else {
        return Err(Error::new(ErrorKind::InvalidInput, "name not encodable"));
    };

    ensure_transport(engine)?;

    let cancelled = Rc::new(Cell::new(false));
    let slot = engine.pending.borrow_mut().insert(PendingQuery {
        id,
        kind,
        qname_sent,
        wire: message.clone(),
        attempts_left: engine.attempts,
        started: Instant::now(),
        cancelled: Rc::clone(&cancelled),
        timer: None,
        callback,
    });
    engine.ids.borrow_mut().insert(id, slot);

    send_datagram(engine, slot, message);
    arm_attempt_timer(engine, slot);
    start_pump(engine);
    Ok(cancelled)
}

/// Fails every pending query with Shutdown, synchronously, then drops
/// the transport. Nothing survives to touch engine memory afterwards.
pub(crate) fn shutdown(engine: &Rc<Engine>) {
    if engine.shut.replace(true) {
        return;
    }
    tracing::debug!(
        pending = engine.pending.borrow().len(),
        "shutting down lookup engine"
    );
    let drained = engine.pending.borrow_mut().drain();
    engine.ids.borrow_mut().clear();
    if let Some(transport) = engine.transport.borrow_mut().take() {
        transport.close();
    }
    engine.epoch.set(engine.epoch.get() + 1);
    engine.pump_active.set(false);
    for (_slot, query) in drained {
        if let Some(token) = query.timer {
            engine.sched.cancel_delayed(token);
        }
        if query.cancelled.get() {
            continue;
        }
        (query.callback)(Err(DnsError::shutdown()));
    }
}

fn parse_nameserver(raw: &str) -> Result<SocketAddr, Error> {
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, 53));
    }
    raw.parse::<SocketAddr>()
        .map_err(|_| Error::new(ErrorKind::InvalidInput, "malformed nameserver"))
}

/// First `nameserver` line of the system resolver configuration.
fn system_nameserver() -> SocketAddr {
    if let Ok(text) = std::fs::read_to_string("/etc/resolv.conf") {
        if let Some(addr) = parse_resolv_conf(&text) {
            return addr;
        }
    }
    tracing::warn!("no usable nameserver found, falling back to loopback");
    SocketAddr::from(([127, 0, 0, 1], 53))
}

fn parse_resolv_conf(text: &str) -> Option<SocketAddr> {
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("nameserver") {
            if let Ok(ip) = rest.trim().parse::<IpAddr>() {
                return Some(SocketAddr::new(ip, 53));
            }
        }
    }
    None
}

/// Transaction id not colliding with any outstanding query.
fn fresh_id(engine: &Rc<Engine>) -> u16 {
    let ids = engine.ids.borrow();
    let mut rng = rand::thread_rng();
    loop {
        let id = rng.gen::<u16>();
        if !ids.contains_key(&id) {
            return id;
        }
    }
}

fn ensure_transport(engine: &Rc<Engine>) -> Result<(), Error> {
    let mut transport = engine.transport.borrow_mut();
    if transport.is_none() {
        let conversation = DatagramTransport::connect(&engine.sched, engine.nameserver)?;
        *transport = Some(conversation);
        engine.epoch.set(engine.epoch.get() + 1);
        engine.pump_active.set(false);
    }
    Ok(())
}

/// Drops the transport once no queries are pending, so an idle resolver
/// keeps nothing registered with the scheduler.
fn maybe_release_transport(engine: &Rc<Engine>) {
    if engine.shut.get() || !engine.pending.borrow().is_empty() {
        return;
    }
    if let Some(transport) = engine.transport.borrow_mut().take() {
        transport.close();
    }
    engine.epoch.set(engine.epoch.get() + 1);
    engine.pump_active.set(false);
}

fn send_datagram(engine: &Rc<Engine>, slot: Slot, message: Vec<u8>) {
    let transport = engine.transport.borrow().clone();
    let Some(transport) = transport else {
        return;
    };
    let weak = Rc::downgrade(engine);
    transport.write(message, move |result| {
        if let Err(err) = result {
            if let Some(engine) = weak.upgrade() {
                tracing::debug!(error = %err, "query transmit failed");
                complete(
                    &engine,
                    slot,
                    Err(DnsError::from_code(code::UNKNOWN, Duration::ZERO)),
                );
            }
        }
    });
}

fn arm_attempt_timer(engine: &Rc<Engine>, slot: Slot) {
    let weak: Weak<Engine> = Rc::downgrade(engine);
    let token = engine
        .sched
        .submit_after(engine.per_attempt_timeout, move || {
            if let Some(engine) = weak.upgrade() {
                on_attempt_timeout(&engine, slot);
            }
        })
        .expect("attempt timeout validated non-zero");
    if let Some(query) = engine.pending.borrow_mut().get_mut(slot) {
        query.timer = Some(token);
    } else {
        engine.sched.cancel_delayed(token);
    }
}

fn on_attempt_timeout(engine: &Rc<Engine>, slot: Slot) {
    if engine.shut.get() {
        return;
    }
    let retransmit = {
        let mut pending = engine.pending.borrow_mut();
        let Some(query) = pending.get_mut(slot) else {
            return; // Completed already; tombstoned timer.
        };
        if query.attempts_left > 1 && !query.cancelled.get() {
            query.attempts_left -= 1;
            query.timer = None;
            Some(query.wire.clone())
        } else {
            None
        }
    };
    match retransmit {
        Some(message) => {
            tracing::debug!("retransmitting query");
            send_datagram(engine, slot, message);
            arm_attempt_timer(engine, slot);
        }
        None => complete(engine, slot, Err(DnsError::timeout())),
    }
}

/// The engine's read pump: one outstanding datagram read while queries
/// are pending, re-armed after every delivery.
fn start_pump(engine: &Rc<Engine>) {
    if engine.pump_active.get() || engine.shut.get() {
        return;
    }
    let transport = engine.transport.borrow().clone();
    let Some(transport) = transport else {
        return;
    };
    engine.pump_active.set(true);
    let epoch = engine.epoch.get();
    let strong = Rc::clone(engine);
    transport.read(move |result| {
        if strong.epoch.get() != epoch || strong.shut.get() {
            return; // A stale pump from a replaced transport.
        }
        strong.pump_active.set(false);
        match result {
            Ok(datagram) => {
                on_datagram(&strong, &datagram);
                start_pump(&strong);
            }
            Err(err) => {
                // Typically an ICMP-surfaced send error; the per-attempt
                // timers own failure, so keep listening.
                tracing::debug!(error = %err, "nameserver read failed");
                start_pump(&strong);
            }
        }
    });
}

fn on_datagram(engine: &Rc<Engine>, datagram: &[u8]) {
    let Some(reply) = wire::parse_reply(datagram) else {
        tracing::trace!("ignoring malformed datagram");
        return;
    };
    let slot = engine.ids.borrow().get(&reply.id).copied();
    let Some(slot) = slot else {
        tracing::trace!(id = reply.id, "ignoring reply for unknown id");
        return;
    };
    let (kind, started) = {
        let pending = engine.pending.borrow();
        let Some(query) = pending.get(slot) else {
            return;
        };
        let name_ok = if engine.randomize_case {
            // 0x20 verification: the reply must echo the randomized
            // spelling byte for byte.
            query.qname_sent == reply.qname
        } else {
            query.qname_sent.eq_ignore_ascii_case(&reply.qname)
        };
        if !name_ok {
            tracing::warn!("reply question does not match query, ignoring");
            return;
        }
        (query.kind, query.started)
    };

    let rtt = started.elapsed();
    let outcome = if reply.code == code::NONE {
        let records = match kind {
            QueryKind::A => Records::Addrs(
                reply
                    .addrs
                    .into_iter()
                    .filter(IpAddr::is_ipv4)
                    .collect(),
            ),
            QueryKind::Aaaa => Records::Addrs(
                reply
                    .addrs
                    .into_iter()
                    .filter(IpAddr::is_ipv6)
                    .collect(),
            ),
            QueryKind::ReverseA | QueryKind::ReverseAaaa => Records::Names(reply.names),
        };
        if records.is_empty() {
            Err(DnsError::from_code(code::NODATA, rtt))
        } else {
            Ok(DnsResponse {
                records,
                ttl: reply.ttl,
                rtt,
            })
        }
    } else {
        Err(DnsError::from_code(reply.code, rtt))
    };
    complete(engine, slot, outcome);
}

/// The engine's single point of final disposition: frees the slot, then
/// either invokes the completion function or, for a cancelled query,
/// silently drops it.
fn complete(engine: &Rc<Engine>, slot: Slot, outcome: Result<DnsResponse, DnsError>) {
    let Some(query) = engine.pending.borrow_mut().remove(slot) else {
        return;
    };
    engine.ids.borrow_mut().remove(&query.id);
    if let Some(token) = query.timer {
        engine.sched.cancel_delayed(token);
    }
    maybe_release_transport(engine);
    if query.cancelled.get() {
        tracing::trace!("suppressing completion of cancelled query");
        return;
    }
    (query.callback)(outcome);
}
