//! Cancellable DNS resolver.
//!
//! A [`Resolver`] wraps one lazily-created lookup [`engine`] instance.
//! The engine configuration (nameserver override, attempt count,
//! per-attempt timeout, query-name case randomization) is read once,
//! when the first lookup forces engine creation, and reused for the
//! resolver's lifetime.
//!
//! # Cancellation contract
//!
//! [`Resolver::resolve`] returns a [`Query`] handle sharing a
//! cancellation flag with the engine. After a successful
//! [`Query::cancel`] the completion function is never invoked, not even
//! if the engine's answer is already in flight, and the engine frees
//! its state on whichever notification arrives first. Dropping the
//! handle without cancelling leaves the lookup running to completion.
//!
//! Dropping the resolver synchronously fails every pending query with a
//! Shutdown error before any memory is released.
//!
//! # Example
//!
//! ```ignore
//! let resolver = Resolver::new(&sched, ResolveSettings::default());
//! let query = resolver.resolve(QueryKind::A, "example.com", |result| {
//!     match result {
//!         Ok(response) => println!("{:?} (rtt {:?})", response.records, response.rtt),
//!         Err(err) => println!("lookup failed: {err}"),
//!     }
//! })?;
//! // later, if the measurement moved on:
//! query.cancel();
//! ```

pub mod engine;
pub mod error;
pub mod wire;

pub use error::{DnsError, DnsErrorKind};
pub use wire::QueryKind;

use crate::error::{Error, ErrorKind};
use crate::sched::Scheduler;
use engine::Engine;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::rc::Rc;
use std::time::Duration;

/// Options read once at engine creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveSettings {
    /// Nameserver override, as `"ip"` or `"ip:port"`. Without it the
    /// system resolver configuration is used.
    #[serde(default)]
    pub nameserver: Option<String>,
    /// Transmissions per query before giving up.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Wait per transmission before the next attempt.
    #[serde(default = "default_attempt_timeout")]
    pub timeout: Duration,
    /// Randomize the query name's ASCII case and verify the echo
    /// (0x20 encoding).
    #[serde(default)]
    pub randomize_case: bool,
}

fn default_attempts() -> u32 {
    3
}

fn default_attempt_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for ResolveSettings {
    fn default() -> Self {
        Self {
            nameserver: None,
            attempts: default_attempts(),
            timeout: default_attempt_timeout(),
            randomize_case: false,
        }
    }
}

/// Records carried by a successful lookup.
///
/// Reverse lookups get their own variant instead of reusing the address
/// slot, so consumers never guess by query kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Records {
    /// Forward (A/AAAA) results, in answer order.
    Addrs(Vec<std::net::IpAddr>),
    /// Reverse (PTR) results, in answer order.
    Names(Vec<String>),
}

impl Records {
    /// True if no record survived extraction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Addrs(addrs) => addrs.is_empty(),
            Self::Names(names) => names.is_empty(),
        }
    }
}

/// A successful lookup outcome.
#[derive(Debug, Clone)]
pub struct DnsResponse {
    /// Extracted records.
    pub records: Records,
    /// Time-to-live of the answer.
    pub ttl: u32,
    /// Measured round-trip time.
    pub rtt: Duration,
}

/// Handle to one outstanding lookup.
///
/// The handle shares a cancellation flag with the engine; engine-side
/// state may outlive the handle, never the reverse.
#[derive(Debug)]
pub struct Query {
    cancelled: Rc<Cell<bool>>,
}

impl Query {
    /// Cancels the lookup.
    ///
    /// Best-effort on the wire (a request already sent cannot be
    /// retracted) but absolute for the caller: after this returns, the
    /// completion function will not be invoked. Cancelling after the
    /// completion already ran is a safe no-op.
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    /// True once [`Query::cancel`] was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

/// Cancellable resolver over a lazily-created lookup engine.
pub struct Resolver {
    sched: Scheduler,
    settings: ResolveSettings,
    engine: RefCell<Option<Rc<Engine>>>,
}

impl Resolver {
    /// Creates a resolver; the engine comes into being on first use.
    #[must_use]
    pub fn new(sched: &Scheduler, settings: ResolveSettings) -> Self {
        Self {
            sched: sched.clone(),
            settings,
            engine: RefCell::new(None),
        }
    }

    /// Issues a lookup.
    ///
    /// For the reverse kinds `name` must be an address literal of the
    /// matching family; a mismatch fails synchronously with
    /// [`ErrorKind::InvalidInput`] before any engine interaction.
    pub fn resolve(
        &self,
        kind: QueryKind,
        name: &str,
        callback: impl FnOnce(Result<DnsResponse, DnsError>) + 'static,
    ) -> Result<Query, Error> {
        let qname = match kind {
            QueryKind::A | QueryKind::Aaaa => name.to_string(),
            QueryKind::ReverseA => {
                let ip: Ipv4Addr = name
                    .parse()
                    .map_err(|_| Error::new(ErrorKind::InvalidInput, "not an IPv4 literal"))?;
                wire::reverse_name(ip.into())
            }
            QueryKind::ReverseAaaa => {
                let ip: Ipv6Addr = name
                    .parse()
                    .map_err(|_| Error::new(ErrorKind::InvalidInput, "not an IPv6 literal"))?;
                wire::reverse_name(ip.into())
            }
        };
        let engine = self.engine()?;
        let cancelled = engine::issue(&engine, kind, &qname, Box::new(callback))?;
        Ok(Query { cancelled })
    }

    /// The engine, created on first call with the settings read once.
    fn engine(&self) -> Result<Rc<Engine>, Error> {
        let mut slot = self.engine.borrow_mut();
        if let Some(engine) = slot.as_ref() {
            return Ok(Rc::clone(engine));
        }
        let engine = Engine::create(&self.sched, &self.settings)?;
        *slot = Some(Rc::clone(&engine));
        Ok(engine)
    }

    /// Number of queries awaiting final disposition.
    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.engine
            .borrow()
            .as_ref()
            .map_or(0, |engine| engine.pending_count())
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.borrow_mut().take() {
            engine::shutdown(&engine);
        }
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("settings", &self.settings)
            .field("engine_created", &self.engine.borrow().is_some())
            .finish_non_exhaustive()
    }
}
