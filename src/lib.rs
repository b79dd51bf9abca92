//! Netsonde: asynchronous network I/O core for censorship-measurement probes.
//!
//! # Overview
//!
//! Netsonde is the bottom layer of a network measurement toolkit. It runs
//! many independent network operations (TCP connects, stream and datagram
//! send/receive, DNS lookups) concurrently on a single cooperative event
//! loop, with explicit cancellation and a closed error vocabulary that the
//! protocol layers above (HTTP client, control-port client, report
//! submission, test orchestration) rely on.
//!
//! # Core Guarantees
//!
//! - **One loop thread**: all state is touched from the thread driving
//!   [`sched::Scheduler::run`]; the only escape hatches re-enter the loop
//!   through an injection queue before touching shared state.
//! - **Strict FIFO I/O**: per-transport, per-direction read and write
//!   queues resolve in submission order, one completion each.
//! - **Exactly-once completion**: every submitted operation resolves with
//!   success or exactly one error value; no callback is silently dropped.
//! - **Cancellation without use-after-free**: outstanding DNS queries are
//!   tombstoned in a generation-indexed arena; a cancelled query's
//!   completion function is never invoked, no matter when the engine
//!   answers.
//! - **Deferred teardown**: a transport is never destroyed inside one of
//!   its own readiness callbacks; final release happens on a later tick.
//!
//! # Module Structure
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`sched`] | Cooperative event loop: tasks, timers, fd watches, worker hatch |
//! | [`net`] | Stream and datagram transports with FIFO I/O queues |
//! | [`dns`] | Cancellable resolver over a lazily-created lookup engine |
//! | [`error`] | Crate-wide closed error taxonomy |
//!
//! # Example
//!
//! ```ignore
//! use netsonde::sched::Scheduler;
//! use netsonde::net::{ConnectSettings, StreamTransport};
//!
//! let sched = Scheduler::new()?;
//! let settings = ConnectSettings::new("93.184.216.34", 80);
//! StreamTransport::connect(&sched, settings, |result| match result {
//!     Ok(stream) => stream.write(b"GET / HTTP/1.0\r\n\r\n".to_vec(), |_| {}),
//!     Err(err) => eprintln!("connect failed: {err}"),
//! });
//! sched.run()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod dns;
pub mod error;
pub mod net;
pub mod sched;
pub mod test_utils;

pub use error::{Error, ErrorKind};
pub use sched::{RemoteHandle, Scheduler};
