//! Stream and datagram transports.
//!
//! A transport is one connected conversation: a byte stream
//! ([`StreamTransport`]) or a best-effort datagram exchange
//! ([`DatagramTransport`]). Both expose the same discipline:
//!
//! - `read` enqueues a read-waiter; waiters resolve strictly in enqueue
//!   order, one chunk (or datagram) each. Readability interest exists
//!   only while the waiter queue is non-empty.
//! - `write` enqueues a write-job; the sole job starts immediately;
//!   completions fire in enqueue order. On datagram transports each job
//!   is exactly one datagram, never merged or split.
//! - `close` is idempotent, resolves queued waiters with a Shutdown
//!   error, and defers the final teardown to a later loop tick, never
//!   inside a readiness callback's own stack frame.
//!
//! The [`Transport`] trait is the seam where byte-stream filters (TLS)
//! wrap an inner transport. A wrapper forwards `set_timeout` to the
//! innermost transport: inactivity belongs to the wire, and wrapper-level
//! timeouts have been observed to abort healthy transfers.

pub mod connect;
pub mod datagram;
pub mod socks5;
pub mod stream;

pub use connect::{ConnectSettings, Family};
pub use datagram::DatagramTransport;
pub use stream::StreamTransport;

use crate::error::Error;
use std::net::SocketAddr;
use std::time::Duration;

/// Boxed read completion: one chunk or one error.
pub type ReadCallback = Box<dyn FnOnce(Result<Vec<u8>, Error>) + 'static>;

/// Boxed write completion.
pub type WriteCallback = Box<dyn FnOnce(Result<(), Error>) + 'static>;

/// Boxed connect completion.
pub type ConnectCallback = Box<dyn FnOnce(Result<StreamTransport, Error>) + 'static>;

/// One connected conversation, stream or datagram.
///
/// Object-safe so protocol layers can hold `Box<dyn Transport>` and
/// filters can wrap one another.
pub trait Transport {
    /// Enqueues a read-waiter for the next chunk.
    fn read(&self, callback: ReadCallback);

    /// Enqueues a write-job for the given bytes.
    fn write(&self, data: Vec<u8>, callback: WriteCallback);

    /// Sets the inactivity timeout applied to subsequent I/O windows.
    ///
    /// Wrappers forward this to the innermost transport.
    fn set_timeout(&self, timeout: Option<Duration>);

    /// Closes the transport. Idempotent.
    fn close(&self);

    /// The local address, once known.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// The peer address, once known.
    fn peer_addr(&self) -> Option<SocketAddr>;
}
