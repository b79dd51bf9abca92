//! Error types and error handling strategy for netsonde.
//!
//! Error handling follows these principles:
//!
//! - Errors are values delivered through each operation's completion
//!   channel, never panics unwinding across a suspension boundary.
//! - The vocabulary is closed: callers can match exhaustively.
//! - Unmapped OS codes fall back to [`ErrorKind::Generic`] and keep the
//!   raw numeric code for diagnosis.
//! - Recoverable per-operation failures (timeout, refused, not-found) are
//!   reported to the immediate caller and never escalate. Invariant
//!   violations inside the loop are bugs and panic instead.
//!
//! # Recovery Classification
//!
//! Every kind classifies as [`Recoverability::Transient`] (safe to retry)
//! or [`Recoverability::Permanent`], which the retry logic of the layers
//! above keys on.

use std::fmt;
use std::io;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A connection attempt failed (refused, unreachable, reset).
    ConnectionFailed,
    /// The operation did not complete within its inactivity window.
    Timeout,
    /// The peer closed its end of the stream.
    ///
    /// Delivered through the normal error channel. A layer implementing
    /// "body ends at connection close" semantics must treat this as
    /// terminal-but-successful, not as a failure.
    EndOfStream,
    /// The caller supplied input the operation cannot act on.
    InvalidInput,
    /// The OS reported resource exhaustion. Fatal for the operation's
    /// owner; retrying will not help.
    OutOfMemory,
    /// The owning object was closed or torn down while the operation was
    /// still pending.
    Shutdown,
    /// The operation was cancelled by explicit request.
    Cancelled,
    /// Catch-all for underlying codes with no closer mapping.
    Generic,
}

/// Broad grouping used when reporting aggregate failure counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection establishment.
    Connect,
    /// Data transfer on an established conversation.
    Io,
    /// Lifecycle: shutdown and cancellation.
    Lifecycle,
    /// Everything else.
    Other,
}

/// Whether retrying the failed operation can reasonably succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recoverability {
    /// Temporary failure; a retry may succeed.
    Transient,
    /// Permanent failure; do not retry.
    Permanent,
}

impl ErrorKind {
    /// Returns the category for this kind.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::ConnectionFailed => ErrorCategory::Connect,
            Self::Timeout | Self::EndOfStream => ErrorCategory::Io,
            Self::Shutdown | Self::Cancelled => ErrorCategory::Lifecycle,
            Self::InvalidInput | Self::OutOfMemory | Self::Generic => ErrorCategory::Other,
        }
    }

    /// Returns the recoverability classification for this kind.
    #[must_use]
    pub const fn recoverability(&self) -> Recoverability {
        match self {
            Self::ConnectionFailed | Self::Timeout | Self::Generic => Recoverability::Transient,
            Self::EndOfStream
            | Self::InvalidInput
            | Self::OutOfMemory
            | Self::Shutdown
            | Self::Cancelled => Recoverability::Permanent,
        }
    }

    /// Short stable string used in logs and reports.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionFailed => "connection_failed",
            Self::Timeout => "timeout",
            Self::EndOfStream => "end_of_stream",
            Self::InvalidInput => "invalid_input",
            Self::OutOfMemory => "out_of_memory",
            Self::Shutdown => "shutdown",
            Self::Cancelled => "cancelled",
            Self::Generic => "generic",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error produced by the scheduler or a transport.
///
/// Carries the closed [`ErrorKind`], an optional raw OS error code, and a
/// static context message naming the operation that failed.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    raw_code: Option<i32>,
    context: &'static str,
}

impl Error {
    /// Creates an error with the given kind and context message.
    #[must_use]
    pub const fn new(kind: ErrorKind, context: &'static str) -> Self {
        Self {
            kind,
            raw_code: None,
            context,
        }
    }

    /// Creates an error that retains a raw OS error code.
    #[must_use]
    pub const fn with_raw(kind: ErrorKind, context: &'static str, raw_code: i32) -> Self {
        Self {
            kind,
            raw_code: Some(raw_code),
            context,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the raw OS error code, when one was captured.
    #[must_use]
    pub const fn raw_code(&self) -> Option<i32> {
        self.raw_code
    }

    /// Returns the static context message.
    #[must_use]
    pub const fn context(&self) -> &'static str {
        self.context
    }

    /// True if this is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }

    /// True if this is the peer closing the stream.
    #[must_use]
    pub const fn is_eof(&self) -> bool {
        matches!(self.kind, ErrorKind::EndOfStream)
    }

    /// Maps an [`io::Error`] onto the closed taxonomy, retaining the raw
    /// OS code when present.
    #[must_use]
    pub fn from_io(err: &io::Error, context: &'static str) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::BrokenPipe => ErrorKind::ConnectionFailed,
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            io::ErrorKind::UnexpectedEof => ErrorKind::EndOfStream,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => ErrorKind::InvalidInput,
            io::ErrorKind::OutOfMemory => ErrorKind::OutOfMemory,
            _ => ErrorKind::Generic,
        };
        match err.raw_os_error() {
            Some(code) => Self::with_raw(kind, context, code),
            None => Self::new(kind, context),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.raw_code {
            Some(code) => write!(f, "{}: {} (os code {})", self.context, self.kind, code),
            None => write!(f, "{}: {}", self.context, self.kind),
        }
    }
}

impl std::error::Error for Error {}
