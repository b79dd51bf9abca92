//! DNS failure taxonomy.
//!
//! The vocabulary is closed; unmapped protocol or system codes fall back
//! to [`DnsErrorKind::Generic`] and retain the raw numeric code for
//! diagnosis. Failures that a remote server actually answered (server
//! failure, refused, name-not-exist, ...) carry the measured round-trip
//! time; purely local outcomes (timeout, shutdown, cancel) report zero.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Raw numeric codes carried alongside the taxonomy.
///
/// Values 0..=5 are the RFC 1035 response codes; 65 and up are
/// engine-local conditions, kept numerically compatible with the
/// historical resolver engines measurement tooling reports on.
pub mod code {
    /// No error.
    pub const NONE: i32 = 0;
    /// The server could not interpret the query.
    pub const FORMAT: i32 = 1;
    /// The server failed to process the query.
    pub const SERVER_FAILED: i32 = 2;
    /// The domain name does not exist.
    pub const NOT_EXIST: i32 = 3;
    /// The server does not implement the requested query kind.
    pub const NOT_IMPL: i32 = 4;
    /// The server refused for policy reasons.
    pub const REFUSED: i32 = 5;
    /// The reply was truncated.
    pub const TRUNCATED: i32 = 65;
    /// Unknown failure.
    pub const UNKNOWN: i32 = 66;
    /// No reply within the attempt budget.
    pub const TIMEOUT: i32 = 67;
    /// The resolver was torn down with the query pending.
    pub const SHUTDOWN: i32 = 68;
    /// The query was cancelled.
    pub const CANCEL: i32 = 69;
    /// The reply carried no records of the requested type.
    pub const NODATA: i32 = 70;
}

/// True for outcomes where a remote server actually answered, which is
/// the precondition for a meaningful round-trip time.
#[must_use]
pub fn server_answered(code_value: i32) -> bool {
    matches!(
        code_value,
        code::NONE
            | code::FORMAT
            | code::SERVER_FAILED
            | code::NOT_EXIST
            | code::NOT_IMPL
            | code::REFUSED
            | code::TRUNCATED
            | code::NODATA
    )
}

/// The kind of DNS failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DnsErrorKind {
    /// Temporary failure in name resolution.
    Temporary,
    /// Invalid resolution flags.
    InvalidFlags,
    /// Non-recoverable failure in name resolution.
    NonRecoverable,
    /// The address family is not supported.
    UnsupportedFamily,
    /// Out of memory.
    OutOfMemory,
    /// The name or service is not known.
    NameOrServiceUnknown,
    /// A result buffer overflowed.
    BufferOverflow,
    /// The protocol is not supported.
    UnsupportedProtocol,
    /// The service is not supported for the socket type.
    UnsupportedService,
    /// The socket type is not supported.
    UnsupportedSocketType,
    /// No reply within the attempt budget.
    Timeout,
    /// The resolver was torn down with the query pending.
    Shutdown,
    /// The query was cancelled.
    Cancelled,
    /// The reply carried no records of the requested type.
    NoData,
    /// Catch-all for unmapped codes.
    Generic,
}

impl DnsErrorKind {
    /// Short stable string used in logs and reports.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Temporary => "temporary",
            Self::InvalidFlags => "invalid_flags",
            Self::NonRecoverable => "non_recoverable",
            Self::UnsupportedFamily => "unsupported_family",
            Self::OutOfMemory => "out_of_memory",
            Self::NameOrServiceUnknown => "name_or_service_unknown",
            Self::BufferOverflow => "buffer_overflow",
            Self::UnsupportedProtocol => "unsupported_protocol",
            Self::UnsupportedService => "unsupported_service",
            Self::UnsupportedSocketType => "unsupported_socket_type",
            Self::Timeout => "timeout",
            Self::Shutdown => "shutdown",
            Self::Cancelled => "cancelled",
            Self::NoData => "no_data",
            Self::Generic => "generic",
        }
    }
}

impl fmt::Display for DnsErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed lookup outcome.
#[derive(Debug, Clone, Error)]
#[error("dns lookup failed: {kind} (code {code})")]
pub struct DnsError {
    /// Closed failure kind.
    pub kind: DnsErrorKind,
    /// Raw numeric code (see [`code`]).
    pub code: i32,
    /// Round-trip time; non-zero only when a server answered.
    pub rtt: Duration,
}

impl DnsError {
    /// Builds the error for an engine code, attaching `rtt` only when
    /// that code means a server answered.
    #[must_use]
    pub fn from_code(code_value: i32, rtt: Duration) -> Self {
        let kind = match code_value {
            code::FORMAT | code::NOT_IMPL | code::REFUSED => DnsErrorKind::NonRecoverable,
            code::SERVER_FAILED => DnsErrorKind::Temporary,
            code::NOT_EXIST => DnsErrorKind::NameOrServiceUnknown,
            code::TIMEOUT => DnsErrorKind::Timeout,
            code::SHUTDOWN => DnsErrorKind::Shutdown,
            code::CANCEL => DnsErrorKind::Cancelled,
            code::NODATA => DnsErrorKind::NoData,
            _ => DnsErrorKind::Generic,
        };
        let rtt = if server_answered(code_value) {
            rtt
        } else {
            Duration::ZERO
        };
        Self {
            kind,
            code: code_value,
            rtt,
        }
    }

    /// Maps a `getaddrinfo`-style code onto the taxonomy, for callers
    /// that fall back to the system resolver.
    #[must_use]
    pub fn from_eai(code_value: i32) -> Self {
        let kind = match code_value {
            libc::EAI_AGAIN => DnsErrorKind::Temporary,
            libc::EAI_BADFLAGS => DnsErrorKind::InvalidFlags,
            libc::EAI_FAIL => DnsErrorKind::NonRecoverable,
            libc::EAI_FAMILY => DnsErrorKind::UnsupportedFamily,
            libc::EAI_MEMORY => DnsErrorKind::OutOfMemory,
            libc::EAI_NONAME => DnsErrorKind::NameOrServiceUnknown,
            libc::EAI_OVERFLOW => DnsErrorKind::BufferOverflow,
            libc::EAI_SERVICE => DnsErrorKind::UnsupportedService,
            libc::EAI_SOCKTYPE => DnsErrorKind::UnsupportedSocketType,
            _ => DnsErrorKind::Generic,
        };
        Self {
            kind,
            code: code_value,
            rtt: Duration::ZERO,
        }
    }

    /// The shutdown error delivered to queries pending at teardown.
    #[must_use]
    pub fn shutdown() -> Self {
        Self::from_code(code::SHUTDOWN, Duration::ZERO)
    }

    /// The timeout error delivered when the attempt budget is exhausted.
    #[must_use]
    pub fn timeout() -> Self {
        Self::from_code(code::TIMEOUT, Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc_codes_map_onto_taxonomy() {
        assert_eq!(
            DnsError::from_code(code::SERVER_FAILED, Duration::ZERO).kind,
            DnsErrorKind::Temporary
        );
        assert_eq!(
            DnsError::from_code(code::NOT_EXIST, Duration::ZERO).kind,
            DnsErrorKind::NameOrServiceUnknown
        );
        assert_eq!(
            DnsError::from_code(code::REFUSED, Duration::ZERO).kind,
            DnsErrorKind::NonRecoverable
        );
        assert_eq!(
            DnsError::from_code(code::NODATA, Duration::ZERO).kind,
            DnsErrorKind::NoData
        );
    }

    #[test]
    fn unmapped_code_falls_back_to_generic_with_raw_code() {
        let err = DnsError::from_code(42, Duration::ZERO);
        assert_eq!(err.kind, DnsErrorKind::Generic);
        assert_eq!(err.code, 42);
    }

    #[test]
    fn rtt_only_for_server_answered_outcomes() {
        let rtt = Duration::from_millis(12);
        assert_eq!(DnsError::from_code(code::SERVER_FAILED, rtt).rtt, rtt);
        assert_eq!(DnsError::from_code(code::TRUNCATED, rtt).rtt, rtt);
        assert_eq!(DnsError::from_code(code::TIMEOUT, rtt).rtt, Duration::ZERO);
        assert_eq!(DnsError::from_code(code::SHUTDOWN, rtt).rtt, Duration::ZERO);
        assert_eq!(DnsError::from_code(code::CANCEL, rtt).rtt, Duration::ZERO);
    }

    #[test]
    fn eai_codes_map_onto_taxonomy() {
        assert_eq!(
            DnsError::from_eai(libc::EAI_AGAIN).kind,
            DnsErrorKind::Temporary
        );
        assert_eq!(
            DnsError::from_eai(libc::EAI_NONAME).kind,
            DnsErrorKind::NameOrServiceUnknown
        );
        assert_eq!(
            DnsError::from_eai(libc::EAI_SOCKTYPE).kind,
            DnsErrorKind::UnsupportedSocketType
        );
        // Anything unknown keeps its raw code under Generic.
        let err = DnsError::from_eai(-999);
        assert_eq!(err.kind, DnsErrorKind::Generic);
        assert_eq!(err.code, -999);
    }
}
