//! Connect settings.
//!
//! The orchestrator feeds these from its test configuration, so the
//! struct derives serde traits and every field has a sensible default.

use crate::error::{Error, ErrorKind};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Address family constraint for connect-time resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    /// Accept either family; IPv4 candidates are tried first.
    #[default]
    Unspec,
    /// IPv4 only.
    V4,
    /// IPv6 only.
    V6,
}

impl Family {
    /// True if a literal of this address family is acceptable.
    #[must_use]
    pub fn accepts(self, ip: IpAddr) -> bool {
        match self {
            Self::Unspec => true,
            Self::V4 => ip.is_ipv4(),
            Self::V6 => ip.is_ipv6(),
        }
    }
}

/// Options recognized by [`StreamTransport::connect`].
///
/// [`StreamTransport::connect`]: super::StreamTransport::connect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectSettings {
    /// Endpoint address: an IP literal or a hostname to resolve.
    pub address: String,
    /// Endpoint port.
    pub port: u16,
    /// Address family constraint.
    #[serde(default)]
    pub family: Family,
    /// Inactivity timeout for the connect attempt and subsequent I/O.
    #[serde(default = "default_timeout")]
    pub timeout: Option<Duration>,
    /// SOCKS5 proxy as `"host:port"`; the endpoint is requested through
    /// the proxy's CONNECT command.
    #[serde(default)]
    pub socks5_proxy: Option<String>,
    /// CA bundle path handed to the TLS filter wrapping this transport.
    /// Not consumed at this layer.
    #[serde(default)]
    pub ca_bundle_path: Option<String>,
}

fn default_timeout() -> Option<Duration> {
    Some(Duration::from_secs(30))
}

impl ConnectSettings {
    /// Settings for a plain connect to `address:port`.
    #[must_use]
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            family: Family::Unspec,
            timeout: default_timeout(),
            socks5_proxy: None,
            ca_bundle_path: None,
        }
    }

    /// Splits `socks5_proxy` into host and port, if configured.
    pub(crate) fn proxy_endpoint(&self) -> Option<Result<(String, u16), Error>> {
        let raw = self.socks5_proxy.as_deref()?;
        Some(split_host_port(raw))
    }
}

/// Splits `"host:port"`, accepting a bracketed IPv6 host.
fn split_host_port(raw: &str) -> Result<(String, u16), Error> {
    let invalid = || Error::new(ErrorKind::InvalidInput, "malformed host:port");
    let (host, port) = if let Some(rest) = raw.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').ok_or_else(invalid)?;
        let port = rest.strip_prefix(':').ok_or_else(invalid)?;
        (host, port)
    } else {
        raw.rsplit_once(':').ok_or_else(invalid)?
    };
    if host.is_empty() {
        return Err(invalid());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}
