//! Transport protocols and endpoint addresses understood by the proxy.
//!
//! Endpoints are written as `"<protocol>://<host:port>"`, for example
//! `tls://0.0.0.0:23001`. The protocol part is matched case-insensitively and
//! normalised into [`Protocol`] once, at the configuration boundary; nothing
//! deeper in the proxy ever sees a raw protocol string.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer};

use crate::error::ProxyError;

/// Separator between the protocol tag and the socket address.
const SCHEME_SEPARATOR: &str = "://";

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

/// Transport used on one side of the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Plain TCP byte stream.
    Tcp,
    /// TLS over TCP. Mutually authenticated when used on the listen side.
    Tls,
}

impl Protocol {
    /// Canonical lower-case tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Tls => "tls",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ProxyError;

    /// Parses `tcp` or `tls` in any letter case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(Protocol::Tcp)
        } else if s.eq_ignore_ascii_case("tls") {
            Ok(Protocol::Tls)
        } else {
            Err(ProxyError::UnsupportedProtocol(s.to_owned()))
        }
    }
}

impl<'de> Deserialize<'de> for Protocol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// A protocol paired with a `host:port` address.
///
/// The address is kept as a string so that host names are resolved by the
/// socket layer at bind/dial time rather than during configuration parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub addr: String,
}

impl Endpoint {
    pub fn new(protocol: Protocol, addr: impl Into<String>) -> Self {
        Self {
            protocol,
            addr: addr.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SCHEME_SEPARATOR}{}", self.protocol, self.addr)
    }
}

impl FromStr for Endpoint {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (proto, addr) = s
            .split_once(SCHEME_SEPARATOR)
            .ok_or_else(|| ProxyError::InvalidEndpoint(format!("missing `://` in {s:?}")))?;
        let protocol = proto.parse()?;
        let addr = addr.trim();
        if addr.is_empty() || addr.contains(SCHEME_SEPARATOR) {
            return Err(ProxyError::InvalidEndpoint(format!(
                "expected <protocol>://<host:port>, got {s:?}"
            )));
        }
        Ok(Endpoint::new(protocol, addr))
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}
