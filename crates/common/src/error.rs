//! Common error types shared across crates.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Top-level proxy error type.
///
/// Variants fall into two groups, see [`ProxyError::is_fatal`]:
/// - process-level: configuration, certificate, bind and accept failures stop
///   the proxy before or while it serves;
/// - session-level: handshake and dial failures end a single proxied session
///   and never affect the others.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A protocol tag other than `tcp` or `tls`.
    #[error("unsupported protocol: {0:?}")]
    UnsupportedProtocol(String),

    /// An endpoint string that is not of the form `<protocol>://<host:port>`.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The expected backend server name is not a valid DNS name or IP address.
    #[error("invalid server name: {0:?}")]
    InvalidServerName(String),

    /// A TLS listen or dial was requested without the matching bundle.
    #[error("{side} protocol is tls but no {side} TLS bundle is configured")]
    MissingTlsBundle { side: &'static str },

    /// Certificate material could not be read, parsed or paired.
    #[error("failed to load certificate material from {path}: {reason}")]
    CertLoad { path: String, reason: String },

    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Accepting an inbound connection failed.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// The inbound TLS handshake failed (including a missing or untrusted
    /// client certificate).
    #[error("TLS handshake with {peer} failed: {source}")]
    Handshake {
        peer: String,
        #[source]
        source: io::Error,
    },

    /// Connecting to the backend failed.
    #[error("failed to dial backend {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Connecting to the backend did not complete in time.
    #[error("dialing backend {addr} timed out after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },
}

impl ProxyError {
    /// Returns `true` for errors that stop the proxy as a whole, `false` for
    /// errors confined to a single session.
    pub fn is_fatal(&self) -> bool {
        match self {
            ProxyError::UnsupportedProtocol(_)
            | ProxyError::InvalidEndpoint(_)
            | ProxyError::InvalidServerName(_)
            | ProxyError::MissingTlsBundle { .. }
            | ProxyError::CertLoad { .. }
            | ProxyError::Bind { .. }
            | ProxyError::Accept(_) => true,
            ProxyError::Handshake { .. }
            | ProxyError::Dial { .. }
            | ProxyError::DialTimeout { .. } => false,
        }
    }

    /// Builds a [`ProxyError::CertLoad`] for `path`.
    pub fn cert_load(path: impl Into<String>, reason: impl ToString) -> Self {
        ProxyError::CertLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(ProxyError::UnsupportedProtocol("udp".into()).is_fatal());
        assert!(ProxyError::cert_load("root.pem", "no certificates").is_fatal());
        assert!(ProxyError::Accept(io::Error::other("boom")).is_fatal());
        assert!(!ProxyError::Dial {
            addr: "127.0.0.1:1".into(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        }
        .is_fatal());
        assert!(!ProxyError::DialTimeout {
            addr: "10.0.0.1:443".into(),
            timeout: Duration::from_secs(30),
        }
        .is_fatal());
    }

    #[test]
    fn display_includes_context() {
        let e = ProxyError::cert_load("certs/root_cert.pem", "no certificates found");
        let msg = e.to_string();
        assert!(msg.contains("certs/root_cert.pem"));
        assert!(msg.contains("no certificates found"));

        let e = ProxyError::MissingTlsBundle { side: "listen" };
        assert_eq!(
            e.to_string(),
            "listen protocol is tls but no listen TLS bundle is configured"
        );
    }
}
