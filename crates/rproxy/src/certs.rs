//! TLS bundles built from PEM certificate material on disk.
//!
//! Both orientations are produced from the same layout: a root CA file plus a
//! leaf certificate/key pair.
//!
//! - [`ClientBundle`] dials TLS backends. The root CA verifies the backend's
//!   certificate, the leaf pair is presented as the client identity, and the
//!   backend must prove the configured server name.
//! - [`ServerBundle`] terminates inbound TLS. The leaf pair is the server
//!   identity and every client must present a certificate chaining to the
//!   root CA, or the handshake fails before any application data is read.
//!
//! Bundles are built once at startup and shared read-only afterwards.

use std::fmt;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use common::ProxyError;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Client-oriented TLS configuration used to dial the backend.
#[derive(Clone)]
pub struct ClientBundle {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

impl ClientBundle {
    /// Wraps an already-built client configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::InvalidServerName`] if `server_name` is neither a
    /// DNS name nor an IP address.
    pub fn from_config(config: Arc<ClientConfig>, server_name: &str) -> Result<Self, ProxyError> {
        Ok(Self {
            config,
            server_name: parse_server_name(server_name)?,
        })
    }

    /// Name the backend certificate must be valid for.
    pub fn server_name(&self) -> &ServerName<'static> {
        &self.server_name
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(Arc::clone(&self.config))
    }
}

impl fmt::Debug for ClientBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBundle")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// Server-oriented TLS configuration that requires client certificates.
#[derive(Clone)]
pub struct ServerBundle {
    config: Arc<ServerConfig>,
}

impl ServerBundle {
    /// Wraps an already-built server configuration. The caller is responsible
    /// for its client verification policy.
    pub fn from_config(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(Arc::clone(&self.config))
    }
}

impl fmt::Debug for ServerBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBundle").finish_non_exhaustive()
    }
}

/// Build the bundle used to dial TLS backends.
///
/// # Errors
///
/// Returns [`ProxyError::CertLoad`] if any file is unreadable, holds no
/// usable PEM data, or if the leaf certificate and key do not form a valid
/// identity. Returns [`ProxyError::InvalidServerName`] for an unusable
/// `server_name`.
pub fn build_client_bundle(
    root_cert: impl AsRef<Path>,
    leaf_cert: impl AsRef<Path>,
    leaf_key: impl AsRef<Path>,
    server_name: &str,
) -> Result<ClientBundle, ProxyError> {
    let server_name = parse_server_name(server_name)?;
    let roots = load_root_store(&root_cert)?;
    let (chain, key) = load_identity(&leaf_cert, &leaf_key)?;

    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::cert_load(display(&leaf_cert), e))?
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|e| ProxyError::cert_load(display(&leaf_cert), e))?;

    Ok(ClientBundle {
        config: Arc::new(config),
        server_name,
    })
}

/// Build the bundle used to accept mutually authenticated TLS clients.
///
/// # Errors
///
/// Returns [`ProxyError::CertLoad`] under the same conditions as
/// [`build_client_bundle`].
pub fn build_server_bundle(
    root_cert: impl AsRef<Path>,
    leaf_cert: impl AsRef<Path>,
    leaf_key: impl AsRef<Path>,
) -> Result<ServerBundle, ProxyError> {
    let roots = load_root_store(&root_cert)?;
    let (chain, key) = load_identity(&leaf_cert, &leaf_key)?;
    let provider = provider();

    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
        .build()
        .map_err(|e| ProxyError::cert_load(display(&root_cert), e))?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::cert_load(display(&leaf_cert), e))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .map_err(|e| ProxyError::cert_load(display(&leaf_cert), e))?;

    Ok(ServerBundle {
        config: Arc::new(config),
    })
}

/// Load every certificate in a PEM file into a trust anchor store.
///
/// # Errors
///
/// Returns [`ProxyError::CertLoad`] if the file is unreadable or contains no
/// certificate that can serve as a trust anchor.
pub fn load_root_store(path: impl AsRef<Path>) -> Result<RootCertStore, ProxyError> {
    let certs = read_certs(&path)?;
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(ProxyError::cert_load(
            display(&path),
            format!("no usable CA certificates ({ignored} rejected)"),
        ));
    }
    Ok(roots)
}

fn load_identity(
    cert: impl AsRef<Path>,
    key: impl AsRef<Path>,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ProxyError> {
    let chain = read_certs(&cert)?;
    let pem = read_file(&key)?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(pem.as_slice()))
        .map_err(|e| ProxyError::cert_load(display(&key), e))?
        .ok_or_else(|| ProxyError::cert_load(display(&key), "no private key found in PEM data"))?;
    Ok((chain, key))
}

fn read_certs(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let pem = read_file(&path)?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem.as_slice()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::cert_load(display(&path), e))?;
    if certs.is_empty() {
        return Err(ProxyError::cert_load(
            display(&path),
            "no certificates found in PEM data",
        ));
    }
    Ok(certs)
}

fn read_file(path: impl AsRef<Path>) -> Result<Vec<u8>, ProxyError> {
    std::fs::read(path.as_ref()).map_err(|e| ProxyError::cert_load(display(&path), e))
}

fn parse_server_name(name: &str) -> Result<ServerName<'static>, ProxyError> {
    ServerName::try_from(name.to_owned())
        .map_err(|_| ProxyError::InvalidServerName(name.to_owned()))
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn display(path: impl AsRef<Path>) -> String {
    path.as_ref().display().to_string()
}
