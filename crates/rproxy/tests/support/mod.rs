//! Shared fixtures for the rproxy integration tests: a throwaway PKI on disk,
//! loopback backends and a helper that runs a proxy in the background.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rproxy::certs::{self, ClientBundle, ServerBundle};
use rproxy::endpoint::{self, Listener};
use rproxy::{Protocol, ProxyServer, TlsFiles};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;

pub const SERVER_NAME: &str = "testapp-server";

// ---------------------------------------------------------------------------
// PKI
// ---------------------------------------------------------------------------

struct Authority {
    cert: Certificate,
    key: KeyPair,
}

impl Authority {
    fn new(common_name: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let cert = params.self_signed(&key).unwrap();
        Self { cert, key }
    }

    /// Returns `(cert_pem, key_pem)` for a leaf valid for `name`.
    fn issue(&self, name: &str, usage: ExtendedKeyUsagePurpose) -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![name.to_owned()]).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, name);
        params.extended_key_usages = vec![usage];
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        (cert.pem(), key.serialize_pem())
    }
}

/// Certificate files for one root CA, plus material from an unrelated CA.
pub struct Pki {
    _dir: TempDir,
    pub root_cert: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
    /// Client identity issued by a CA the proxy does not trust.
    pub rogue_client_cert: PathBuf,
    pub rogue_client_key: PathBuf,
    /// Server identity for `SERVER_NAME` issued by the untrusted CA.
    pub rogue_server_cert: PathBuf,
    pub rogue_server_key: PathBuf,
}

impl Pki {
    pub fn generate() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = Authority::new("rproxy test root");
        let rogue = Authority::new("rproxy rogue root");

        let write = |name: &str, contents: &str| {
            let path = dir.path().join(name);
            std::fs::write(&path, contents).unwrap();
            path
        };

        let root_cert = write("root_cert.pem", &root.cert.pem());
        let (cert, key) = root.issue(SERVER_NAME, ExtendedKeyUsagePurpose::ServerAuth);
        let server_cert = write("server_cert.pem", &cert);
        let server_key = write("server_key.pem", &key);
        let (cert, key) = root.issue("client-0", ExtendedKeyUsagePurpose::ClientAuth);
        let client_cert = write("client_0_cert.pem", &cert);
        let client_key = write("client_0_key.pem", &key);
        let (cert, key) = rogue.issue("client-rogue", ExtendedKeyUsagePurpose::ClientAuth);
        let rogue_client_cert = write("rogue_client_cert.pem", &cert);
        let rogue_client_key = write("rogue_client_key.pem", &key);
        let (cert, key) = rogue.issue(SERVER_NAME, ExtendedKeyUsagePurpose::ServerAuth);
        let rogue_server_cert = write("rogue_server_cert.pem", &cert);
        let rogue_server_key = write("rogue_server_key.pem", &key);

        Self {
            _dir: dir,
            root_cert,
            server_cert,
            server_key,
            client_cert,
            client_key,
            rogue_client_cert,
            rogue_client_key,
            rogue_server_cert,
            rogue_server_key,
        }
    }

    pub fn tls_files(&self) -> TlsFiles {
        TlsFiles {
            root_cert: self.root_cert.clone(),
            server_cert: self.server_cert.clone(),
            server_key: self.server_key.clone(),
            client_cert: self.client_cert.clone(),
            client_key: self.client_key.clone(),
            server_name: SERVER_NAME.to_owned(),
        }
    }

    pub fn client_bundle(&self) -> ClientBundle {
        certs::build_client_bundle(
            &self.root_cert,
            &self.client_cert,
            &self.client_key,
            SERVER_NAME,
        )
        .unwrap()
    }

    pub fn server_bundle(&self) -> ServerBundle {
        certs::build_server_bundle(&self.root_cert, &self.server_cert, &self.server_key).unwrap()
    }

    /// Trusts the root CA but presents no client certificate.
    pub fn anonymous_client_bundle(&self) -> ClientBundle {
        let roots = certs::load_root_store(&self.root_cert).unwrap();
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
        ClientBundle::from_config(Arc::new(config), SERVER_NAME).unwrap()
    }

    /// Trusts the root CA but presents a certificate from the rogue CA.
    pub fn rogue_client_bundle(&self) -> ClientBundle {
        certs::build_client_bundle(
            &self.root_cert,
            &self.rogue_client_cert,
            &self.rogue_client_key,
            SERVER_NAME,
        )
        .unwrap()
    }
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

pub struct Backend {
    pub addr: SocketAddr,
    /// Connections that completed the (optional) handshake.
    pub accepted: Arc<AtomicUsize>,
}

impl Backend {
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

/// Echo every byte back until the peer closes.
pub async fn spawn_echo_backend(protocol: Protocol, bundle: Option<&ServerBundle>) -> Backend {
    let listener = endpoint::listen(protocol, "127.0.0.1:0", bundle)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    tokio::spawn(echo_loop(listener, Arc::clone(&accepted)));
    Backend { addr, accepted }
}

async fn echo_loop(listener: Listener, accepted: Arc<AtomicUsize>) {
    loop {
        let Ok(incoming) = listener.accept().await else {
            continue;
        };
        let accepted = Arc::clone(&accepted);
        tokio::spawn(async move {
            let Ok(stream) = incoming.establish().await else {
                return;
            };
            accepted.fetch_add(1, Ordering::SeqCst);
            let (mut r, mut w) = tokio::io::split(stream);
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });
    }
}

/// Accepts one plain TCP connection, reports the first `expect_len` bytes it
/// receives, answers with `reply`, then waits for the peer to close.
pub async fn spawn_reply_backend(
    expect_len: usize,
    reply: &'static [u8],
) -> (SocketAddr, oneshot::Receiver<Vec<u8>>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut received = vec![0u8; expect_len];
        stream.read_exact(&mut received).await.unwrap();
        let _ = tx.send(received);
        stream.write_all(reply).await.unwrap();
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
    });
    (addr, rx)
}

/// An address nothing is listening on.
pub async fn closed_port() -> SocketAddr {
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    probe.local_addr().unwrap()
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

/// Bind `server` and run its accept loop in the background.
pub async fn start_proxy(server: ProxyServer) -> SocketAddr {
    let bound = server.bind().await.unwrap();
    let addr = bound.local_addr().unwrap();
    tokio::spawn(bound.serve());
    addr
}
