//! The proxy server: bundle resolution, accept loop and session dispatch.
//!
//! Lifecycle:
//! 1. [`ProxyServer`] holds the configuration and any pre-built TLS bundles.
//! 2. [`ProxyServer::bind`] builds the missing bundles and binds the listener,
//!    yielding a [`BoundProxy`].
//! 3. [`BoundProxy::serve`] runs the accept loop. Every accepted connection
//!    becomes an independent session task: handshake, backend dial,
//!    forwarding.
//!
//! The loop only ends on a fatal accept error (see
//! [`ProxyConfig::continue_on_accept_error`]); otherwise it runs until the
//! process exits.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::{Endpoint, Protocol, ProxyError};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::certs::{self, ClientBundle, ServerBundle};
use crate::endpoint::{self, Incoming, Listener, DEFAULT_DIAL_TIMEOUT};
use crate::forward::{self, ForwardSummary};
use crate::inspect::{Inspect, LogObserver};

/// Pause after a recoverable accept error, so a persistent failure such as
/// file-descriptor exhaustion does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Certificate material used to build TLS bundles on demand.
#[derive(Debug, Clone, Default)]
pub struct TlsFiles {
    /// PEM root CA: verifies the backend and inbound client certificates.
    pub root_cert: PathBuf,
    /// Identity presented to inbound TLS clients.
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    /// Identity presented to a TLS backend.
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
    /// Name the TLS backend's certificate must be valid for.
    pub server_name: String,
}

/// Immutable proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen: Endpoint,
    pub backend: Endpoint,
    pub tls: TlsFiles,
    /// Log all proxied bytes at `debug` level.
    pub verbose: bool,
    /// Whether the accept loop survives a failed accept. `None` selects the
    /// per-protocol default: continue for `tcp`, stop for `tls`.
    pub continue_on_accept_error: Option<bool>,
    pub dial_timeout: Duration,
}

impl ProxyConfig {
    /// A configuration without certificate files, for plain TCP or for use
    /// with pre-built bundles.
    pub fn new(listen: Endpoint, backend: Endpoint) -> Self {
        Self {
            listen,
            backend,
            tls: TlsFiles::default(),
            verbose: false,
            continue_on_accept_error: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    /// Parse both endpoints from `<protocol>://<host:port>` strings.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::UnsupportedProtocol`] or
    /// [`ProxyError::InvalidEndpoint`] for either endpoint.
    pub fn parse(listen: &str, backend: &str) -> Result<Self, ProxyError> {
        Ok(Self::new(listen.parse()?, backend.parse()?))
    }

    pub fn with_tls_files(mut self, tls: TlsFiles) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_continue_on_accept_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_accept_error = Some(continue_on_error);
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Effective accept-error policy.
    pub fn accept_errors_are_recoverable(&self) -> bool {
        self.continue_on_accept_error
            .unwrap_or(match self.listen.protocol {
                Protocol::Tcp => true,
                Protocol::Tls => false,
            })
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// A configured proxy that has not started listening yet.
#[derive(Debug)]
pub struct ProxyServer {
    config: ProxyConfig,
    client_bundle: Option<ClientBundle>,
    server_bundle: Option<ServerBundle>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            client_bundle: None,
            server_bundle: None,
        }
    }

    /// Use `bundle` for TLS backends instead of loading the configured files.
    pub fn with_client_bundle(mut self, bundle: ClientBundle) -> Self {
        self.client_bundle = Some(bundle);
        self
    }

    /// Use `bundle` for the TLS listener instead of loading the configured
    /// files.
    pub fn with_server_bundle(mut self, bundle: ServerBundle) -> Self {
        self.server_bundle = Some(bundle);
        self
    }

    /// Resolve TLS bundles and bind the listener.
    ///
    /// # Errors
    ///
    /// Returns certificate errors from bundle construction, or
    /// [`ProxyError::Bind`] if the listen address cannot be bound.
    pub async fn bind(self) -> Result<BoundProxy, ProxyError> {
        let ProxyServer {
            config,
            client_bundle,
            server_bundle,
        } = self;

        let client_bundle = match (config.backend.protocol, client_bundle) {
            (Protocol::Tls, None) => Some(certs::build_client_bundle(
                &config.tls.root_cert,
                &config.tls.client_cert,
                &config.tls.client_key,
                &config.tls.server_name,
            )?),
            (_, supplied) => supplied,
        };
        let server_bundle = match (config.listen.protocol, server_bundle) {
            (Protocol::Tls, None) => Some(certs::build_server_bundle(
                &config.tls.root_cert,
                &config.tls.server_cert,
                &config.tls.server_key,
            )?),
            (_, supplied) => supplied,
        };

        let listener = endpoint::listen(
            config.listen.protocol,
            &config.listen.addr,
            server_bundle.as_ref(),
        )
        .await?;

        info!(
            listen = %config.listen,
            backend = %config.backend,
            local_addr = ?listener.local_addr().ok(),
            "rproxy listening"
        );

        Ok(BoundProxy {
            listener,
            sessions: Arc::new(SessionContext {
                config,
                client_bundle,
            }),
        })
    }

    /// Bind and serve until a fatal error.
    ///
    /// # Errors
    ///
    /// See [`ProxyServer::bind`] and [`BoundProxy::serve`].
    pub async fn start(self) -> Result<(), ProxyError> {
        self.bind().await?.serve().await
    }
}

/// A proxy with a bound listener.
pub struct BoundProxy {
    listener: Listener,
    sessions: Arc<SessionContext>,
}

impl BoundProxy {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop. Each accepted connection is served by its own
    /// task, so the loop never waits on a session.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Accept`] when an accept fails and the accept
    /// policy does not allow continuing.
    pub async fn serve(self) -> Result<(), ProxyError> {
        let listener = &self.listener;
        accept_loop(&self.sessions, move || listener.accept()).await
    }
}

/// Dispatch every connection produced by `accept` until an accept error the
/// policy treats as fatal.
async fn accept_loop<F, Fut>(
    sessions: &Arc<SessionContext>,
    mut accept: F,
) -> Result<(), ProxyError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Incoming, ProxyError>>,
{
    let recoverable = sessions.config.accept_errors_are_recoverable();

    loop {
        match accept().await {
            Ok(incoming) => {
                let id = Uuid::new_v4();
                let peer = incoming.peer_addr();
                debug!(%id, %peer, "accepted connection");
                let sessions = Arc::clone(sessions);
                tokio::spawn(
                    async move { sessions.run(incoming).await }
                        .instrument(info_span!("session", %id, %peer)),
                );
            }
            Err(e) if recoverable => {
                error!(error = %e, "accept error");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
            Err(e) => {
                error!(error = %e, "accept error, stopping listener");
                return Err(e);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Read-only state shared by every session.
#[derive(Debug)]
struct SessionContext {
    config: ProxyConfig,
    client_bundle: Option<ClientBundle>,
}

impl SessionContext {
    async fn run(&self, incoming: Incoming) {
        match self.serve(incoming).await {
            Ok(summary) => info!(
                bytes_to_backend = summary.client_to_backend.bytes,
                bytes_to_client = summary.backend_to_client.bytes,
                error = summary.had_error(),
                "session closed"
            ),
            Err(e) => warn!(error = %e, "session aborted"),
        }
    }

    /// Returning early drops, and so closes, the accepted connection.
    async fn serve(&self, incoming: Incoming) -> Result<ForwardSummary, ProxyError> {
        let client = incoming.establish().await?;
        let backend = endpoint::dial(
            self.config.backend.protocol,
            &self.config.backend.addr,
            self.client_bundle.as_ref(),
            self.config.dial_timeout,
        )
        .await?;
        debug!(backend = %self.config.backend, "backend connected");

        let summary = if self.config.verbose {
            forward::forward(Inspect::new(client, LogObserver), backend).await
        } else {
            forward::forward(client, backend).await
        };
        Ok(summary)
    }
}
