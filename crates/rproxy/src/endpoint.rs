//! Protocol-driven listen and dial.
//!
//! [`listen`] and [`dial`] are the only places where a [`Protocol`] turns into
//! socket behaviour. Everything they produce is a [`ProxyStream`], so the rest
//! of the proxy handles plain and TLS connections the same way.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use common::{Protocol, ProxyError};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{client, server, TlsAcceptor};
use tracing::debug;

use crate::certs::{ClientBundle, ServerBundle};

/// Upper bound on establishing a backend connection, TLS handshake included.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Stream type
// ---------------------------------------------------------------------------

/// A connected byte stream on either side of the proxy.
pub enum ProxyStream {
    Tcp(TcpStream),
    /// Inbound TLS, terminated by the proxy.
    TlsServer(Box<server::TlsStream<TcpStream>>),
    /// Outbound TLS to the backend.
    TlsClient(Box<client::TlsStream<TcpStream>>),
}

impl ProxyStream {
    pub fn protocol(&self) -> Protocol {
        match self {
            ProxyStream::Tcp(_) => Protocol::Tcp,
            ProxyStream::TlsServer(_) | ProxyStream::TlsClient(_) => Protocol::Tls,
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            ProxyStream::Tcp(s) => s,
            ProxyStream::TlsServer(s) => s.get_ref().0,
            ProxyStream::TlsClient(s) => s.get_ref().0,
        }
    }
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ProxyStream::TlsServer(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            ProxyStream::TlsClient(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ProxyStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ProxyStream::TlsServer(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            ProxyStream::TlsClient(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ProxyStream::TlsServer(s) => Pin::new(s.as_mut()).poll_flush(cx),
            ProxyStream::TlsClient(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ProxyStream::TlsServer(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            ProxyStream::TlsClient(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

// ---------------------------------------------------------------------------
// Listen side
// ---------------------------------------------------------------------------

/// A bound listener for one listen protocol.
pub struct Listener {
    inner: TcpListener,
    tls: Option<TlsAcceptor>,
}

/// Bind a listener on `addr`.
///
/// For [`Protocol::Tls`] the server bundle is mandatory and its client
/// verification policy applies to every accepted connection.
///
/// # Errors
///
/// Returns [`ProxyError::MissingTlsBundle`] (before touching the network) if
/// `tls` is requested without a bundle, or [`ProxyError::Bind`] if the socket
/// cannot be bound.
pub async fn listen(
    protocol: Protocol,
    addr: &str,
    bundle: Option<&ServerBundle>,
) -> Result<Listener, ProxyError> {
    let tls = match protocol {
        Protocol::Tcp => None,
        Protocol::Tls => Some(
            bundle
                .ok_or(ProxyError::MissingTlsBundle { side: "listen" })?
                .acceptor(),
        ),
    };
    let inner = TcpListener::bind(addr)
        .await
        .map_err(|source| ProxyError::Bind {
            addr: addr.to_owned(),
            source,
        })?;
    Ok(Listener { inner, tls })
}

impl Listener {
    pub fn protocol(&self) -> Protocol {
        if self.tls.is_some() {
            Protocol::Tls
        } else {
            Protocol::Tcp
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accept the next TCP connection. For TLS listeners the handshake is
    /// left to [`Incoming::establish`], so a slow client never holds up the
    /// caller's accept loop.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Accept`] if the underlying accept fails.
    pub async fn accept(&self) -> Result<Incoming, ProxyError> {
        let (stream, peer) = self.inner.accept().await.map_err(ProxyError::Accept)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "failed to set TCP_NODELAY");
        }
        Ok(Incoming {
            stream,
            peer,
            tls: self.tls.clone(),
        })
    }

    /// Accept the next connection and complete its handshake.
    pub async fn accept_stream(&self) -> Result<ProxyStream, ProxyError> {
        self.accept().await?.establish().await
    }
}

/// An accepted connection whose TLS handshake (if any) has not yet run.
pub struct Incoming {
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
}

impl Incoming {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Complete the connection. For TLS this runs the server handshake,
    /// which fails unless the client presents a certificate the server
    /// bundle trusts.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Handshake`] if the TLS handshake fails.
    pub async fn establish(self) -> Result<ProxyStream, ProxyError> {
        let Some(acceptor) = self.tls else {
            return Ok(ProxyStream::Tcp(self.stream));
        };
        let peer = self.peer;
        acceptor
            .accept(self.stream)
            .await
            .map(|s| ProxyStream::TlsServer(Box::new(s)))
            .map_err(|source| ProxyError::Handshake {
                peer: peer.to_string(),
                source,
            })
    }
}

// ---------------------------------------------------------------------------
// Backend side
// ---------------------------------------------------------------------------

/// Connect to `addr` using `protocol`, giving up after `timeout`.
///
/// For [`Protocol::Tls`] the client bundle is mandatory and the handshake is
/// part of the connect, so the returned stream is ready for application data.
/// There is no retry.
///
/// # Errors
///
/// Returns [`ProxyError::MissingTlsBundle`] (before touching the network),
/// [`ProxyError::DialTimeout`] if `timeout` elapses, or [`ProxyError::Dial`]
/// if the connection or handshake fails.
pub async fn dial(
    protocol: Protocol,
    addr: &str,
    bundle: Option<&ClientBundle>,
    timeout: Duration,
) -> Result<ProxyStream, ProxyError> {
    let bundle = match protocol {
        Protocol::Tcp => None,
        Protocol::Tls => Some(bundle.ok_or(ProxyError::MissingTlsBundle { side: "backend" })?),
    };

    match tokio::time::timeout(timeout, connect(addr, bundle)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ProxyError::Dial {
            addr: addr.to_owned(),
            source,
        }),
        Err(_) => Err(ProxyError::DialTimeout {
            addr: addr.to_owned(),
            timeout,
        }),
    }
}

async fn connect(addr: &str, bundle: Option<&ClientBundle>) -> io::Result<ProxyStream> {
    let tcp = TcpStream::connect(addr).await?;
    tcp.set_nodelay(true)?;
    let Some(bundle) = bundle else {
        return Ok(ProxyStream::Tcp(tcp));
    };
    let tls = bundle
        .connector()
        .connect(bundle.server_name().clone(), tcp)
        .await?;
    Ok(ProxyStream::TlsClient(Box::new(tls)))
}
