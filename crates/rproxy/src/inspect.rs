//! Transparent stream instrumentation.
//!
//! [`Inspect`] wraps any async stream and reports each chunk that passes
//! through it to an [`Observer`]. The bytes themselves are never touched: the
//! wrapper forwards every poll unchanged and only looks at what the inner
//! stream reports as read or written.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// Receives the bytes seen by an [`Inspect`] wrapper.
pub trait Observer: Send + Sync {
    /// Called with the bytes returned by a successful read.
    fn on_read(&self, _data: &[u8]) {}

    /// Called with the bytes accepted by a successful write.
    fn on_write(&self, _data: &[u8]) {}
}

impl<O: Observer + ?Sized> Observer for Arc<O> {
    fn on_read(&self, data: &[u8]) {
        (**self).on_read(data)
    }

    fn on_write(&self, data: &[u8]) {
        (**self).on_write(data)
    }
}

/// Logs observed traffic at `debug` level (verbose mode).
///
/// The wrapped stream is the client-facing one, so reads are bytes heading
/// to the backend and writes are bytes heading back to the client.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn on_read(&self, data: &[u8]) {
        debug!(
            direction = "client→backend",
            len = data.len(),
            data = %String::from_utf8_lossy(data),
            "traffic"
        );
    }

    fn on_write(&self, data: &[u8]) {
        debug!(
            direction = "backend→client",
            len = data.len(),
            data = %String::from_utf8_lossy(data),
            "traffic"
        );
    }
}

/// Pass-through wrapper around a stream `S`.
#[derive(Debug)]
pub struct Inspect<S, O> {
    inner: S,
    observer: O,
}

impl<S, O> Inspect<S, O> {
    pub fn new(inner: S, observer: O) -> Self {
        Self { inner, observer }
    }
}

impl<S, O> AsyncRead for Inspect<S, O>
where
    S: AsyncRead + Unpin,
    O: Observer + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            let data = &buf.filled()[before..];
            if !data.is_empty() {
                this.observer.on_read(data);
            }
        }
        poll
    }
}

impl<S, O> AsyncWrite for Inspect<S, O>
where
    S: AsyncWrite + Unpin,
    O: Observer + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            if n > 0 {
                this.observer.on_write(&buf[..n]);
            }
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
