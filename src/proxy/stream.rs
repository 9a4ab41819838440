//! Duplex byte streams handed to callers.
//!
//! A [`TunnelStream`] wraps whatever carries the bytes (a forwarded channel,
//! an accepted remote connection, or the local end of a command's stdio
//! pipe) together with a cancellation scope. Dropping or closing the stream
//! cancels the scope, which is what background tasks tied to the stream
//! watch for.
//!
//! The stream watches its scope too. Once the scope fires, reads return
//! whatever is already buffered and then EOF, and writes fail with
//! `BrokenPipe`, so no caller stays blocked on a cancelled tunnel.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFutureOwned};

use super::exec::ExecState;
use super::transport::BoxedStream;

/// Diagnostic address of one end of a tunnel.
///
/// `network` is a protocol tag (`tcp`, `ssh`, `ssh-cmd`); `address` is a
/// `host:port` or, for commands, the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelAddr {
    pub network: String,
    pub address: String,
}

impl TunnelAddr {
    pub fn new(network: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for TunnelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.network, self.address)
    }
}

pub struct TunnelStream {
    inner: BoxedStream,
    local: TunnelAddr,
    remote: TunnelAddr,
    scope: CancellationToken,
    _guard: DropGuard,
    // One waiter per direction so split halves keep their own wakers
    read_cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    write_cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    state: Option<watch::Receiver<ExecState>>,
    closed: bool,
}

impl TunnelStream {
    pub(crate) fn new(
        inner: BoxedStream,
        local: TunnelAddr,
        remote: TunnelAddr,
        scope: CancellationToken,
    ) -> Self {
        let guard = scope.clone().drop_guard();
        Self {
            inner,
            local,
            remote,
            read_cancelled: Box::pin(scope.clone().cancelled_owned()),
            write_cancelled: Box::pin(scope.clone().cancelled_owned()),
            scope,
            _guard: guard,
            state: None,
            closed: false,
        }
    }

    /// Attach the state of the command feeding this stream.
    pub(crate) fn with_state(mut self, state: watch::Receiver<ExecState>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn local_addr(&self) -> &TunnelAddr {
        &self.local
    }

    pub fn remote_addr(&self) -> &TunnelAddr {
        &self.remote
    }

    /// Current command state, for streams returned by `exec`.
    pub fn exec_state(&self) -> Option<ExecState> {
        self.state.as_ref().map(|rx| rx.borrow().clone())
    }

    /// Subscribe to command state changes.
    pub fn watch_exec_state(&self) -> Option<watch::Receiver<ExecState>> {
        self.state.clone()
    }

    /// Token cancelled when the stream is torn down.
    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    /// Shut the stream down and wait until everything behind it is released.
    ///
    /// Closing twice is a no-op.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let shutdown = self.inner.shutdown().await;
        self.scope.cancel();
        if let Some(state) = self.state.as_mut() {
            // Sender dropped means teardown already finished
            let _ = state.wait_for(|s| *s == ExecState::Closed).await;
        }
        match shutdown {
            Err(e)
                if !matches!(
                    e.kind(),
                    io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected
                ) =>
            {
                Err(e)
            }
            _ => Ok(()),
        }
    }

    /// Wait until the command behind this stream reached [`ExecState::Closed`].
    /// Returns immediately for streams not backed by a command.
    pub async fn closed(&mut self) {
        if let Some(state) = self.state.as_mut() {
            let _ = state.wait_for(|s| *s == ExecState::Closed).await;
        }
    }
}

impl fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelStream")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("closed", &self.closed)
            .finish()
    }
}

fn cancelled_write() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "tunnel cancelled")
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => Poll::Ready(result),
            // Nothing buffered: a cancelled scope reads as EOF
            Poll::Pending => match this.read_cancelled.as_mut().poll(cx) {
                Poll::Ready(()) => Poll::Ready(Ok(())),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.scope.is_cancelled() {
            return Poll::Ready(Err(cancelled_write()));
        }
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => Poll::Ready(result),
            Poll::Pending => match this.write_cancelled.as_mut().poll(cx) {
                Poll::Ready(()) => Poll::Ready(Err(cancelled_write())),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
