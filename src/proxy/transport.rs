//! Boundary between the pooling core and the SSH library.
//!
//! The pool, dialer and exec state machine only ever talk to a [`Transport`]
//! (one authenticated, multiplexed connection) produced by a [`Connector`].
//! [`crate::proxy::client::SshConnector`] implements both with russh; tests
//! substitute scripted in-memory implementations.
//!
//! Errors crossing this boundary are already classified: implementations must
//! return [`Error::Protocol`](super::error::Error::Protocol) when the peer
//! refused a request and [`Error::Transport`](super::error::Error::Transport)
//! when the connection itself is gone.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use super::config::join_host_port;
use super::error::Result;

/// Far end of a tunnel on the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RemoteTarget {
    /// `direct-tcpip` / `tcpip-forward`.
    Tcp { host: String, port: u16 },
    /// `direct-streamlocal@openssh.com` / `streamlocal-forward@openssh.com`.
    Unix { path: String },
}

impl RemoteTarget {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn unix(path: impl Into<String>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Network name as accepted by the dialer.
    pub fn network(&self) -> &'static str {
        match self {
            Self::Tcp { .. } => "tcp",
            Self::Unix { .. } => "unix",
        }
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => f.write_str(&join_host_port(host, *port)),
            Self::Unix { path } => f.write_str(path),
        }
    }
}

/// Byte stream carried by one channel.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

pub type BoxedStream = Box<dyn StreamIo>;

/// Output of a remote command session, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    ExitStatus(u32),
    /// The remote end will send no more output.
    Eof,
    /// The session is gone. Always the last event.
    Closed,
}

/// Read side of a remote command session.
#[async_trait]
pub trait SessionEvents: Send {
    /// Next event; returns [`SessionEvent::Closed`] forever once the session ended.
    async fn next(&mut self) -> SessionEvent;
}

/// Write side of a remote command session.
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Send bytes to the command's standard input.
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Close the command's standard input.
    async fn eof(&self) -> Result<()>;

    /// Ask the remote side to kill the command.
    ///
    /// Many servers (OpenSSH among them) ignore signal requests, so callers
    /// must not rely on this having any effect.
    async fn signal_kill(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// A started remote command.
pub struct RemoteSession {
    pub events: Box<dyn SessionEvents>,
    pub control: Arc<dyn SessionControl>,
}

/// Connection accepted by a remote listener.
pub struct ForwardedStream {
    pub stream: BoxedStream,
    /// `host:port` of the party that connected, or the socket path for unix
    /// listeners.
    pub originator: String,
}

/// A remote port or socket bound on behalf of this client.
pub struct RemoteForward {
    /// What is actually bound: a TCP port of `0` is resolved to the port the
    /// remote side allocated.
    pub target: RemoteTarget,
    pub incoming: mpsc::Receiver<ForwardedStream>,
}

/// One established, authenticated multiplexed connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a channel the remote side connects to `target`.
    async fn open_direct(&self, target: &RemoteTarget) -> Result<BoxedStream>;

    /// Open a session channel and start `command` in it.
    async fn start_session(&self, command: &str) -> Result<RemoteSession>;

    /// Ask the remote side to listen on `target`.
    async fn forward(&self, target: &RemoteTarget) -> Result<RemoteForward>;

    /// Undo [`Transport::forward`]; `target` is the bound target it returned.
    async fn cancel_forward(&self, target: &RemoteTarget) -> Result<()>;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Performs the handshake that produces a [`Transport`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    /// Connect and authenticate. Failures are reported as
    /// [`Error::Connect`](super::error::Error::Connect) or
    /// [`Error::Authentication`](super::error::Error::Authentication).
    async fn connect(&self) -> Result<Self::Transport>;

    /// Endpoint label used in logs and stream addresses.
    fn endpoint(&self) -> String;
}
