//! Network primitives over a pool of SSH connections.
//!
//! The [`Dialer`] turns one endpoint into `dial`, `listen` and `exec`
//! operations that look local.
//!
//! ## Retry
//!
//! Each operation runs against a leased handle. When it fails, the error
//! kind decides what happens next:
//!
//! - **Protocol** (request refused by a healthy server): the handle goes
//!   back to the pool and the error is returned as-is.
//! - **Transport** (the connection is dead): the handle is invalidated and
//!   the operation is retried once on a freshly acquired handle. A second
//!   transport failure is returned.
//! - Handshake failures, cancellation and pool shutdown are never retried.
//!
//! ## Handle pinning
//!
//! `dial` and `exec` return their handle to the pool as soon as the channel
//! is open, since many channels share one connection. `listen` keeps its
//! handle until the listener closes, because forwarded connections arrive
//! over the connection that asked for them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{ProxyDial, SshConnector};
use super::config::{EndpointDescriptor, split_host_port};
use super::error::{Error, Result};
use super::exec::{self, command_line};
use super::listener::RemoteListener;
use super::pool::{Lease, Pool};
use super::stream::{TunnelAddr, TunnelStream};
use super::transport::{Connector, RemoteTarget, Transport};

/// Host requested from the remote side when a listen address has none.
const WILDCARD_HOST: &str = "0.0.0.0";

pub struct Dialer<C: Connector = SshConnector> {
    pool: Pool<C>,
}

impl Dialer<SshConnector> {
    /// Build a dialer from a connection URI such as
    /// `ssh://user@host:22?identity_file=~/.ssh/id_ed25519`.
    pub fn new(uri: &str) -> Result<Self> {
        let endpoint = EndpointDescriptor::parse(uri)?;
        Ok(Self::from_endpoint(endpoint, None))
    }

    /// Like [`Dialer::new`], but every connection is made over streams
    /// returned by `dial` instead of a direct TCP connection.
    pub fn with_proxy_dial(uri: &str, dial: ProxyDial) -> Result<Self> {
        let endpoint = EndpointDescriptor::parse(uri)?;
        Ok(Self::from_endpoint(endpoint, Some(dial)))
    }

    pub fn from_endpoint(endpoint: EndpointDescriptor, dial: Option<ProxyDial>) -> Self {
        let capacity = endpoint.max_connections;
        let mut connector = SshConnector::new(endpoint);
        if let Some(dial) = dial {
            connector = connector.with_proxy_dial(dial);
        }
        Self::from_connector(connector, capacity)
    }
}

impl<C: Connector> Dialer<C> {
    pub fn from_connector(connector: C, capacity: usize) -> Self {
        Self {
            pool: Pool::new(connector, capacity),
        }
    }

    pub fn pool(&self) -> &Pool<C> {
        &self.pool
    }

    /// Open a connection to `address` from the remote side.
    pub async fn dial(
        &self,
        cancel: &CancellationToken,
        network: &str,
        address: &str,
    ) -> Result<TunnelStream> {
        let target = resolve_target(network, address)?;

        let (channel, lease) = self
            .with_retry(cancel, "dial", |transport| {
                let target = target.clone();
                async move { transport.open_direct(&target).await }
            })
            .await?;
        lease.release();

        debug!("Dialed {} via {}", target, self.endpoint());
        Ok(TunnelStream::new(
            channel,
            self.local_addr(),
            TunnelAddr::new(network, target.to_string()),
            cancel.child_token(),
        ))
    }

    /// Ask the remote side to listen on `address`. An empty host means all
    /// interfaces; port `0` lets the remote side pick one.
    pub async fn listen(
        &self,
        cancel: &CancellationToken,
        network: &str,
        address: &str,
    ) -> Result<RemoteListener<C::Transport>> {
        let target = match resolve_target(network, address)? {
            RemoteTarget::Tcp { host, port } if host.is_empty() => {
                RemoteTarget::tcp(WILDCARD_HOST, port)
            }
            target => target,
        };

        let (forward, lease) = self
            .with_retry(cancel, "listen", |transport| {
                let target = target.clone();
                async move { transport.forward(&target).await }
            })
            .await?;

        info!("Listening on {} via {}", forward.target, self.endpoint());
        Ok(RemoteListener::new(lease, forward, cancel.child_token()))
    }

    /// Run `name` with `args` on the remote side. The returned stream is
    /// wired to the command's stdin and stdout; cancelling `cancel` or
    /// closing the stream tears the command down.
    pub async fn exec(
        &self,
        cancel: &CancellationToken,
        name: &str,
        args: &[&str],
    ) -> Result<TunnelStream> {
        let command = command_line(name, args);

        let (session, lease) = self
            .with_retry(cancel, "exec", |transport| {
                let command = command.clone();
                async move { transport.start_session(&command).await }
            })
            .await?;
        lease.release();

        Ok(exec::spawn(
            session,
            &command,
            self.local_addr(),
            cancel.child_token(),
        ))
    }

    /// Close idle connections and refuse new operations. Streams and
    /// listeners already handed out keep working until they are closed.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn endpoint(&self) -> String {
        self.pool.connector().endpoint()
    }

    fn local_addr(&self) -> TunnelAddr {
        TunnelAddr::new("ssh", self.endpoint())
    }

    /// Run `op` on a leased handle, retrying once on a transport failure.
    async fn with_retry<R, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        op: F,
    ) -> Result<(R, Lease<C::Transport>)>
    where
        F: Fn(Arc<C::Transport>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let backoff = ConstantBuilder::default()
            .with_delay(Duration::ZERO)
            .with_max_times(1);

        (|| async { self.attempt(cancel, &op).await })
            .retry(backoff)
            .when(Error::is_retryable)
            .notify(|err, _| {
                warn!(
                    "{} via {} failed: {}. Retrying on a new connection",
                    operation,
                    self.endpoint(),
                    err
                );
            })
            .await
    }

    async fn attempt<R, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: &F,
    ) -> Result<(R, Lease<C::Transport>)>
    where
        F: Fn(Arc<C::Transport>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let lease = self.pool.acquire(cancel).await?;
        let Some(transport) = lease.transport() else {
            return Err(Error::Closed);
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = op(transport) => result,
        };
        match result {
            Ok(value) => Ok((value, lease)),
            Err(e) if e.is_retryable() => {
                lease.invalidate().await;
                Err(e)
            }
            Err(e) => {
                lease.release();
                Err(e)
            }
        }
    }
}

/// `tcp`, `tcp4` and `tcp6` take `host:port`; `unix` takes a socket path on
/// the remote side.
fn resolve_target(network: &str, address: &str) -> Result<RemoteTarget> {
    match network {
        "tcp" | "tcp4" | "tcp6" => {
            let (host, port) = split_host_port(address)?;
            let port =
                port.ok_or_else(|| Error::config(format!("missing port in {}", address)))?;
            Ok(RemoteTarget::tcp(host, port))
        }
        "unix" if address.is_empty() => Err(Error::config("empty unix socket path")),
        "unix" => Ok(RemoteTarget::unix(address)),
        other => Err(Error::config(format!("unsupported network: {}", other))),
    }
}
