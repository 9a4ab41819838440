//! Listeners bound on the remote side of a pooled connection, on a TCP port
//! or a Unix socket path.

use std::fmt;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{Error, Result};
use super::pool::Lease;
use super::stream::{TunnelAddr, TunnelStream};
use super::transport::{ForwardedStream, RemoteForward, RemoteTarget, Transport};

/// A remote listener.
///
/// The listener pins its pooled connection: forwarded connections arrive
/// over the connection that requested the forward, so the lease is held
/// until [`RemoteListener::close`] (or drop) cancels the forward and
/// releases it. That cleanup runs exactly once.
///
/// Accepted streams live under the listener's scope: cancelling the scope
/// the listener was created with ends `accept` and every accepted stream.
/// Closing the listener leaves accepted streams open.
pub struct RemoteListener<T: Transport> {
    lease: Option<Lease<T>>,
    target: RemoteTarget,
    incoming: mpsc::Receiver<ForwardedStream>,
    scope: CancellationToken,
}

impl<T: Transport> RemoteListener<T> {
    pub(crate) fn new(lease: Lease<T>, forward: RemoteForward, scope: CancellationToken) -> Self {
        let RemoteForward { target, incoming } = forward;
        Self {
            lease: Some(lease),
            target,
            incoming,
            scope,
        }
    }

    /// Address the remote side is listening on, with the port it actually
    /// allocated for TCP listeners.
    pub fn local_addr(&self) -> TunnelAddr {
        TunnelAddr::new(self.target.network(), self.target.to_string())
    }

    /// Wait for the next forwarded connection.
    ///
    /// Cancel safe. Returns [`Error::Closed`] once the listener was closed or
    /// its connection went away, and [`Error::Cancelled`] once its scope
    /// fired.
    pub async fn accept(&mut self) -> Result<TunnelStream> {
        if self.lease.is_none() {
            return Err(Error::Closed);
        }
        let forwarded = tokio::select! {
            biased;
            _ = self.scope.cancelled() => return Err(Error::Cancelled),
            forwarded = self.incoming.recv() => forwarded.ok_or(Error::Closed)?,
        };
        debug!(
            "Accepted {} on remote listener {}",
            forwarded.originator,
            self.local_addr()
        );
        Ok(TunnelStream::new(
            forwarded.stream,
            self.local_addr(),
            TunnelAddr::new(self.target.network(), forwarded.originator),
            self.scope.child_token(),
        ))
    }

    /// Stop listening remotely and hand the connection back to the pool.
    /// Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        let Some(lease) = self.lease.take() else {
            return Ok(());
        };
        self.incoming.close();
        let result = shutdown(lease, &self.target).await;
        debug!("Remote listener {} closed", self.local_addr());
        result
    }
}

async fn shutdown<T: Transport>(lease: Lease<T>, target: &RemoteTarget) -> Result<()> {
    let result = match lease.transport() {
        Some(transport) => transport.cancel_forward(target).await,
        None => Ok(()),
    };
    lease.release();
    result
}

impl<T: Transport> Drop for RemoteListener<T> {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        let target = self.target.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = shutdown(lease, &target).await {
                        debug!("Cancelling remote listener {} failed: {}", target, e);
                    }
                });
            }
            // Lease drop alone still returns the connection
            Err(_) => warn!("Remote listener dropped outside a runtime, forward not cancelled"),
        }
    }
}

impl<T: Transport> fmt::Debug for RemoteListener<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteListener")
            .field("target", &self.target)
            .field("open", &self.lease.is_some())
            .finish()
    }
}
